use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{error, info, trace, warn};

use crate::deque::BlockingDeque;
use crate::engine::IoEngine;
use crate::interface::{NetServer, ServerHandler};
use crate::message::{Kind, Message, TaggedMessage, UserId};
use crate::scramble::{fresh_challenge, scramble};
use crate::udp::{parse_frame, CONNECTION_MAGIC, MAX_DATAGRAM};

const FIRST_USER_ID: UserId = 100_000;

pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_millis(5000);

/// A UDP server. One socket serves all peers; datagrams are demultiplexed by
///  their source endpoint, unknown endpoints go through magic-number
///  admission and a handshake, and peers that stay silent past the timeout
///  are reaped.
pub struct Server<T: Kind, H: ServerHandler<T>> {
    port: u16,
    timeout: Duration,
    handler: Arc<H>,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    outbound: Arc<BlockingDeque<Outbound<T>>>,
    send_wake: Arc<Notify>,
    uid_counter: Arc<AtomicI32>,
    local_addr: Option<SocketAddr>,
    engine: Option<IoEngine>,
}

/// One application-posted send, drained by the engine task. Broadcasts are
///  expanded against the user table at drain time, one cloned datagram per
///  recipient.
enum Outbound<T: Kind> {
    Direct(UserId, Message<T>),
    Broadcast(Message<T>, UserId),
}

/// What the server remembers about one peer. The endpoint map and the user
///  map always cover the same set of live peers.
struct UdpUser {
    endpoint: SocketAddr,
    last_seen: Instant,
    validated: bool,
    handshake_expected: u64,
}

impl<T: Kind, H: ServerHandler<T>> Server<T, H> {
    pub fn new(port: u16, handler: Arc<H>) -> Server<T, H> {
        Server::with_timeout(port, handler, DEFAULT_SERVER_TIMEOUT)
    }

    /// A server that reaps peers after `timeout` without traffic instead of
    ///  the default five seconds.
    pub fn with_timeout(port: u16, handler: Arc<H>, timeout: Duration) -> Server<T, H> {
        Server {
            port,
            timeout,
            handler,
            inbound: Arc::new(BlockingDeque::new()),
            outbound: Arc::new(BlockingDeque::new()),
            send_wake: Arc::new(Notify::new()),
            uid_counter: Arc::new(AtomicI32::new(FIRST_USER_ID)),
            local_addr: None,
            engine: None,
        }
    }

    /// The address the socket is bound to while the server runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn post(&self, item: Outbound<T>, size: usize) {
        if size > MAX_DATAGRAM {
            error!("rejecting oversize message of {} bytes (limit {})", size, MAX_DATAGRAM);
            return;
        }
        self.outbound.push_back(item);
        self.send_wake.notify_one();
    }
}

impl<T: Kind, H: ServerHandler<T>> NetServer<T> for Server<T, H> {
    fn start(&mut self) -> bool {
        if self.engine.is_some() {
            warn!("server already running");
            return false;
        }

        let socket = match std::net::UdpSocket::bind(("0.0.0.0", self.port)) {
            Ok(socket) => socket,
            Err(e) => {
                error!("could not bind port {}: {}", self.port, e);
                return false;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            error!("could not configure socket: {}", e);
            return false;
        }
        self.local_addr = socket.local_addr().ok();

        let engine = match IoEngine::start("courier-udp-server") {
            Ok(engine) => engine,
            Err(e) => {
                error!("could not start i/o engine: {}", e);
                return false;
            }
        };

        let task = ServerTask {
            timeout: self.timeout,
            handler: self.handler.clone(),
            inbound: self.inbound.clone(),
            outbound: self.outbound.clone(),
            send_wake: self.send_wake.clone(),
            uid_counter: self.uid_counter.clone(),
            endpoint_to_id: FxHashMap::default(),
            users: FxHashMap::default(),
        };
        engine.spawn(async move {
            let socket = match UdpSocket::from_std(socket) {
                Ok(socket) => socket,
                Err(e) => {
                    error!("could not register socket with the engine: {}", e);
                    return;
                }
            };
            task.run(socket).await;
        });
        self.engine = Some(engine);

        info!("server started on {:?}", self.local_addr);
        true
    }

    fn stop(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
            self.local_addr = None;
            info!("server stopped");
        }
    }

    fn message_client(&self, id: UserId, msg: Message<T>) {
        let size = msg.size();
        self.post(Outbound::Direct(id, msg), size);
    }

    fn message_all_clients(&self, msg: Message<T>, ignore: UserId) {
        let size = msg.size();
        self.post(Outbound::Broadcast(msg, ignore), size);
    }

    fn update(&self, max_messages: usize, wait: bool) {
        if wait {
            self.inbound.wait();
        }

        let mut processed = 0;
        while processed < max_messages {
            match self.inbound.pop_front() {
                Some(tagged) => {
                    self.handler.on_message(tagged.remote, tagged.msg);
                    processed += 1;
                }
                None => break,
            }
        }
    }
}

impl<T: Kind, H: ServerHandler<T>> Debug for Server<T, H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpServer{{port:{}, running:{}}}", self.port, self.engine.is_some())
    }
}

impl<T: Kind, H: ServerHandler<T>> Drop for Server<T, H> {
    fn drop(&mut self) {
        self.stop();
    }
}


/// All per-peer state lives here, owned by the single engine task. No locks:
///  receive handling, outbound drains and the reaper all run on the engine
///  thread.
struct ServerTask<T: Kind, H: ServerHandler<T>> {
    timeout: Duration,
    handler: Arc<H>,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    outbound: Arc<BlockingDeque<Outbound<T>>>,
    send_wake: Arc<Notify>,
    uid_counter: Arc<AtomicI32>,
    endpoint_to_id: FxHashMap<SocketAddr, UserId>,
    users: FxHashMap<UserId, UdpUser>,
}

impl<T: Kind, H: ServerHandler<T>> ServerTask<T, H> {
    async fn run(mut self, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            self.reap_expired_users();
                            self.dispatch(&socket, &buf[..len], from).await;
                        }
                        Err(e) => warn!("receive failed: {}", e),
                    }
                }
                _ = self.send_wake.notified() => {
                    self.drain_outbound(&socket).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, socket: &UdpSocket, datagram: &[u8], from: SocketAddr) {
        match self.endpoint_to_id.get(&from).copied() {
            None => self.handle_connection_request(socket, datagram, from).await,
            Some(id) => {
                let validated = self.users.get(&id).map(|u| u.validated).unwrap_or(false);
                if validated {
                    self.process_frame(id, datagram);
                } else {
                    self.handle_validation(id, from, datagram);
                }
            }
        }
    }

    /// A datagram from an endpoint we know nothing about. Anything but a
    ///  well-formed connection request is dropped without a trace, so
    ///  scanners learn nothing.
    async fn handle_connection_request(&mut self, socket: &UdpSocket, datagram: &[u8], from: SocketAddr) {
        let magic = match <[u8; 8]>::try_from(datagram) {
            Ok(raw) => u64::from_be_bytes(raw),
            Err(_) => return,
        };
        if magic != CONNECTION_MAGIC {
            return;
        }

        if !self.handler.on_client_connect(from) {
            info!("connection from {} denied", from);
            return;
        }

        let id = self.uid_counter.fetch_add(1, Ordering::Relaxed);
        let challenge = fresh_challenge();

        self.endpoint_to_id.insert(from, id);
        self.users.insert(
            id,
            UdpUser {
                endpoint: from,
                last_seen: Instant::now(),
                validated: false,
                handshake_expected: scramble(challenge),
            },
        );
        info!("[{}] connection approved", id);

        if let Err(e) = socket.send_to(&challenge.to_be_bytes(), from).await {
            warn!("[{}] sending the challenge failed: {}", id, e);
        }
    }

    /// The peer answered the challenge. A wrong or malformed reply evicts
    ///  the half-open user; it was never validated, so no disconnect
    ///  callback fires.
    fn handle_validation(&mut self, id: UserId, from: SocketAddr, datagram: &[u8]) {
        let reply = <[u8; 8]>::try_from(datagram).ok().map(u64::from_be_bytes);
        let expected = self.users.get(&id).map(|u| u.handshake_expected);

        if reply.is_none() || reply != expected {
            info!("[{}] handshake failed", id);
            self.endpoint_to_id.remove(&from);
            self.users.remove(&id);
            return;
        }

        if let Some(user) = self.users.get_mut(&id) {
            user.validated = true;
            user.last_seen = Instant::now();
        }
        info!("[{}] client validated", id);
        self.handler.on_client_validate(id);
    }

    fn process_frame(&mut self, id: UserId, datagram: &[u8]) {
        match parse_frame(datagram) {
            Some(msg) => {
                if let Some(user) = self.users.get_mut(&id) {
                    user.last_seen = Instant::now();
                }
                self.inbound.push_back(TaggedMessage { remote: id, msg });
            }
            None => trace!("[{}] dropping malformed datagram", id),
        }
    }

    async fn drain_outbound(&mut self, socket: &UdpSocket) {
        while let Some(item) = self.outbound.pop_front() {
            self.reap_expired_users();
            match item {
                Outbound::Direct(id, msg) => self.send_to_user(socket, id, &msg).await,
                Outbound::Broadcast(msg, ignore) => {
                    let recipients: Vec<UserId> =
                        self.users.keys().copied().filter(|id| *id != ignore).collect();
                    for id in recipients {
                        self.send_to_user(socket, id, &msg).await;
                    }
                }
            }
        }
    }

    /// Serializes one datagram for one recipient. A recipient that vanished
    ///  between posting and draining is skipped; the reaper already reported
    ///  it.
    async fn send_to_user(&self, socket: &UdpSocket, id: UserId, msg: &Message<T>) {
        let user = match self.users.get(&id) {
            Some(user) => user,
            None => return,
        };

        let mut buf = BytesMut::with_capacity(msg.size());
        msg.encode(&mut buf);

        if let Err(e) = socket.send_to(&buf, user.endpoint).await {
            warn!("[{}] send failed: {}", id, e);
        }
    }

    /// Removes every user that has been silent past the timeout, then
    ///  reports them. The two-phase sweep keeps the callbacks from seeing a
    ///  half-updated table.
    fn reap_expired_users(&mut self) {
        let now = Instant::now();
        let expired: Vec<UserId> = self
            .users
            .iter()
            .filter(|(_, user)| now.duration_since(user.last_seen) > self.timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(user) = self.users.remove(id) {
                self.endpoint_to_id.remove(&user.endpoint);
                info!("[{}] client timed out", id);
            }
        }
        for id in expired {
            self.handler.on_client_disconnect(id);
        }
    }
}
