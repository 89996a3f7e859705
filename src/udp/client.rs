use std::fmt::{Debug, Formatter};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::deque::BlockingDeque;
use crate::engine::IoEngine;
use crate::interface::NetClient;
use crate::message::{Kind, Message, TaggedMessage, SERVER_USER_ID};
use crate::scramble::scramble;
use crate::udp::{parse_frame, CONNECTION_MAGIC, MAX_DATAGRAM};

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(5000);

/// A UDP client. Registers with a server via the magic number and the
///  handshake, then exchanges framed datagrams with it. There is no teardown
///  packet in the protocol; liveness is inferred from the time since the
///  last datagram the server sent us.
pub struct Client<T: Kind> {
    timeout: Duration,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    outbound: Arc<BlockingDeque<Message<T>>>,
    send_wake: Arc<Notify>,
    last_seen: Arc<Mutex<Instant>>,
    engine: Option<IoEngine>,
}

impl<T: Kind> Default for Client<T> {
    fn default() -> Self {
        Client::new()
    }
}

impl<T: Kind> Client<T> {
    pub fn new() -> Client<T> {
        Client::with_timeout(DEFAULT_CLIENT_TIMEOUT)
    }

    /// A client that considers the server gone after `timeout` without
    ///  traffic instead of the default five seconds.
    pub fn with_timeout(timeout: Duration) -> Client<T> {
        Client {
            timeout,
            inbound: Arc::new(BlockingDeque::new()),
            outbound: Arc::new(BlockingDeque::new()),
            send_wake: Arc::new(Notify::new()),
            last_seen: Arc::new(Mutex::new(Instant::now())),
            engine: None,
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

impl<T: Kind> NetClient<T> for Client<T> {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        if self.engine.is_some() {
            self.disconnect();
        }

        let server_addr: SocketAddr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    error!("{}:{} did not resolve to any address", host, port);
                    return false;
                }
            },
            Err(e) => {
                error!("could not resolve {}:{}: {}", host, port, e);
                return false;
            }
        };

        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = match std::net::UdpSocket::bind(bind_addr) {
            Ok(socket) => socket,
            Err(e) => {
                error!("could not bind a socket: {}", e);
                return false;
            }
        };
        if let Err(e) = socket.connect(server_addr).and_then(|()| socket.set_nonblocking(true)) {
            error!("could not connect the socket to {}: {}", server_addr, e);
            return false;
        }

        let engine = match IoEngine::start("courier-udp-client") {
            Ok(engine) => engine,
            Err(e) => {
                error!("could not start i/o engine: {}", e);
                return false;
            }
        };

        // the liveness window opens now, before the server said anything
        self.touch();
        info!("connecting to {}", server_addr);

        let inbound = self.inbound.clone();
        let outbound = self.outbound.clone();
        let send_wake = self.send_wake.clone();
        let last_seen = self.last_seen.clone();
        engine.spawn(async move {
            let socket = match UdpSocket::from_std(socket) {
                Ok(socket) => socket,
                Err(e) => {
                    error!("could not register socket with the engine: {}", e);
                    return;
                }
            };
            if let Err(e) = run(socket, inbound, outbound, send_wake, last_seen).await {
                debug!("connection ended: {:#}", e);
            }
        });
        self.engine = Some(engine);
        true
    }

    fn disconnect(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
            info!("client disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        let last_seen = *self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        self.engine.is_some() && last_seen.elapsed() <= self.timeout
    }

    fn send(&self, msg: Message<T>) {
        if msg.size() > MAX_DATAGRAM {
            error!("rejecting oversize message of {} bytes (limit {})", msg.size(), MAX_DATAGRAM);
            return;
        }
        self.outbound.push_back(msg);
        self.send_wake.notify_one();
    }

    fn incoming(&self) -> &BlockingDeque<TaggedMessage<T>> {
        self.inbound.as_ref()
    }
}

impl<T: Kind> Debug for Client<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpClient{{connected:{}}}", self.is_connected())
    }
}

impl<T: Kind> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run<T: Kind>(
    socket: UdpSocket,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    outbound: Arc<BlockingDeque<Message<T>>>,
    send_wake: Arc<Notify>,
    last_seen: Arc<Mutex<Instant>>,
) -> anyhow::Result<()> {
    socket.send(&CONNECTION_MAGIC.to_be_bytes()).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];

    // registration: the next well-formed thing the server sends is the
    // challenge
    let challenge = loop {
        let len = socket.recv(&mut buf).await?;
        match <[u8; 8]>::try_from(&buf[..len]) {
            Ok(raw) => break u64::from_be_bytes(raw),
            Err(_) => trace!("ignoring {} byte datagram while awaiting the challenge", len),
        }
    };
    socket.send(&scramble(challenge).to_be_bytes()).await?;
    info!("connected to server");

    let mut out = BytesMut::new();
    loop {
        tokio::select! {
            received = socket.recv(&mut buf) => {
                let len = received?;
                match parse_frame(&buf[..len]) {
                    Some(msg) => {
                        *last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                        inbound.push_back(TaggedMessage { remote: SERVER_USER_ID, msg });
                    }
                    None => trace!("dropping malformed datagram of {} bytes", len),
                }
            }
            _ = send_wake.notified() => {
                while let Some(msg) = outbound.pop_front() {
                    out.clear();
                    msg.encode(&mut out);
                    socket.send(&out).await?;
                }
            }
        }
    }
}
