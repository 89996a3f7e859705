use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::deque::BlockingDeque;
use crate::engine::IoEngine;
use crate::interface::{NetServer, ServerHandler};
use crate::message::{Kind, Message, TaggedMessage, UserId};
use crate::tcp::connection::{self, Connection};
use crate::tcp::DEFAULT_MAX_BODY_LEN;

/// The first id handed out to an accepted peer. Six digits so ids line up
///  nicely next to the server's own id in logs.
const FIRST_USER_ID: UserId = 100_000;

/// A TCP server: accepts stream connections, admits or rejects them via the
///  handler, assigns stable user ids, owns the connections, and fans
///  messages out to one or many peers.
pub struct Server<T: Kind, H: ServerHandler<T>> {
    port: u16,
    max_body_len: u32,
    handler: Arc<H>,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    registry: Arc<Mutex<FxHashMap<UserId, Connection<T>>>>,
    uid_counter: Arc<AtomicI32>,
    local_addr: Option<SocketAddr>,
    engine: Option<IoEngine>,
}

impl<T: Kind, H: ServerHandler<T>> Server<T, H> {
    pub fn new(port: u16, handler: Arc<H>) -> Server<T, H> {
        Server {
            port,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            handler,
            inbound: Arc::new(BlockingDeque::new()),
            registry: Arc::new(Mutex::new(FxHashMap::default())),
            uid_counter: Arc::new(AtomicI32::new(FIRST_USER_ID)),
            local_addr: None,
            engine: None,
        }
    }

    /// Overrides the per-frame body length cap before the server is started.
    pub fn set_max_body_len(&mut self, max_body_len: u32) {
        self.max_body_len = max_body_len;
    }

    /// The address the listener is bound to while the server runs. Useful
    ///  when the server was started on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn registry(&self) -> MutexGuard<'_, FxHashMap<UserId, Connection<T>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Kind, H: ServerHandler<T>> NetServer<T> for Server<T, H> {
    fn start(&mut self) -> bool {
        if self.engine.is_some() {
            warn!("server already running");
            return false;
        }

        let listener = match std::net::TcpListener::bind(("0.0.0.0", self.port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!("could not bind port {}: {}", self.port, e);
                return false;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            error!("could not configure listener: {}", e);
            return false;
        }
        self.local_addr = listener.local_addr().ok();

        let engine = match IoEngine::start("courier-tcp-server") {
            Ok(engine) => engine,
            Err(e) => {
                error!("could not start i/o engine: {}", e);
                return false;
            }
        };

        engine.spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.inbound.clone(),
            self.handler.clone(),
            self.uid_counter.clone(),
            self.max_body_len,
        ));
        self.engine = Some(engine);

        info!("server started on {:?}", self.local_addr);
        true
    }

    fn stop(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
            // engine shutdown closed every socket; a restarted server begins
            // with an empty peer set
            self.registry().clear();
            self.local_addr = None;
            info!("server stopped");
        }
    }

    fn message_client(&self, id: UserId, msg: Message<T>) {
        {
            let registry = self.registry();
            if let Some(conn) = registry.get(&id) {
                if conn.is_connected() {
                    conn.send(msg);
                    return;
                }
            }
        }

        // the socket is gone or the id was never there; either way the peer
        // is no longer reachable
        self.registry().remove(&id);
        debug!("[{}] removed on failed send", id);
        self.handler.on_client_disconnect(id);
    }

    fn message_all_clients(&self, msg: Message<T>, ignore: UserId) {
        let mut dead = Vec::new();
        {
            let registry = self.registry();
            for (id, conn) in registry.iter() {
                if *id == ignore {
                    continue;
                }
                if conn.is_connected() {
                    conn.send(msg.clone());
                } else {
                    dead.push(*id);
                }
            }
        }

        // sweep after the iteration so the registry is not mutated mid-walk
        if !dead.is_empty() {
            let mut registry = self.registry();
            for id in &dead {
                registry.remove(id);
            }
            drop(registry);

            for id in dead {
                debug!("[{}] removed on failed broadcast", id);
                self.handler.on_client_disconnect(id);
            }
        }
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
        write!(f, "TcpServer{{port:{}, running:{}}}", self.port, self.engine.is_some())
    }
}

impl<T: Kind, H: ServerHandler<T>> Drop for Server<T, H> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop<T: Kind, H: ServerHandler<T>>(
    listener: std::net::TcpListener,
    registry: Arc<Mutex<FxHashMap<UserId, Connection<T>>>>,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    handler: Arc<H>,
    uid_counter: Arc<AtomicI32>,
    max_body_len: u32,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not register listener with the engine: {}", e);
            return;
        }
    };

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("new connection from {}", peer);

                if handler.on_client_connect(peer) {
                    let id = uid_counter.fetch_add(1, Ordering::Relaxed);
                    let conn =
                        connection::spawn_server_side(stream, id, inbound.clone(), handler.clone(), max_body_len);
                    registry
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(id, conn);
                    info!("[{}] connection approved", id);
                } else {
                    info!("connection from {} denied", peer);
                }
            }
            Err(e) => warn!("accept failed: {}", e),
        }
    }
}
