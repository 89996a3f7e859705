use std::fmt::{Debug, Formatter};
use std::net::ToSocketAddrs;
use std::sync::Arc;

use tracing::{error, info};

use crate::deque::BlockingDeque;
use crate::engine::IoEngine;
use crate::interface::NetClient;
use crate::message::{Kind, Message, TaggedMessage};
use crate::tcp::connection::{self, Connection};
use crate::tcp::DEFAULT_MAX_BODY_LEN;

/// A TCP client: owns a single outbound stream connection and exposes
///  send/receive to the application.
pub struct Client<T: Kind> {
    max_body_len: u32,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    connection: Option<Connection<T>>,
    engine: Option<IoEngine>,
}

impl<T: Kind> Default for Client<T> {
    fn default() -> Self {
        Client::new()
    }
}

impl<T: Kind> Client<T> {
    pub fn new() -> Client<T> {
        Client {
            max_body_len: DEFAULT_MAX_BODY_LEN,
            inbound: Arc::new(BlockingDeque::new()),
            connection: None,
            engine: None,
        }
    }

    /// Overrides the per-frame body length cap before connecting.
    pub fn set_max_body_len(&mut self, max_body_len: u32) {
        self.max_body_len = max_body_len;
    }
}

impl<T: Kind> NetClient<T> for Client<T> {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        if self.engine.is_some() {
            self.disconnect();
        }

        let addrs: Vec<_> = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                error!("could not resolve {}:{}: {}", host, port, e);
                return false;
            }
        };
        if addrs.is_empty() {
            error!("{}:{} did not resolve to any address", host, port);
            return false;
        }

        let engine = match IoEngine::start("courier-tcp-client") {
            Ok(engine) => engine,
            Err(e) => {
                error!("could not start i/o engine: {}", e);
                return false;
            }
        };

        info!("connecting to {}:{}", host, port);
        self.connection = Some(connection::spawn_client_side(
            &engine,
            addrs,
            self.inbound.clone(),
            self.max_body_len,
        ));
        self.engine = Some(engine);
        true
    }

    fn disconnect(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
            self.connection = None;
            info!("client disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_connected())
    }

    fn send(&self, msg: Message<T>) {
        if let Some(conn) = &self.connection {
            conn.send(msg);
        }
    }

    fn incoming(&self) -> &BlockingDeque<TaggedMessage<T>> {
        self.inbound.as_ref()
    }
}

impl<T: Kind> Debug for Client<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpClient{{connected:{}}}", self.is_connected())
    }
}

impl<T: Kind> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
