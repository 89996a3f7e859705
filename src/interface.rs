use std::net::SocketAddr;

use crate::deque::BlockingDeque;
use crate::message::{Kind, Message, TaggedMessage, UserId};

/// The operations a server exposes to application code. Implemented by both
///  [crate::tcp::Server] and [crate::udp::Server].
pub trait NetServer<T: Kind> {
    /// Starts listening on the configured port and launches the I/O engine.
    ///  Returns whether the server came up.
    fn start(&mut self) -> bool;

    /// Shuts the I/O engine down and joins its worker thread. The server can
    ///  be started again afterwards.
    fn stop(&mut self);

    /// Sends a message to a single connected user.
    fn message_client(&self, id: UserId, msg: Message<T>);

    /// Sends a copy of the message to every connected user except `ignore`
    ///  (pass [crate::INVALID_USER_ID] to ignore nobody).
    fn message_all_clients(&self, msg: Message<T>, ignore: UserId);

    /// Drains up to `max_messages` received messages, dispatching each to
    ///  [ServerHandler::on_message] on the calling thread. With `wait` the
    ///  call blocks until at least one message is available.
    fn update(&self, max_messages: usize, wait: bool);
}

/// The operations a client exposes to application code. Implemented by both
///  [crate::tcp::Client] and [crate::udp::Client].
pub trait NetClient<T: Kind> {
    /// Resolves `host:port` and launches the I/O engine. Returns whether the
    ///  engine came up; the connection itself completes asynchronously and
    ///  failures surface through [NetClient::is_connected].
    fn connect(&mut self, host: &str, port: u16) -> bool;

    /// Drops the connection and joins the I/O engine.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Sends a message to the server. A no-op when not connected.
    fn send(&self, msg: Message<T>);

    /// The queue where received messages accumulate until the application
    ///  drains them.
    fn incoming(&self) -> &BlockingDeque<TaggedMessage<T>>;
}

/// Policy callbacks a server application implements; passed to the server as
///  a strategy object.
///
/// [ServerHandler::on_message] runs on the application thread (inside
///  [NetServer::update]); the other three run on the server's I/O engine
///  thread and should return quickly.
pub trait ServerHandler<T: Kind>: Send + Sync + 'static {
    /// Admission control for a peer that wants to connect; return `false` to
    ///  reject it.
    fn on_client_connect(&self, addr: SocketAddr) -> bool;

    /// Called once when a peer completes the handshake.
    fn on_client_validate(&self, id: UserId);

    /// Called once when a peer is removed from the registry, whether it was
    ///  detected dead on a send or reaped by a liveness timeout.
    fn on_client_disconnect(&self, id: UserId);

    /// Called for every received message drained by [NetServer::update].
    fn on_message(&self, id: UserId, msg: Message<T>);
}
