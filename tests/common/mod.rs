use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use courier::{Message, ServerHandler, UserId};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum MsgKind {
    Ping,
    MessageAll,
    ClientDisconnect,
}

/// Records every callback so tests can assert on what the server saw.
#[derive(Default)]
pub struct RecordingHandler {
    pub connect_requests: Mutex<Vec<SocketAddr>>,
    pub validated: Mutex<Vec<UserId>>,
    pub disconnected: Mutex<Vec<UserId>>,
    pub received: Mutex<Vec<(UserId, Message<MsgKind>)>>,
}

impl RecordingHandler {
    pub fn validated_ids(&self) -> Vec<UserId> {
        self.validated.lock().unwrap().clone()
    }

    pub fn disconnected_ids(&self) -> Vec<UserId> {
        self.disconnected.lock().unwrap().clone()
    }

    pub fn take_received(&self) -> Vec<(UserId, Message<MsgKind>)> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }
}

impl ServerHandler<MsgKind> for RecordingHandler {
    fn on_client_connect(&self, addr: SocketAddr) -> bool {
        self.connect_requests.lock().unwrap().push(addr);
        true
    }

    fn on_client_validate(&self, id: UserId) {
        self.validated.lock().unwrap().push(id);
    }

    fn on_client_disconnect(&self, id: UserId) {
        self.disconnected.lock().unwrap().push(id);
    }

    fn on_message(&self, id: UserId, msg: Message<MsgKind>) {
        self.received.lock().unwrap().push((id, msg));
    }
}

/// Polls `condition` until it holds or the deadline passes.
pub fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub const WAIT: Duration = Duration::from_secs(10);
