use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::deque::BlockingDeque;
use crate::engine::IoEngine;
use crate::interface::ServerHandler;
use crate::message::{decode_header, Kind, Message, TaggedMessage, UserId, HEADER_LEN, SERVER_USER_ID};
use crate::scramble::{fresh_challenge, scramble};

/// Handle to one live stream connection. The sockets live inside engine
///  tasks; this handle is what the owning server/client keeps in order to
///  post outbound messages and observe liveness.
pub(crate) struct Connection<T: Kind> {
    outbound: Arc<BlockingDeque<Message<T>>>,
    writer_wake: Arc<Notify>,
    connected: Arc<AtomicBool>,
}

impl<T: Kind> Connection<T> {
    fn new(connected: bool) -> Connection<T> {
        Connection {
            outbound: Arc::new(BlockingDeque::new()),
            writer_wake: Arc::new(Notify::new()),
            connected: Arc::new(AtomicBool::new(connected)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queues a message for transmission and pokes the write chain. The
    ///  queue is the only cross-thread handoff; the socket itself is touched
    ///  exclusively by the engine.
    pub fn send(&self, msg: Message<T>) {
        if self.is_connected() {
            self.outbound.push_back(msg);
            self.writer_wake.notify_one();
        }
    }
}

/// Takes ownership of a freshly accepted socket and drives the server side
///  of the connection: challenge out, response in, then framed messages both
///  ways. Must be called from within the server's engine.
pub(crate) fn spawn_server_side<T: Kind, H: ServerHandler<T>>(
    stream: TcpStream,
    id: UserId,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    handler: Arc<H>,
    max_body_len: u32,
) -> Connection<T> {
    let conn = Connection::new(true);

    let outbound = conn.outbound.clone();
    let writer_wake = conn.writer_wake.clone();
    let connected = conn.connected.clone();
    tokio::spawn(async move {
        if let Err(e) = run_server_side(stream, id, inbound, outbound, writer_wake, handler, max_body_len).await {
            debug!("[{}] connection closed: {:#}", id, e);
        }
        connected.store(false, Ordering::Release);
    });

    conn
}

/// Starts the client side on the given engine: async connect across the
///  candidate addresses, await the server's challenge, answer it, then
///  exchange framed messages.
pub(crate) fn spawn_client_side<T: Kind>(
    engine: &IoEngine,
    addrs: Vec<SocketAddr>,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    max_body_len: u32,
) -> Connection<T> {
    let conn = Connection::new(false);

    let outbound = conn.outbound.clone();
    let writer_wake = conn.writer_wake.clone();
    let connected = conn.connected.clone();
    engine.spawn(async move {
        let stream = match connect_any(&addrs).await {
            Some(stream) => stream,
            None => return,
        };
        connected.store(true, Ordering::Release);

        if let Err(e) = run_client_side(stream, inbound, outbound, writer_wake, max_body_len).await {
            debug!("connection to server closed: {:#}", e);
        }
        connected.store(false, Ordering::Release);
    });

    conn
}

async fn connect_any(addrs: &[SocketAddr]) -> Option<TcpStream> {
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Some(stream),
            Err(e) => warn!("connect to {} failed: {}", addr, e),
        }
    }
    None
}

async fn run_server_side<T: Kind, H: ServerHandler<T>>(
    mut stream: TcpStream,
    id: UserId,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    outbound: Arc<BlockingDeque<Message<T>>>,
    writer_wake: Arc<Notify>,
    handler: Arc<H>,
    max_body_len: u32,
) -> anyhow::Result<()> {
    let challenge = fresh_challenge();
    let expected = scramble(challenge);

    stream.write_all(&challenge.to_be_bytes()).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if u64::from_be_bytes(reply) != expected {
        bail!("handshake mismatch");
    }

    info!("[{}] client validated", id);
    handler.on_client_validate(id);

    pump(stream, id, inbound, outbound, writer_wake, max_body_len).await
}

async fn run_client_side<T: Kind>(
    mut stream: TcpStream,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    outbound: Arc<BlockingDeque<Message<T>>>,
    writer_wake: Arc<Notify>,
    max_body_len: u32,
) -> anyhow::Result<()> {
    let mut challenge = [0u8; 8];
    stream.read_exact(&mut challenge).await?;

    let response = scramble(u64::from_be_bytes(challenge));
    stream.write_all(&response.to_be_bytes()).await?;
    debug!("handshake response sent");

    pump(stream, SERVER_USER_ID, inbound, outbound, writer_wake, max_body_len).await
}

/// Steady state: the read loop and the write chain race inside one task;
///  whichever fails first tears both halves down, closing the socket.
async fn pump<T: Kind>(
    stream: TcpStream,
    remote: UserId,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    outbound: Arc<BlockingDeque<Message<T>>>,
    writer_wake: Arc<Notify>,
    max_body_len: u32,
) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();

    tokio::select! {
        result = read_loop(read_half, remote, inbound, max_body_len) => result,
        result = write_chain(write_half, outbound, writer_wake) => result,
    }
}

async fn read_loop<T: Kind>(
    mut read_half: OwnedReadHalf,
    remote: UserId,
    inbound: Arc<BlockingDeque<TaggedMessage<T>>>,
    max_body_len: u32,
) -> anyhow::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    loop {
        read_half.read_exact(&mut header).await?;
        let (raw_kind, body_len) = decode_header(header);

        if body_len > max_body_len {
            bail!("peer announced a body of {} bytes, above the cap of {}", body_len, max_body_len);
        }

        let mut body = vec![0u8; body_len as usize];
        read_half.read_exact(&mut body).await?;

        match Message::from_wire(raw_kind, body) {
            Some(msg) => inbound.push_back(TaggedMessage { remote, msg }),
            None => bail!("peer sent unknown message kind {}", raw_kind),
        }
    }
}

/// The one write chain of the connection: drains the outbound queue in FIFO
///  order, one frame at a time, sleeping on the wake notify in between.
async fn write_chain<T: Kind>(
    mut write_half: OwnedWriteHalf,
    outbound: Arc<BlockingDeque<Message<T>>>,
    writer_wake: Arc<Notify>,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    loop {
        let msg = loop {
            match outbound.pop_front() {
                Some(msg) => break msg,
                None => writer_wake.notified().await,
            }
        };

        buf.clear();
        buf.reserve(msg.size());
        msg.encode(&mut buf);
        write_half.write_all(&buf).await?;
    }
}


#[cfg(test)]
mod test {
    use num_enum::{IntoPrimitive, TryFromPrimitive};

    use super::*;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
    #[repr(u32)]
    enum TestKind {
        One,
        Two,
    }

    struct NopHandler;
    impl ServerHandler<TestKind> for NopHandler {
        fn on_client_connect(&self, _addr: SocketAddr) -> bool {
            true
        }
        fn on_client_validate(&self, _id: UserId) {}
        fn on_client_disconnect(&self, _id: UserId) {}
        fn on_message(&self, _id: UserId, _msg: Message<TestKind>) {}
    }

    async fn await_len<T: Kind>(deque: &BlockingDeque<TaggedMessage<T>>, len: usize) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while deque.len() < len {
            assert!(std::time::Instant::now() < deadline, "messages never arrived");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// Drives both connection roles against each other over a loopback
    ///  socket pair and checks that frames arrive intact and in send order.
    #[tokio::test]
    async fn test_handshake_and_ordered_frames() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_stream, client_stream) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { tokio::net::TcpStream::connect(addr).await.unwrap() }
        );

        let server_inbound: Arc<BlockingDeque<TaggedMessage<TestKind>>> = Arc::new(BlockingDeque::new());
        let client_inbound: Arc<BlockingDeque<TaggedMessage<TestKind>>> = Arc::new(BlockingDeque::new());

        let server_conn =
            spawn_server_side(server_stream, 100_000, server_inbound.clone(), Arc::new(NopHandler), u32::MAX);

        let client_outbound: Arc<BlockingDeque<Message<TestKind>>> = Arc::new(BlockingDeque::new());
        let client_wake = Arc::new(Notify::new());
        {
            let inbound = client_inbound.clone();
            let outbound = client_outbound.clone();
            let wake = client_wake.clone();
            tokio::spawn(async move {
                let _ = run_client_side(client_stream, inbound, outbound, wake, u32::MAX).await;
            });
        }

        // client to server, three messages in order
        for i in 0..3i32 {
            let mut msg = Message::new(TestKind::One);
            msg.push(i);
            client_outbound.push_back(msg);
            client_wake.notify_one();
        }

        await_len(&server_inbound, 3).await;
        for i in 0..3i32 {
            let mut tagged = server_inbound.pop_front().unwrap();
            assert_eq!(tagged.remote, 100_000);
            assert_eq!(tagged.msg.kind(), TestKind::One);
            assert_eq!(tagged.msg.pop::<i32>(), i);
        }

        // server to client
        let mut msg = Message::new(TestKind::Two);
        msg.push(7u64);
        server_conn.send(msg);

        await_len(&client_inbound, 1).await;
        let mut tagged = client_inbound.pop_front().unwrap();
        assert_eq!(tagged.remote, SERVER_USER_ID);
        assert_eq!(tagged.msg.kind(), TestKind::Two);
        assert_eq!(tagged.msg.pop::<u64>(), 7);
    }

    /// A wrong handshake response must close the socket without a validate
    ///  callback.
    #[tokio::test]
    async fn test_handshake_mismatch_closes_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_stream, mut client_stream) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { tokio::net::TcpStream::connect(addr).await.unwrap() }
        );

        let inbound: Arc<BlockingDeque<TaggedMessage<TestKind>>> = Arc::new(BlockingDeque::new());
        let conn = spawn_server_side(server_stream, 100_000, inbound, Arc::new(NopHandler), u32::MAX);

        let mut challenge = [0u8; 8];
        client_stream.read_exact(&mut challenge).await.unwrap();
        let wrong = scramble(u64::from_be_bytes(challenge)) ^ 1;
        client_stream.write_all(&wrong.to_be_bytes()).await.unwrap();

        // the server side must drop the socket; the read then sees EOF
        let mut buf = [0u8; 1];
        match client_stream.read(&mut buf).await {
            Ok(0) | Err(_) => {}
            Ok(_) => panic!("unexpected data after failed handshake"),
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while conn.is_connected() {
            assert!(std::time::Instant::now() < deadline, "connection never marked dead");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
