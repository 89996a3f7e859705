use std::fmt::{Debug, Formatter};

use bytemuck::Pod;
use bytes::{Buf, BufMut, BytesMut};

/// Identifies a user on a server. The server itself is `0`, connected peers get
///  positive ids allocated from a monotonic counter.
pub type UserId = i32;

/// Placeholder for a user id that has not been assigned (yet).
pub const INVALID_USER_ID: UserId = -1;

/// The well-known id of the server side of a connection.
pub const SERVER_USER_ID: UserId = 0;

/// Marker trait for application-defined message kinds.
///
/// A kind space is a closed `u32`-backed enumeration; deriving
///  `num_enum::IntoPrimitive` and `num_enum::TryFromPrimitive` on a
///  `#[repr(u32)]` enum is the intended way to get these bounds. The library
///  never interprets kind values, it only copies them into and out of headers.
pub trait Kind: Copy + Send + Sync + 'static + Into<u32> + TryFrom<u32> {}

impl<T> Kind for T where T: Copy + Send + Sync + 'static + Into<u32> + TryFrom<u32> {}


/// Number of bytes a message header occupies on the wire: a 4-byte kind
///  followed by a 4-byte body length.
pub const HEADER_LEN: usize = 8;


/// A typed, length-prefixed message: the unit of transfer on every connection.
///
/// The body is a flat byte buffer with stack discipline: [Message::push]
///  appends the byte image of a fixed-layout value, [Message::pop] removes the
///  most recently pushed one. The header's length field always equals the body
///  length.
#[derive(Clone, PartialEq)]
pub struct Message<T: Kind> {
    kind: T,
    body: Vec<u8>,
}

impl<T: Kind> Message<T> {
    /// An empty message of the given kind.
    pub fn new(kind: T) -> Message<T> {
        Message { kind, body: Vec::new() }
    }

    pub fn kind(&self) -> T {
        self.kind
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Total wire size of the message, header included.
    pub fn size(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Appends the raw byte image of a fixed-layout value to the body.
    ///
    /// This is deliberately a byte-identity serializer: no byte order
    ///  translation is applied to the payload, so peers on architectures with
    ///  different endianness must agree on a representation themselves.
    pub fn push<U: Pod>(&mut self, value: U) {
        debug_assert!(
            self.body.len() + size_of::<U>() <= u32::MAX as usize,
            "message body length no longer fits the header"
        );
        self.body.extend_from_slice(bytemuck::bytes_of(&value));
    }

    /// Removes the trailing `size_of::<U>()` bytes of the body and returns
    ///  them reinterpreted as `U`. Values come back in reverse push order.
    ///
    /// Panics when the body holds fewer bytes than `U` occupies; that is a
    ///  programming error on the caller's side.
    pub fn pop<U: Pod>(&mut self) -> U {
        assert!(
            self.body.len() >= size_of::<U>(),
            "pop of {} bytes exceeds message body of {} bytes",
            size_of::<U>(),
            self.body.len()
        );
        let split = self.body.len() - size_of::<U>();
        let value = bytemuck::pod_read_unaligned(&self.body[split..]);
        self.body.truncate(split);
        value
    }

    /// Serializes header and body into `buf`. The kind travels in the host's
    ///  byte order (both sides interpret it through the shared enumeration),
    ///  the length field is normalized to big-endian so it can be parsed
    ///  before the kind is looked at.
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_ne(self.kind.into());
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Rebuilds a message from a decoded header and its body bytes. `None`
    ///  when the raw kind is not part of the application's enumeration.
    pub(crate) fn from_wire(raw_kind: u32, body: Vec<u8>) -> Option<Message<T>> {
        let kind = T::try_from(raw_kind).ok()?;
        Some(Message { kind, body })
    }
}

/// Splits the 8 header bytes into the raw kind value and the body length.
pub(crate) fn decode_header(raw: [u8; HEADER_LEN]) -> (u32, u32) {
    let mut buf = &raw[..];
    let raw_kind = buf.get_u32_ne();
    let body_len = buf.get_u32();
    (raw_kind, body_len)
}

impl<T: Kind> Debug for Message<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let raw: u32 = self.kind.into();
        write!(f, "Message{{kind:{}, size:{}}}", raw, self.size())
    }
}


/// An incoming message together with the id of the remote user it came from.
///  Produced only by the receive paths.
#[derive(Clone, PartialEq)]
pub struct TaggedMessage<T: Kind> {
    pub remote: UserId,
    pub msg: Message<T>,
}

impl<T: Kind> Debug for TaggedMessage<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedMessage{{remote:{}, msg:{:?}}}", self.remote, self.msg)
    }
}


#[cfg(test)]
mod test {
    use bytemuck::{Pod, Zeroable};
    use num_enum::{IntoPrimitive, TryFromPrimitive};
    use rstest::rstest;

    use super::*;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
    #[repr(u32)]
    enum TestKind {
        Ping,
        Payload,
    }

    #[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Sample {
        a: u32,
        b: f32,
    }

    #[test]
    fn test_push_pop_round_trip() {
        let mut msg = Message::new(TestKind::Payload);
        msg.push(42i32);
        msg.push(2.5f64);
        msg.push(Sample { a: 7, b: -1.0 });

        assert_eq!(msg.pop::<Sample>(), Sample { a: 7, b: -1.0 });
        assert_eq!(msg.pop::<f64>(), 2.5);
        assert_eq!(msg.pop::<i32>(), 42);

        assert_eq!(msg.body().len(), 0);
        assert_eq!(msg.size(), HEADER_LEN);
    }

    #[test]
    fn test_push_array() {
        let mut msg = Message::new(TestKind::Payload);
        msg.push([1u8, 2, 3, 4]);
        assert_eq!(msg.body(), &[1, 2, 3, 4]);
        assert_eq!(msg.pop::<[u8; 4]>(), [1, 2, 3, 4]);
    }

    #[rstest]
    #[case::empty(&[], HEADER_LEN)]
    #[case::one_int(&[4], HEADER_LEN + 4)]
    #[case::three_ints(&[1, 2, 3], HEADER_LEN + 12)]
    fn test_header_accounting(#[case] values: &[i32], #[case] expected_size: usize) {
        let mut msg = Message::new(TestKind::Payload);
        for &v in values {
            msg.push(v);
        }
        assert_eq!(msg.size(), expected_size);
        assert_eq!(msg.body().len(), expected_size - HEADER_LEN);
    }

    #[test]
    fn test_pop_recovers_byte_image() {
        let mut msg = Message::new(TestKind::Payload);
        let values = [0x1122_3344u32, 0xDEAD_BEEF, 7];
        for v in values {
            msg.push(v);
        }
        for v in values.iter().rev() {
            assert_eq!(msg.pop::<u32>(), *v);
        }
        assert_eq!(msg.size(), HEADER_LEN);
    }

    #[test]
    #[should_panic(expected = "exceeds message body")]
    fn test_pop_beyond_body_panics() {
        let mut msg = Message::new(TestKind::Ping);
        msg.push(1u16);
        let _ = msg.pop::<u64>();
    }

    #[test]
    fn test_encode_layout() {
        let mut msg = Message::new(TestKind::Payload);
        msg.push(0xABu8);

        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_LEN + 1);
        assert_eq!(&buf[..4], &1u32.to_ne_bytes());
        assert_eq!(&buf[4..8], &1u32.to_be_bytes());
        assert_eq!(buf[8], 0xAB);
    }

    #[test]
    fn test_decode_header_matches_encode() {
        let mut msg = Message::new(TestKind::Ping);
        msg.push(3.25f32);

        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&buf[..HEADER_LEN]);
        let (raw_kind, body_len) = decode_header(header);

        assert_eq!(raw_kind, 0);
        assert_eq!(body_len, 4);
        assert_eq!(Message::<TestKind>::from_wire(raw_kind, buf[HEADER_LEN..].to_vec()), Some(msg));
    }

    #[test]
    fn test_from_wire_rejects_unknown_kind() {
        assert_eq!(Message::<TestKind>::from_wire(999, Vec::new()), None);
    }

    #[test]
    fn test_message_through_deque() {
        let deque = crate::deque::BlockingDeque::new();

        let mut msg = Message::new(TestKind::Payload);
        msg.push(1.0f64);
        msg.push(2.0f64);
        deque.push_back(msg);

        let mut msg = deque.pop_front().unwrap();
        assert_eq!(msg.size(), HEADER_LEN + 16);
        assert_eq!(msg.pop::<f64>(), 2.0);
        assert_eq!(msg.pop::<f64>(), 1.0);
        assert_eq!(msg.size(), HEADER_LEN);
    }
}
