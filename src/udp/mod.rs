pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

use crate::message::{decode_header, Kind, Message, HEADER_LEN};

/// Largest total message size (header plus body) that fits in one datagram.
///  Oversize messages are rejected at the send site, nothing goes on the
///  wire.
pub const MAX_DATAGRAM: usize = 64_000;

/// First datagram a client sends to register with a server. Doubles as the
///  protocol version tag, together with the scramble offset.
pub const CONNECTION_MAGIC: u64 = 0x26E5_5500;

/// Parses one datagram as a framed message. `None` for anything malformed:
///  truncated header, body length not matching the datagram, unknown kind.
pub(crate) fn parse_frame<T: Kind>(datagram: &[u8]) -> Option<Message<T>> {
    if datagram.len() < HEADER_LEN {
        return None;
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&datagram[..HEADER_LEN]);
    let (raw_kind, body_len) = decode_header(header);

    if datagram.len() - HEADER_LEN != body_len as usize {
        return None;
    }

    Message::from_wire(raw_kind, datagram[HEADER_LEN..].to_vec())
}
