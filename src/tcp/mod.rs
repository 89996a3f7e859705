pub mod client;
pub mod server;

mod connection;

pub use client::Client;
pub use server::Server;

/// Ceiling for the body length a peer may announce in a frame header. A
///  larger announcement is treated as a protocol violation and closes the
///  connection, bounding what a misbehaving peer can make us allocate.
pub const DEFAULT_MAX_BODY_LEN: u32 = 16 * 1024 * 1024;
