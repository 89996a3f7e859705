pub mod deque;
pub mod interface;
pub mod message;
pub mod scramble;
pub mod tcp;
pub mod udp;

mod engine;

pub use deque::BlockingDeque;
pub use interface::{NetClient, NetServer, ServerHandler};
pub use message::{Kind, Message, TaggedMessage, UserId, HEADER_LEN, INVALID_USER_ID, SERVER_USER_ID};
