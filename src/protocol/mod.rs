//! Wire-level machinery: handshake, chunk stream codec, message layer

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder};
pub use message::{Command, DataMessage, Message, MessageKind, UserControlEvent};
