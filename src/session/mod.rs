//! Connection facade and session state machine

pub mod conn;
pub mod state;

pub use conn::{Conn, ConnConfig, MessageReader, MessageWriter};
pub use state::SessionState;
