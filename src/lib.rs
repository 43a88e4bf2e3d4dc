//! rtmp-endpoint: RTMP endpoint protocol core
//!
//! The core of an RTMP endpoint: simple handshake, chunk stream codec, the
//! AMF0 command dialect needed for publish/play sessions, and H.264/AAC
//! track derivation. The crate wraps an established byte stream and is
//! driven through four high-level operations:
//!
//! - [`Conn::server_handshake`] / [`Conn::client_handshake`]
//! - [`Conn::read_tracks`] — serve a publisher and derive its tracks
//! - [`Conn::write_tracks`] — serve a player and announce tracks
//! - [`Conn::read_message`] / [`Conn::write_message`] — raw media pumping
//!
//! Sockets, TLS, authentication, and routing stay with the caller.
//!
//! # Example: publish ingest
//!
//! ```no_run
//! use rtmp_endpoint::Conn;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("0.0.0.0:1935").await?;
//!     let (socket, _addr) = listener.accept().await?;
//!
//!     let mut conn = Conn::new(socket);
//!     conn.server_handshake().await?;
//!     let (video, audio) = conn.read_tracks().await?;
//!
//!     if let Some(track) = &video {
//!         println!("H.264 {}x{}", track.width(), track.height());
//!     }
//!     if let Some(track) = &audio {
//!         println!("AAC {} Hz, {} ch", track.sample_rate, track.channel_count);
//!     }
//!
//!     loop {
//!         let msg = conn.read_message().await?;
//!         println!("media: type {} ({} bytes)", msg.type_id, msg.payload.len());
//!     }
//! }
//! ```

pub mod amf;
pub mod error;
pub mod media;
pub mod protocol;
pub mod session;
pub mod track;

pub use error::{AmfError, Error, HandshakeError, ProtocolError, Result, TrackError};
pub use protocol::message::Message;
pub use session::conn::{Conn, ConnConfig, MessageReader, MessageWriter};
pub use session::state::SessionState;
pub use track::{TrackAac, TrackH264};
