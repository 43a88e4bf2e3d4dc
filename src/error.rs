//! Unified error types for rtmp-endpoint

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all RTMP operations
#[derive(Debug)]
pub enum Error {
    /// I/O error on the underlying byte stream
    Io(io::Error),
    /// RTMP protocol violation
    Protocol(ProtocolError),
    /// AMF0 encoding/decoding error
    Amf(AmfError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// Track derivation or codec parameter error
    Track(TrackError),
    /// Command not valid in the current session state
    UnexpectedCommand(String),
    /// A configured deadline expired
    Timeout,
    /// The peer closed the byte stream
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Track(e) => write!(f, "Track error: {}", e),
            Error::UnexpectedCommand(name) => write!(f, "Unexpected command: {}", name),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<TrackError> for Error {
    fn from(err: TrackError) -> Self {
        Error::Track(err)
    }
}

/// Chunk stream and message framing errors
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// A Format-1/2/3 chunk arrived on a chunk stream with no prior chunk
    NoPriorChunk(u32),
    /// Declared message length exceeds the sanity cap
    MessageTooLarge { size: u32, max: u32 },
    /// A control or media payload is shorter than its fixed header
    TruncatedMessage(u8),
    /// The first media tag of a stream was not a codec configuration tag
    FrameBeforeCodecConfig,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::NoPriorChunk(csid) => {
                write!(f, "Chunk without header on chunk stream {}", csid)
            }
            ProtocolError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            ProtocolError::TruncatedMessage(type_id) => {
                write!(f, "Truncated payload for message type {}", type_id)
            }
            ProtocolError::FrameBeforeCodecConfig => {
                write!(f, "Media frame received before codec configuration")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF0 encoding/decoding errors
#[derive(Debug, PartialEq, Eq)]
pub enum AmfError {
    UnknownMarker(u8),
    UnexpectedEof,
    InvalidUtf8,
    InvalidObjectEnd,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnknownMarker(m) => write!(f, "Unknown AMF marker: 0x{:02x}", m),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::InvalidObjectEnd => write!(f, "Invalid object end marker"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeError {
    /// First byte of the exchange was not the RTMP version
    BadVersion(u8),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::BadVersion(v) => write!(f, "Bad RTMP version: {}", v),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Track derivation and codec parameter errors
#[derive(Debug, PartialEq, Eq)]
pub enum TrackError {
    /// A video codec other than H.264 was declared or received
    UnsupportedVideoCodec(u8),
    /// An audio codec other than AAC was declared or received
    UnsupportedAudioCodec(u8),
    /// The publish session ended before the video configuration arrived
    MissingVideoConfig,
    /// Malformed AVC configuration record or SPS
    InvalidVideoConfig,
    /// Malformed MPEG-4 audio configuration
    InvalidAudioConfig,
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackError::UnsupportedVideoCodec(id) => {
                write!(f, "Unsupported video codec: {}", id)
            }
            TrackError::UnsupportedAudioCodec(id) => {
                write!(f, "Unsupported audio codec: {}", id)
            }
            TrackError::MissingVideoConfig => {
                write!(f, "Stream ended before video configuration")
            }
            TrackError::InvalidVideoConfig => write!(f, "Invalid video configuration"),
            TrackError::InvalidAudioConfig => write!(f, "Invalid audio configuration"),
        }
    }
}

impl std::error::Error for TrackError {}
