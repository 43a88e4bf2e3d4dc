//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

/// RTMP version number (always 3 for standard RTMP)
pub const RTMP_VERSION: u8 = 3;

/// Handshake packet size (C1/C2/S1/S2)
pub const HANDSHAKE_SIZE: usize = 1536;

/// Default chunk size before negotiation (per RTMP spec)
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Chunk size the server advertises after connect
pub const SERVER_CHUNK_SIZE: u32 = 65_536;

/// Maximum message size (sanity limit)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Timestamps at or above this value require the extended timestamp field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0xFF_FFFF;

// ============================================================================
// Chunk Stream IDs (CSID)
// ============================================================================

/// Protocol control messages (Set Chunk Size, Window Ack Size, etc.)
pub const CSID_PROTOCOL_CONTROL: u32 = 2;

/// Command messages (connect, createStream, etc.)
pub const CSID_COMMAND: u32 = 3;

/// Audio data and metadata
pub const CSID_AUDIO: u32 = 4;

/// NetStream status replies
pub const CSID_STREAM_STATUS: u32 = 5;

/// Video data
pub const CSID_VIDEO: u32 = 6;

// ============================================================================
// Message Type IDs
// ============================================================================

/// Set Chunk Size (1) - protocol control
pub const MSG_SET_CHUNK_SIZE: u8 = 1;

/// Abort Message (2) - protocol control
pub const MSG_ABORT: u8 = 2;

/// Acknowledgement (3) - protocol control
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;

/// User Control Message (4) - protocol control
pub const MSG_USER_CONTROL: u8 = 4;

/// Window Acknowledgement Size (5) - protocol control
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;

/// Set Peer Bandwidth (6) - protocol control
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;

/// Audio Message (8)
pub const MSG_AUDIO: u8 = 8;

/// Video Message (9)
pub const MSG_VIDEO: u8 = 9;

/// AMF0 Data Message (18) - @setDataFrame, onMetaData
pub const MSG_DATA_AMF0: u8 = 18;

/// AMF0 Command Message (20) - connect, publish, play, etc.
pub const MSG_COMMAND_AMF0: u8 = 20;

// ============================================================================
// User Control Event Types
// ============================================================================

/// Stream Begin - server sends when a stream becomes functional
pub const UC_STREAM_BEGIN: u16 = 0;

/// Stream EOF - server sends when playback ends
pub const UC_STREAM_EOF: u16 = 1;

/// Stream Dry - no more data available
pub const UC_STREAM_DRY: u16 = 2;

/// Set Buffer Length - client tells server its buffer size
pub const UC_SET_BUFFER_LENGTH: u16 = 3;

/// Stream Is Recorded
pub const UC_STREAM_IS_RECORDED: u16 = 4;

/// Ping Request
pub const UC_PING_REQUEST: u16 = 6;

/// Ping Response
pub const UC_PING_RESPONSE: u16 = 7;

// ============================================================================
// Peer Bandwidth Limit Types
// ============================================================================

pub const BANDWIDTH_LIMIT_HARD: u8 = 0;
pub const BANDWIDTH_LIMIT_SOFT: u8 = 1;
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

// ============================================================================
// Command Names
// ============================================================================

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_PLAY: &str = "play";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_GET_STREAM_LENGTH: &str = "getStreamLength";
pub const CMD_CHECK_BW: &str = "_checkbw";

/// Internal response commands
pub const CMD_RESULT: &str = "_result";
pub const CMD_ON_STATUS: &str = "onStatus";

// OBS/Twitch extended commands
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_FC_UNPUBLISH: &str = "FCUnpublish";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";

// Data commands
pub const CMD_SET_DATA_FRAME: &str = "@setDataFrame";
pub const CMD_ON_METADATA: &str = "onMetaData";

// ============================================================================
// Status Codes
// ============================================================================

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";

pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PLAY_RESET: &str = "NetStream.Play.Reset";
pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_DATA_START: &str = "NetStream.Data.Start";
pub const NS_PLAY_PUBLISH_NOTIFY: &str = "NetStream.Play.PublishNotify";

// ============================================================================
// Connect Reply Contents
// ============================================================================

/// Server version string advertised in the connect _result
pub const SERVER_FMS_VERSION: &str = "LNX 9,0,124,2";

/// Capabilities advertised in the connect _result
pub const SERVER_CAPABILITIES: f64 = 31.0;

/// Window acknowledgement size advertised after connect
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Peer bandwidth advertised after connect
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;
