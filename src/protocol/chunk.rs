//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk carries
//! a basic header naming its chunk stream, an optional message header, and a
//! payload fragment.
//!
//! ```text
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)         for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)     for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)    for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4, LE)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  previous chunk's values
//!
//! Extended timestamp (4 bytes) follows when the 24-bit field is 0xFFFFFF,
//! and is repeated on every Type-3 chunk of the same message.
//! ```
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;
use crate::protocol::message::Message;

/// Per-chunk-stream state for header compression and reassembly
#[derive(Debug, Default)]
struct ChunkStreamState {
    /// Last absolute timestamp
    timestamp: u32,
    /// Last timestamp delta
    timestamp_delta: u32,
    /// Last message length
    message_length: u32,
    /// Last message type
    message_type: u8,
    /// Last message stream ID
    stream_id: u32,
    /// Whether the current message carries an extended timestamp
    has_extended_timestamp: bool,
    /// Reassembly buffer for the in-flight message
    partial: BytesMut,
}

/// Chunk stream decoder
///
/// Sans-io: fed from a byte buffer, consuming nothing until a complete chunk
/// (headers plus payload fragment) is available, so a short read never
/// corrupts per-stream state.
pub struct ChunkDecoder {
    /// Maximum incoming chunk payload size
    chunk_size: u32,
    /// Per-chunk-stream state
    streams: HashMap<u32, ChunkStreamState>,
    /// Maximum message size (sanity limit)
    max_message_size: u32,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Set the chunk size (on receiving a Set Chunk Size message)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.max(1);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Discard the in-flight message on a chunk stream (inbound Abort)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
        }
    }

    /// Try to decode one chunk from the buffer
    ///
    /// Returns `Ok(Some(message))` when the chunk completed a message,
    /// `Ok(None)` when more data is needed (or the chunk extended a message
    /// still in flight), `Err` on a protocol violation.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let first = buf[0];
        let fmt = first >> 6;
        let (csid, basic_len) = match first & 0x3F {
            0 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                (64 + buf[1] as u32, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                (64 + buf[1] as u32 + buf[2] as u32 * 256, 3)
            }
            n => (n as u32, 1),
        };

        // Compressed headers inherit from the previous chunk on the same
        // chunk stream; without one the stream is undecodable.
        if fmt != 0 && !self.streams.contains_key(&csid) {
            return Err(ProtocolError::NoPriorChunk(csid).into());
        }

        if fmt == 3 {
            let state = &self.streams[&csid];
            if !state.partial.is_empty() {
                return self.continue_message(buf, csid, basic_len);
            }
        }

        self.start_message(buf, fmt, csid, basic_len)
    }

    /// Append a Type-3 continuation chunk to the in-flight message
    fn continue_message(
        &mut self,
        buf: &mut BytesMut,
        csid: u32,
        basic_len: usize,
    ) -> Result<Option<Message>> {
        let (ext_len, remaining) = {
            let state = &self.streams[&csid];
            let ext_len = if state.has_extended_timestamp { 4 } else { 0 };
            (ext_len, state.message_length as usize - state.partial.len())
        };

        let take = remaining.min(self.chunk_size as usize);
        if buf.len() < basic_len + ext_len + take {
            return Ok(None);
        }

        buf.advance(basic_len + ext_len);

        let state = self.streams.get_mut(&csid).expect("state checked above");
        state.partial.put_slice(&buf[..take]);
        buf.advance(take);

        if state.partial.len() == state.message_length as usize {
            Ok(Some(Message {
                csid,
                timestamp: state.timestamp,
                type_id: state.message_type,
                stream_id: state.stream_id,
                payload: state.partial.split().freeze(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Begin a new message from a Type-0/1/2 header, or a Type-3 chunk that
    /// inherits the previous message's header
    fn start_message(
        &mut self,
        buf: &mut BytesMut,
        fmt: u8,
        csid: u32,
        basic_len: usize,
    ) -> Result<Option<Message>> {
        let msg_header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };

        if buf.len() < basic_len + msg_header_len {
            return Ok(None);
        }

        let ts_field = if fmt == 3 {
            None
        } else {
            Some(read_u24(&buf[basic_len..]))
        };

        let has_ext = match ts_field {
            Some(ts) => ts >= EXTENDED_TIMESTAMP_THRESHOLD,
            None => self.streams[&csid].has_extended_timestamp,
        };
        let ext_len = if has_ext { 4 } else { 0 };

        let (message_length, message_type, stream_id) = match fmt {
            0 => (
                read_u24(&buf[basic_len + 3..]),
                buf[basic_len + 6],
                read_u32_le(&buf[basic_len + 7..]),
            ),
            1 => {
                let state = &self.streams[&csid];
                (
                    read_u24(&buf[basic_len + 3..]),
                    buf[basic_len + 6],
                    state.stream_id,
                )
            }
            _ => {
                let state = &self.streams[&csid];
                (state.message_length, state.message_type, state.stream_id)
            }
        };

        if message_length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: message_length,
                max: self.max_message_size,
            }
            .into());
        }

        let take = (message_length as usize).min(self.chunk_size as usize);
        if buf.len() < basic_len + msg_header_len + ext_len + take {
            return Ok(None);
        }

        buf.advance(basic_len + msg_header_len);
        let ext_value = if has_ext {
            let v = read_u32_be(&buf[..]);
            buf.advance(4);
            Some(v)
        } else {
            None
        };

        let state = self.streams.entry(csid).or_default();

        if !state.partial.is_empty() {
            // A fresh header over an unfinished message restarts the stream;
            // encoders do this to recover after a hiccup.
            tracing::debug!(csid, "discarding partial message on chunk stream restart");
            state.partial.clear();
        }

        let (timestamp, delta) = match fmt {
            0 => (ext_value.unwrap_or_else(|| ts_field.unwrap()), 0),
            1 | 2 => {
                let d = ext_value.unwrap_or_else(|| ts_field.unwrap());
                (state.timestamp.wrapping_add(d), d)
            }
            _ => {
                let d = ext_value.unwrap_or(state.timestamp_delta);
                (state.timestamp.wrapping_add(d), d)
            }
        };

        state.timestamp = timestamp;
        state.timestamp_delta = delta;
        state.message_length = message_length;
        state.message_type = message_type;
        state.stream_id = stream_id;
        state.has_extended_timestamp = has_ext;

        state.partial.reserve(message_length as usize);
        state.partial.put_slice(&buf[..take]);
        buf.advance(take);

        if state.partial.len() == state.message_length as usize {
            Ok(Some(Message {
                csid,
                timestamp: state.timestamp,
                type_id: state.message_type,
                stream_id: state.stream_id,
                payload: state.partial.split().freeze(),
            }))
        } else {
            Ok(None)
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk stream encoder
///
/// Emits a Type-0 first chunk followed by Type-3 continuations sized to the
/// negotiated chunk size. Only the 1-byte basic header form is produced;
/// chunk stream ids must be in `[2, 63]`.
pub struct ChunkEncoder {
    /// Outgoing chunk payload size
    chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Raise the outgoing chunk size (after sending Set Chunk Size)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.max(1);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encode a message into chunks
    pub fn encode(&mut self, msg: &Message, out: &mut BytesMut) {
        debug_assert!(
            (2..=63).contains(&msg.csid),
            "only 1-byte basic headers are emitted"
        );

        let needs_ext = msg.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD;
        let ts_field = if needs_ext {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            msg.timestamp
        };

        let total = msg.payload.len();
        let chunk_size = self.chunk_size as usize;

        out.put_u8(msg.csid as u8); // fmt 0
        put_u24(out, ts_field);
        put_u24(out, total as u32);
        out.put_u8(msg.type_id);
        out.put_u32_le(msg.stream_id);
        if needs_ext {
            out.put_u32(msg.timestamp);
        }

        let first = total.min(chunk_size);
        out.put_slice(&msg.payload[..first]);

        let mut offset = first;
        while offset < total {
            out.put_u8(0xC0 | msg.csid as u8); // fmt 3
            if needs_ext {
                out.put_u32(msg.timestamp);
            }
            let n = (total - offset).min(chunk_size);
            out.put_slice(&msg.payload[offset..offset + n]);
            offset += n;
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u24(buf: &[u8]) -> u32 {
    ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32)
}

fn read_u32_be(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_u8(((value >> 16) & 0xFF) as u8);
    out.put_u8(((value >> 8) & 0xFF) as u8);
    out.put_u8((value & 0xFF) as u8);
}
