//! RTMP message types and classification
//!
//! Messages fall into:
//! - Protocol control (types 1-6): chunk and flow control
//! - Command messages (type 20): AMF0-encoded commands
//! - Data messages (type 18): metadata
//! - Audio/video messages (types 8, 9): media data
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{Amf0Decoder, Amf0Encoder, AmfObject, AmfValue};
use crate::error::{AmfError, ProtocolError, Result};
use crate::protocol::constants::*;

/// A reassembled RTMP message
///
/// The unit the chunk codec produces and consumes: chunk stream id, type id,
/// message stream id, timestamp, and the complete payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Chunk stream ID the message travels on
    pub csid: u32,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Message type ID
    pub type_id: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message payload
    pub payload: Bytes,
}

impl Message {
    pub fn new(csid: u32, type_id: u8, stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Self {
            csid,
            timestamp,
            type_id,
            stream_id,
            payload,
        }
    }

    /// Build a protocol control message (csid 2, stream 0)
    pub fn control(type_id: u8, payload: Bytes) -> Self {
        Self::new(CSID_PROTOCOL_CONTROL, type_id, 0, 0, payload)
    }

    /// Build a Set Chunk Size control message
    pub fn set_chunk_size(size: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(size);
        Self::control(MSG_SET_CHUNK_SIZE, buf.freeze())
    }

    /// Build a Window Acknowledgement Size control message
    pub fn window_ack_size(size: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(size);
        Self::control(MSG_WINDOW_ACK_SIZE, buf.freeze())
    }

    /// Build a Set Peer Bandwidth control message
    pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> Self {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u32(size);
        buf.put_u8(limit_type);
        Self::control(MSG_SET_PEER_BANDWIDTH, buf.freeze())
    }

    /// Build an Acknowledgement control message
    pub fn acknowledgement(sequence: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(sequence);
        Self::control(MSG_ACKNOWLEDGEMENT, buf.freeze())
    }

    /// Build a User Control message
    pub fn user_control(event: &UserControlEvent) -> Self {
        Self::control(MSG_USER_CONTROL, event.encode())
    }
}

/// Classified message content, as consumed by the session machine
#[derive(Debug, Clone)]
pub enum MessageKind {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),

    /// Abort Message (type 2)
    Abort { csid: u32 },

    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },

    /// User Control Message (type 4)
    UserControl(UserControlEvent),

    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),

    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },

    /// Audio data (type 8)
    Audio { timestamp: u32, data: Bytes },

    /// Video data (type 9)
    Video { timestamp: u32, data: Bytes },

    /// AMF0 Command (type 20)
    Command(Command),

    /// AMF0 Data message (type 18)
    Data(DataMessage),

    /// Any other message type
    Unknown { type_id: u8, data: Bytes },
}

impl MessageKind {
    /// Classify a reassembled message
    pub fn classify(msg: &Message) -> Result<Self> {
        let mut payload = msg.payload.clone();

        match msg.type_id {
            MSG_SET_CHUNK_SIZE => {
                if payload.len() < 4 {
                    return Err(ProtocolError::TruncatedMessage(msg.type_id).into());
                }
                // MSB is reserved
                Ok(MessageKind::SetChunkSize(payload.get_u32() & 0x7FFF_FFFF))
            }

            MSG_ABORT => {
                if payload.len() < 4 {
                    return Err(ProtocolError::TruncatedMessage(msg.type_id).into());
                }
                Ok(MessageKind::Abort {
                    csid: payload.get_u32(),
                })
            }

            MSG_ACKNOWLEDGEMENT => {
                if payload.len() < 4 {
                    return Err(ProtocolError::TruncatedMessage(msg.type_id).into());
                }
                Ok(MessageKind::Acknowledgement {
                    sequence: payload.get_u32(),
                })
            }

            MSG_USER_CONTROL => Ok(MessageKind::UserControl(UserControlEvent::parse(
                &mut payload,
            )?)),

            MSG_WINDOW_ACK_SIZE => {
                if payload.len() < 4 {
                    return Err(ProtocolError::TruncatedMessage(msg.type_id).into());
                }
                Ok(MessageKind::WindowAckSize(payload.get_u32()))
            }

            MSG_SET_PEER_BANDWIDTH => {
                if payload.len() < 5 {
                    return Err(ProtocolError::TruncatedMessage(msg.type_id).into());
                }
                let size = payload.get_u32();
                let limit_type = payload.get_u8();
                Ok(MessageKind::SetPeerBandwidth { size, limit_type })
            }

            MSG_AUDIO => Ok(MessageKind::Audio {
                timestamp: msg.timestamp,
                data: payload,
            }),

            MSG_VIDEO => Ok(MessageKind::Video {
                timestamp: msg.timestamp,
                data: payload,
            }),

            MSG_COMMAND_AMF0 => Ok(MessageKind::Command(Command::parse(
                &mut payload,
                msg.stream_id,
            )?)),

            MSG_DATA_AMF0 => Ok(MessageKind::Data(DataMessage::parse(
                &mut payload,
                msg.stream_id,
            )?)),

            _ => Ok(MessageKind::Unknown {
                type_id: msg.type_id,
                data: payload,
            }),
        }
    }
}

/// User Control event (message type 4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

impl UserControlEvent {
    fn parse(payload: &mut Bytes) -> Result<Self> {
        if payload.len() < 6 {
            return Err(ProtocolError::TruncatedMessage(MSG_USER_CONTROL).into());
        }

        let event_type = payload.get_u16();
        let event = match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(payload.get_u32()),
            UC_STREAM_EOF => UserControlEvent::StreamEof(payload.get_u32()),
            UC_STREAM_DRY => UserControlEvent::StreamDry(payload.get_u32()),
            UC_SET_BUFFER_LENGTH => {
                if payload.len() < 8 {
                    return Err(ProtocolError::TruncatedMessage(MSG_USER_CONTROL).into());
                }
                UserControlEvent::SetBufferLength {
                    stream_id: payload.get_u32(),
                    buffer_ms: payload.get_u32(),
                }
            }
            UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(payload.get_u32()),
            UC_PING_REQUEST => UserControlEvent::PingRequest(payload.get_u32()),
            UC_PING_RESPONSE => UserControlEvent::PingResponse(payload.get_u32()),
            _ => UserControlEvent::Unknown {
                event_type,
                data: payload.clone(),
            },
        };

        Ok(event)
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        match self {
            UserControlEvent::StreamBegin(id) => {
                buf.put_u16(UC_STREAM_BEGIN);
                buf.put_u32(*id);
            }
            UserControlEvent::StreamEof(id) => {
                buf.put_u16(UC_STREAM_EOF);
                buf.put_u32(*id);
            }
            UserControlEvent::StreamDry(id) => {
                buf.put_u16(UC_STREAM_DRY);
                buf.put_u32(*id);
            }
            UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms,
            } => {
                buf.put_u16(UC_SET_BUFFER_LENGTH);
                buf.put_u32(*stream_id);
                buf.put_u32(*buffer_ms);
            }
            UserControlEvent::StreamIsRecorded(id) => {
                buf.put_u16(UC_STREAM_IS_RECORDED);
                buf.put_u32(*id);
            }
            UserControlEvent::PingRequest(ts) => {
                buf.put_u16(UC_PING_REQUEST);
                buf.put_u32(*ts);
            }
            UserControlEvent::PingResponse(ts) => {
                buf.put_u16(UC_PING_RESPONSE);
                buf.put_u32(*ts);
            }
            UserControlEvent::Unknown { event_type, data } => {
                buf.put_u16(*event_type);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }
}

/// RTMP command (connect, publish, play, and their replies)
#[derive(Debug, Clone)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Transaction ID
    pub transaction_id: f64,
    /// Command object (null for most replies)
    pub command_object: AmfValue,
    /// Additional arguments
    pub arguments: Vec<AmfValue>,
    /// Message stream ID the command arrived on
    pub stream_id: u32,
}

impl Command {
    fn parse(payload: &mut Bytes, stream_id: u32) -> Result<Self> {
        let mut decoder = Amf0Decoder::new();

        let name = match decoder.decode(payload)? {
            AmfValue::String(s) => s,
            _ => return Err(AmfError::UnexpectedEof.into()),
        };

        let transaction_id = match decoder.decode(payload)? {
            AmfValue::Number(n) => n,
            _ => 0.0,
        };

        let command_object = if payload.has_remaining() {
            decoder.decode(payload)?
        } else {
            AmfValue::Null
        };

        let mut arguments = Vec::new();
        while payload.has_remaining() {
            arguments.push(decoder.decode(payload)?);
        }

        Ok(Command {
            name,
            transaction_id,
            command_object,
            arguments,
            stream_id,
        })
    }

    /// Encode to an AMF0 payload
    pub fn encode(&self) -> Bytes {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode(&AmfValue::Number(self.transaction_id));
        encoder.encode(&self.command_object);
        for arg in &self.arguments {
            encoder.encode(arg);
        }
        encoder.finish()
    }

    /// Wrap into a message on the given chunk stream
    pub fn to_message(&self, csid: u32, stream_id: u32) -> Message {
        Message::new(csid, MSG_COMMAND_AMF0, stream_id, 0, self.encode())
    }

    /// Build a `_result` reply
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_RESULT.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// Build an `onStatus` notification carrying the request's transaction id
    pub fn on_status(transaction_id: f64, code: &str, description: &str) -> Self {
        let info = AmfObject::from([
            ("level", AmfValue::from("status")),
            ("code", AmfValue::from(code)),
            ("description", AmfValue::from(description)),
        ]);

        Command {
            name: CMD_ON_STATUS.to_string(),
            transaction_id,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::Object(info)],
            stream_id: 0,
        }
    }
}

/// Data message (@setDataFrame, onMetaData)
#[derive(Debug, Clone)]
pub struct DataMessage {
    /// Handler name (e.g. "@setDataFrame", "onMetaData")
    pub name: String,
    /// Data values following the name
    pub values: Vec<AmfValue>,
    /// Message stream ID the data arrived on
    pub stream_id: u32,
}

impl DataMessage {
    fn parse(payload: &mut Bytes, stream_id: u32) -> Result<Self> {
        let mut decoder = Amf0Decoder::new();

        let name = match decoder.decode(payload)? {
            AmfValue::String(s) => s,
            _ => String::new(),
        };

        let mut values = Vec::new();
        while payload.has_remaining() {
            values.push(decoder.decode(payload)?);
        }

        Ok(DataMessage {
            name,
            values,
            stream_id,
        })
    }

    /// Encode to an AMF0 payload
    pub fn encode(&self) -> Bytes {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        for value in &self.values {
            encoder.encode(value);
        }
        encoder.finish()
    }

    /// Wrap into a message on the given chunk stream
    pub fn to_message(&self, csid: u32, stream_id: u32) -> Message {
        Message::new(csid, MSG_DATA_AMF0, stream_id, 0, self.encode())
    }

    /// The metadata map, when this message carries `onMetaData` either
    /// directly or wrapped in `@setDataFrame`
    pub fn metadata(&self) -> Option<&AmfObject> {
        let values = match self.name.as_str() {
            CMD_SET_DATA_FRAME => {
                if self.values.first()?.as_str()? != CMD_ON_METADATA {
                    return None;
                }
                &self.values[1..]
            }
            CMD_ON_METADATA => &self.values[..],
            _ => return None,
        };
        values.first()?.as_object()
    }
}
