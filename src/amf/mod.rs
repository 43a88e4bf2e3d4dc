//! AMF0 value model and codec
//!
//! RTMP commands and data messages carry AMF0-serialized values. Object
//! properties are order-preserving: the command dialect pins the key
//! sequence of reply objects, so objects are backed by a vector of pairs
//! rather than a hash map.

pub mod amf0;
pub mod value;

pub use amf0::{decode_all, encode_all, Amf0Decoder, Amf0Encoder};
pub use value::{AmfObject, AmfValue};
