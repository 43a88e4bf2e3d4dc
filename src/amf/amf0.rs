//! AMF0 encoder and decoder
//!
//! Type markers handled here:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x08 - ECMA Array (associative array with count hint)
//! 0x09 - Object End (0x000009 sequence)
//! 0x0A - Strict Array (dense array)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! ```
//!
//! Key order of objects and ECMA arrays survives a decode/encode round
//! trip; the command dialect compares reply objects by pair sequence.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::value::{AmfObject, AmfValue};
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Maximum nesting depth for objects/arrays
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
pub struct Amf0Decoder {
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Decode a single AMF0 value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(AmfError::UnexpectedEof);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode all values from the buffer until exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_OBJECT => Ok(AmfValue::Object(self.decode_pairs(buf)?)),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_ECMA_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                // Count hint only; real encoders get it wrong, the end
                // marker is authoritative.
                let _count = buf.get_u32();
                Ok(AmfValue::EcmaArray(self.decode_pairs(buf)?))
            }
            MARKER_STRICT_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                let count = buf.get_u32() as usize;
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                Ok(AmfValue::Array(elements))
            }
            _ => Err(AmfError::UnknownMarker(marker)),
        }
    }

    /// Decode key/value pairs until the object end marker
    fn decode_pairs(&mut self, buf: &mut Bytes) -> Result<AmfObject, AmfError> {
        let mut object = AmfObject::new();

        loop {
            let key = read_utf8(buf)?;

            if key.is_empty() {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                if buf.get_u8() != MARKER_OBJECT_END {
                    return Err(AmfError::InvalidObjectEnd);
                }
                break;
            }

            let value = self.decode(buf)?;
            object.push(key, value);
        }

        Ok(object)
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read UTF-8 string with 16-bit length prefix
fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 2 {
        return Err(AmfError::UnexpectedEof);
    }

    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }

    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Read UTF-8 string with 32-bit length prefix
fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 4 {
        return Err(AmfError::UnexpectedEof);
    }

    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }

    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Get the encoded bytes and reset the encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Encode a single AMF0 value
    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(object) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.encode_pairs(object);
            }
            AmfValue::EcmaArray(object) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(object.len() as u32);
                self.encode_pairs(object);
            }
            AmfValue::Array(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
            AmfValue::Null => {
                self.buf.put_u8(MARKER_NULL);
            }
            AmfValue::Undefined => {
                self.buf.put_u8(MARKER_UNDEFINED);
            }
        }
    }

    /// Encode multiple values
    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn encode_pairs(&mut self, object: &AmfObject) {
        for (key, value) in object.iter() {
            self.write_utf8(key);
            self.encode(value);
        }
        // Object end: empty key + end marker
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Write UTF-8 string with 16-bit length prefix (no type marker)
    fn write_utf8(&mut self, s: &str) {
        let len = s.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a slice of values to AMF0 bytes
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Decode all AMF0 values from a byte slice
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode_all(&mut buf)
}
