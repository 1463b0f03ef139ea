//! Typed value codec for LRPC2 message payloads.
//!
//! A payload is a 16-bit message ID followed by a sequence of tagged
//! values and a terminating end tag. There is no outer length prefix;
//! decoding is self-terminating.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::{ProtocolError, Result};

// Wire tags. These values must not change; they match the corresponding
// values used by the native agent.
const TAG_END: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_UINT32: u8 = 3;
const TAG_STRING: u8 = 4;
// Tag 5 (password) is deprecated. It was never supported for writes;
// sensitive data rides in OAEP-protected chunks instead. Decoded as a
// plain string for compatibility.
const TAG_PASSWORD: u8 = 5;
const TAG_BLOB: u8 = 6;
const TAG_STRING_SET: u8 = 7;
const TAG_KEY_VALUE_SET: u8 = 8;

/// One argument or result in an LRPC2 message.
///
/// An absent value (`Null`) is encoded on the wire as a string of length
/// -1 and decoded back to `Null`, never to an empty string.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Uint32(u32),
    Str(String),
    Blob(Vec<u8>),
    StringSet(Vec<String>),
    StringMap(HashMap<String, String>),
    Null,
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringSet(v)
    }
}

impl From<HashMap<String, String>> for Value {
    fn from(v: HashMap<String, String>) -> Self {
        Value::StringMap(v)
    }
}

/// Encodes a message ID and its argument list into a payload buffer.
///
/// Encoding is total: the `Value` sum type only admits representable
/// inputs, so there is no unsupported-type failure path here.
pub fn encode_payload(msg_id: u16, values: &[Value]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u16_le(msg_id);

    for value in values {
        encode_value(&mut buf, value);
    }

    buf.put_u8(TAG_END);
    buf
}

fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*b));
        }
        Value::Int32(v) => {
            buf.put_u8(TAG_INT32);
            buf.put_i32_le(*v);
        }
        Value::Uint32(v) => {
            buf.put_u8(TAG_UINT32);
            buf.put_u32_le(*v);
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STRING);
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            buf.put_u8(TAG_BLOB);
            buf.put_u32_le(b.len() as u32);
            buf.put_slice(b);
        }
        Value::StringSet(set) => {
            buf.put_u8(TAG_STRING_SET);
            buf.put_u32_le(set.len() as u32);
            for s in set {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
        }
        Value::StringMap(map) => {
            buf.put_u8(TAG_KEY_VALUE_SET);
            buf.put_u32_le(map.len() as u32);
            for (k, v) in map {
                buf.put_u32_le(k.len() as u32);
                buf.put_slice(k.as_bytes());
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
        }
        Value::Null => {
            // A null rides as a string of length -1.
            buf.put_u8(TAG_STRING);
            buf.put_i32_le(-1);
        }
    }
}

/// Decodes a payload buffer into its message ID and argument list.
///
/// Fails with a typed error on an unrecognized tag, a truncated buffer,
/// or a count/length that overruns the remaining bytes. Never panics on
/// malformed input.
pub fn decode_payload(payload: &[u8]) -> Result<(u16, Vec<Value>)> {
    let mut buf = payload;

    if buf.remaining() < 2 {
        debug!("Failed to read LRPC2 message ID: payload too short");
        return Err(ProtocolError::Truncated);
    }
    let msg_id = buf.get_u16_le();

    let mut values = Vec::new();
    loop {
        if buf.remaining() < 1 {
            debug!(msg_id, "LRPC2 message ended without end tag");
            return Err(ProtocolError::Truncated);
        }

        match buf.get_u8() {
            TAG_END => return Ok((msg_id, values)),
            TAG_BOOL => {
                if buf.remaining() < 1 {
                    return Err(ProtocolError::Truncated);
                }
                values.push(Value::Bool(buf.get_u8() != 0));
            }
            TAG_INT32 => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                values.push(Value::Int32(buf.get_i32_le()));
            }
            TAG_UINT32 => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                values.push(Value::Uint32(buf.get_u32_le()));
            }
            TAG_STRING | TAG_PASSWORD => match read_sized_bytes(&mut buf)? {
                Some(bytes) => values.push(Value::Str(into_string(bytes)?)),
                None => values.push(Value::Null),
            },
            TAG_BLOB => {
                let bytes = read_sized_bytes(&mut buf)?.unwrap_or_default();
                values.push(Value::Blob(bytes));
            }
            TAG_STRING_SET => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                let count = buf.get_u32_le();
                let mut set = Vec::new();
                for _ in 0..count {
                    let bytes = read_sized_bytes(&mut buf)?.ok_or(ProtocolError::Truncated)?;
                    set.push(into_string(bytes)?);
                }
                values.push(Value::StringSet(set));
            }
            TAG_KEY_VALUE_SET => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                let count = buf.get_u32_le();
                let mut map = HashMap::new();
                for _ in 0..count {
                    let key = read_sized_bytes(&mut buf)?.ok_or(ProtocolError::Truncated)?;
                    let value = read_sized_bytes(&mut buf)?.ok_or(ProtocolError::Truncated)?;
                    map.insert(into_string(key)?, into_string(value)?);
                }
                values.push(Value::StringMap(map));
            }
            tag => {
                debug!(msg_id, tag, "Unsupported data type tag in LRPC2 message");
                return Err(ProtocolError::UnknownTag(tag));
            }
        }
    }
}

/// Reads a 4-byte signed length followed by that many bytes. A length of
/// -1 denotes an absent value and yields `None`.
fn read_sized_bytes(buf: &mut &[u8]) -> Result<Option<Vec<u8>>> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }

    let len = buf.get_i32_le();
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(ProtocolError::Truncated);
    }

    let len = len as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }

    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(Some(bytes))
}

fn into_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}
