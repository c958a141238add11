//! Self-describing value encoding for the wire protocol.
//!
//! Each value is a tag byte followed by a fixed-width integer or a
//! length-prefixed body; arrays nest. The encoding is deterministic, so the
//! serialized form doubles as the input to the range hasher.

use bytes::{Buf, BufMut, BytesMut};

use crate::core::Value;
use crate::error::{Result, SyncError};

const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_UINT: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;

/// Maximum byte/string length accepted from a peer.
/// Bounds allocations driven by untrusted input.
const MAX_BYTES_LENGTH: u32 = 256 * 1024 * 1024;

/// Maximum element count accepted for one array.
const MAX_ARRAY_ELEMENTS: u32 = 16 * 1024 * 1024;

/// Append the encoding of `value` to `buf`.
pub fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TAG_NIL),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Int(n) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*n);
        }
        Value::Uint(n) => {
            buf.put_u8(TAG_UINT);
            buf.put_u64(*n);
        }
        Value::Text(s) => {
            buf.put_u8(TAG_TEXT);
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        Value::Array(items) => {
            buf.put_u8(TAG_ARRAY);
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_value(buf, item);
            }
        }
    }
}

/// Encode a single value to a fresh byte vector.
///
/// This is the serialized form fed to the range hasher for each row.
pub fn encode_value_to_vec(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_value(&mut buf, value);
    buf.to_vec()
}

/// Decode one value from the front of `buf`, consuming it.
pub fn decode_value(buf: &mut &[u8]) -> Result<Value> {
    let tag = take_u8(buf)?;
    match tag {
        TAG_NIL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            ensure(buf, 8)?;
            Ok(Value::Int(buf.get_i64()))
        }
        TAG_UINT => {
            ensure(buf, 8)?;
            Ok(Value::Uint(buf.get_u64()))
        }
        TAG_TEXT => {
            let body = take_len_prefixed(buf)?;
            let s = std::str::from_utf8(body)
                .map_err(|_| SyncError::protocol("text value is not valid UTF-8"))?;
            Ok(Value::Text(s.to_string()))
        }
        TAG_BYTES => Ok(Value::Bytes(take_len_prefixed(buf)?.to_vec())),
        TAG_ARRAY => {
            ensure(buf, 4)?;
            let count = buf.get_u32();
            if count > MAX_ARRAY_ELEMENTS {
                return Err(SyncError::protocol(format!("array of {} elements exceeds limit", count)));
            }
            let mut items = Vec::with_capacity(count.min(4096) as usize);
            for _ in 0..count {
                items.push(decode_value(buf)?);
            }
            Ok(Value::Array(items))
        }
        other => Err(SyncError::protocol(format!("unknown value tag 0x{:02x}", other))),
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_len_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    ensure(buf, 4)?;
    let len = buf.get_u32();
    if len > MAX_BYTES_LENGTH {
        return Err(SyncError::protocol(format!("value of {} bytes exceeds limit", len)));
    }
    ensure(buf, len as usize)?;
    let (body, rest) = buf.split_at(len as usize);
    *buf = rest;
    Ok(body)
}

fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(SyncError::protocol("truncated value"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &value);
        let mut slice: &[u8] = &buf;
        let back = decode_value(&mut slice).unwrap();
        assert_eq!(value, back);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_scalar_round_trips() {
        round_trip(Value::Null);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Int(-1));
        round_trip(Value::Int(i64::MIN));
        round_trip(Value::Uint(u64::MAX));
        round_trip(Value::Text("longer str".into()));
        round_trip(Value::Text(String::new()));
        round_trip(Value::Bytes(vec![0, 255, 7]));
    }

    #[test]
    fn test_nested_array_round_trip() {
        round_trip(Value::Array(vec![
            Value::Int(2),
            Value::Null,
            Value::Array(vec![Value::Text("test".into())]),
        ]));
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &Value::Text("hello".into()));
        for cut in 0..buf.len() {
            let mut slice: &[u8] = &buf[..cut];
            assert!(decode_value(&mut slice).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_unknown_tag_fails() {
        let mut slice: &[u8] = &[0x7f];
        assert!(matches!(decode_value(&mut slice), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_deterministic_encoding() {
        let row = Value::Array(vec![Value::Int(4), Value::Null, Value::Text("foo".into())]);
        assert_eq!(encode_value_to_vec(&row), encode_value_to_vec(&row));
    }
}
