//! Codec for encoding and decoding HTSP messages.
//!
//! Frame format:
//! ```text
//! +----------------+-----------------------------------+
//! | Length u32 BE  |  Body: field, field, ...          |
//! +----------------+-----------------------------------+
//!
//! Field:
//! +------+----------+-------------+--------+--------+
//! | Type | Name len | Data len    | Name   | Data   |
//! | u8   | u8       | u32 BE      |        |        |
//! +------+----------+-------------+--------+--------+
//! ```
//!
//! Lists reuse the field layout with empty names. Maps are a nested body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Field header size: 1 (type) + 1 (name length) + 4 (data length) = 6 bytes.
pub const FIELD_HEADER_SIZE: usize = 6;

/// Maximum nesting of maps and lists, enforced on both encode and decode.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Encode a message into a complete, length-prefixed frame.
pub fn encode_message(msg: &Message) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();
    for (name, value) in msg.fields() {
        encode_field(&mut body, name, value, 0)?;
    }

    let body_len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len, MAX_FRAME_SIZE));
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.put_u32(body_len);
    frame.put_slice(&body);

    Ok(frame.freeze())
}

fn encode_field(
    buf: &mut BytesMut,
    name: &str,
    value: &Value,
    depth: usize,
) -> Result<(), ProtocolError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    if name.len() > u8::MAX as usize {
        return Err(ProtocolError::NameTooLong(name.len()));
    }

    let mut data = BytesMut::new();
    let field_type = match value {
        Value::Int(v) => {
            encode_s64(&mut data, *v);
            FieldType::S64
        }
        Value::Str(s) => {
            data.put_slice(s.as_bytes());
            FieldType::Str
        }
        Value::Bin(b) => {
            data.put_slice(b);
            FieldType::Bin
        }
        Value::Double(d) => {
            data.put_f64_le(*d);
            FieldType::Dbl
        }
        Value::List(items) => {
            for item in items {
                encode_field(&mut data, "", item, depth + 1)?;
            }
            FieldType::List
        }
        Value::Map(map) => {
            for (child_name, child) in map.fields() {
                encode_field(&mut data, child_name, child, depth + 1)?;
            }
            FieldType::Map
        }
    };

    buf.put_u8(field_type.into());
    buf.put_u8(name.len() as u8);
    buf.put_u32(data.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.put_slice(&data);

    Ok(())
}

/// Little-endian, minimal length; zero has no data bytes.
fn encode_s64(buf: &mut BytesMut, value: i64) {
    let mut u = value as u64;
    while u != 0 {
        buf.put_u8(u as u8);
        u >>= 8;
    }
}

fn decode_s64(data: &[u8], field_type: u8) -> Result<i64, ProtocolError> {
    if data.len() > 8 {
        return Err(ProtocolError::InvalidFieldLength {
            field_type,
            len: data.len(),
        });
    }
    let u = data
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (*b as u64) << (8 * i));
    Ok(u as i64)
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not hold a complete frame yet; in
/// that case nothing is consumed. A complete frame is always consumed, even
/// when its body turns out to be malformed ([`ProtocolError::BadFrame`]).
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let body_len = (&buf[..LENGTH_PREFIX_SIZE]).get_u32();
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len, MAX_FRAME_SIZE));
    }

    let frame_len = LENGTH_PREFIX_SIZE + body_len as usize;
    if buf.len() < frame_len {
        buf.reserve(frame_len - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(body_len as usize).freeze();

    decode_body(body).map(Some).map_err(|e| ProtocolError::BadFrame {
        frame_len,
        source: Box::new(e),
    })
}

/// Decode a frame body (without its length prefix) into a message.
pub fn decode_body(body: Bytes) -> Result<Message, ProtocolError> {
    decode_map(body, 0)
}

fn decode_map(mut body: Bytes, depth: usize) -> Result<Message, ProtocolError> {
    let mut msg = Message::new();
    while body.has_remaining() {
        let (name, value) = decode_field(&mut body, depth)?;
        msg.put(&name, value);
    }
    Ok(msg)
}

fn ensure_remaining(buf: &Bytes, expected: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < expected {
        return Err(ProtocolError::IncompleteFrame {
            expected,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn decode_utf8(bytes: Bytes) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::InvalidUtf8(e.to_string()))
}

fn decode_field(buf: &mut Bytes, depth: usize) -> Result<(String, Value), ProtocolError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
    }

    ensure_remaining(buf, FIELD_HEADER_SIZE)?;
    let type_byte = buf.get_u8();
    let name_len = buf.get_u8() as usize;
    let data_len = buf.get_u32() as usize;

    ensure_remaining(buf, name_len)?;
    let name = decode_utf8(buf.split_to(name_len))?;

    ensure_remaining(buf, data_len)?;
    let mut data = buf.split_to(data_len);

    let field_type = FieldType::try_from(type_byte).map_err(ProtocolError::InvalidFieldType)?;
    let value = match field_type {
        FieldType::S64 | FieldType::Bool => Value::Int(decode_s64(&data, type_byte)?),
        FieldType::Str => Value::Str(decode_utf8(data)?),
        FieldType::Bin => Value::Bin(data.to_vec()),
        FieldType::Uuid => {
            if data_len != 16 {
                return Err(ProtocolError::InvalidFieldLength {
                    field_type: type_byte,
                    len: data_len,
                });
            }
            Value::Bin(data.to_vec())
        }
        FieldType::Dbl => {
            if data_len != 8 {
                return Err(ProtocolError::InvalidFieldLength {
                    field_type: type_byte,
                    len: data_len,
                });
            }
            Value::Double(data.get_f64_le())
        }
        FieldType::List => {
            let mut items = Vec::new();
            while data.has_remaining() {
                let (_, item) = decode_field(&mut data, depth + 1)?;
                items.push(item);
            }
            Value::List(items)
        }
        FieldType::Map => Value::Map(decode_map(data, depth + 1)?),
    };

    Ok((name, value))
}
