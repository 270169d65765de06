// Field value vectors and their per-type payload encodings.
use bytes::{BufMut, Bytes, BytesMut};

use crate::message::{rolling_checksum, Message};
use crate::{Error, Result};

/// Type codes carried on the wire for each field.  Any code outside this set
/// decodes as an opaque blob tagged with that code.
pub mod type_code {
    use crate::fourcc;

    pub const BOOL: u32 = fourcc(*b"BOOL");
    pub const INT8: u32 = fourcc(*b"BYTE");
    pub const UINT8: u32 = fourcc(*b"UBYT");
    pub const INT16: u32 = fourcc(*b"SHRT");
    pub const UINT16: u32 = fourcc(*b"USHT");
    pub const INT32: u32 = fourcc(*b"LONG");
    pub const UINT32: u32 = fourcc(*b"ULNG");
    pub const INT64: u32 = fourcc(*b"LLNG");
    pub const UINT64: u32 = fourcc(*b"ULLG");
    pub const FLOAT: u32 = fourcc(*b"FLOT");
    pub const DOUBLE: u32 = fourcc(*b"DBLE");
    pub const STRING: u32 = fourcc(*b"CSTR");
    pub const POINT: u32 = fourcc(*b"BPNT");
    pub const RECT: u32 = fourcc(*b"RECT");
    pub const MESSAGE: u32 = fourcc(*b"MSGG");
}

/// Two-float point value, transported as its little-endian bit patterns.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Four-float rectangle value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// One field of a [`Message`]: a homogeneous vector of typed values.
///
/// ```
/// use muscle_wire::{type_code, Field};
///
/// let field = Field::Int32(vec![1, -2, 3]);
/// assert_eq!(field.type_code(), type_code::INT32);
/// assert_eq!(field.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Bool(Vec<bool>),
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
    Point(Vec<Point>),
    Rect(Vec<Rect>),
    Message(Vec<Message>),
    /// Opaque per-item byte payloads tagged with an application type code.
    Blob { type_code: u32, items: Vec<Bytes> },
}

impl Field {
    pub fn type_code(&self) -> u32 {
        match self {
            Field::Bool(_) => type_code::BOOL,
            Field::Int8(_) => type_code::INT8,
            Field::UInt8(_) => type_code::UINT8,
            Field::Int16(_) => type_code::INT16,
            Field::UInt16(_) => type_code::UINT16,
            Field::Int32(_) => type_code::INT32,
            Field::UInt32(_) => type_code::UINT32,
            Field::Int64(_) => type_code::INT64,
            Field::UInt64(_) => type_code::UINT64,
            Field::Float(_) => type_code::FLOAT,
            Field::Double(_) => type_code::DOUBLE,
            Field::String(_) => type_code::STRING,
            Field::Point(_) => type_code::POINT,
            Field::Rect(_) => type_code::RECT,
            Field::Message(_) => type_code::MESSAGE,
            Field::Blob { type_code, .. } => *type_code,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Field::Bool(v) => v.len(),
            Field::Int8(v) => v.len(),
            Field::UInt8(v) => v.len(),
            Field::Int16(v) => v.len(),
            Field::UInt16(v) => v.len(),
            Field::Int32(v) => v.len(),
            Field::UInt32(v) => v.len(),
            Field::Int64(v) => v.len(),
            Field::UInt64(v) => v.len(),
            Field::Float(v) => v.len(),
            Field::Double(v) => v.len(),
            Field::String(v) => v.len(),
            Field::Point(v) => v.len(),
            Field::Rect(v) => v.len(),
            Field::Message(v) => v.len(),
            Field::Blob { items, .. } => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn payload_size(&self) -> usize {
        match self {
            Field::Bool(v) => v.len(),
            Field::Int8(v) => v.len(),
            Field::UInt8(v) => v.len(),
            Field::Int16(v) => v.len() * 2,
            Field::UInt16(v) => v.len() * 2,
            Field::Int32(v) => v.len() * 4,
            Field::UInt32(v) => v.len() * 4,
            Field::Int64(v) => v.len() * 8,
            Field::UInt64(v) => v.len() * 8,
            Field::Float(v) => v.len() * 4,
            Field::Double(v) => v.len() * 8,
            Field::Point(v) => v.len() * 8,
            Field::Rect(v) => v.len() * 16,
            Field::String(v) => 4 + v.iter().map(|s| s.len() + 1).sum::<usize>(),
            Field::Message(v) => 4 + v.iter().map(|m| 4 + m.flattened_size()).sum::<usize>(),
            Field::Blob { items, .. } => 4 + items.iter().map(|b| 4 + b.len()).sum::<usize>(),
        }
    }

    pub(crate) fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Field::Bool(v) => {
                for b in v {
                    buf.put_u8(u8::from(*b));
                }
            }
            Field::Int8(v) => {
                for x in v {
                    buf.put_i8(*x);
                }
            }
            Field::UInt8(v) => buf.put_slice(v),
            Field::Int16(v) => {
                for x in v {
                    buf.put_i16_le(*x);
                }
            }
            Field::UInt16(v) => {
                for x in v {
                    buf.put_u16_le(*x);
                }
            }
            Field::Int32(v) => {
                for x in v {
                    buf.put_i32_le(*x);
                }
            }
            Field::UInt32(v) => {
                for x in v {
                    buf.put_u32_le(*x);
                }
            }
            Field::Int64(v) => {
                for x in v {
                    buf.put_i64_le(*x);
                }
            }
            Field::UInt64(v) => {
                for x in v {
                    buf.put_u64_le(*x);
                }
            }
            Field::Float(v) => {
                for x in v {
                    buf.put_f32_le(*x);
                }
            }
            Field::Double(v) => {
                for x in v {
                    buf.put_f64_le(*x);
                }
            }
            Field::Point(v) => {
                for p in v {
                    buf.put_f32_le(p.x);
                    buf.put_f32_le(p.y);
                }
            }
            Field::Rect(v) => {
                for r in v {
                    buf.put_f32_le(r.left);
                    buf.put_f32_le(r.top);
                    buf.put_f32_le(r.right);
                    buf.put_f32_le(r.bottom);
                }
            }
            Field::String(v) => {
                buf.put_u32_le(v.len() as u32);
                for s in v {
                    buf.put_slice(s.as_bytes());
                    buf.put_u8(0);
                }
            }
            Field::Message(v) => {
                buf.put_u32_le(v.len() as u32);
                for m in v {
                    buf.put_u32_le(m.flattened_size() as u32);
                    m.flatten_into(buf);
                }
            }
            Field::Blob { items, .. } => {
                buf.put_u32_le(items.len() as u32);
                for item in items {
                    buf.put_u32_le(item.len() as u32);
                    buf.put_slice(item);
                }
            }
        }
    }

    pub(crate) fn decode_payload(code: u32, payload: &[u8], depth: usize) -> Result<Field> {
        Ok(match code {
            type_code::BOOL => Field::Bool(payload.iter().map(|b| *b != 0).collect()),
            type_code::INT8 => Field::Int8(payload.iter().map(|b| *b as i8).collect()),
            type_code::UINT8 => Field::UInt8(payload.to_vec()),
            type_code::INT16 => Field::Int16(decode_scalars(payload, i16::from_le_bytes)?),
            type_code::UINT16 => Field::UInt16(decode_scalars(payload, u16::from_le_bytes)?),
            type_code::INT32 => Field::Int32(decode_scalars(payload, i32::from_le_bytes)?),
            type_code::UINT32 => Field::UInt32(decode_scalars(payload, u32::from_le_bytes)?),
            type_code::INT64 => Field::Int64(decode_scalars(payload, i64::from_le_bytes)?),
            type_code::UINT64 => Field::UInt64(decode_scalars(payload, u64::from_le_bytes)?),
            type_code::FLOAT => Field::Float(decode_scalars(payload, f32::from_le_bytes)?),
            type_code::DOUBLE => Field::Double(decode_scalars(payload, f64::from_le_bytes)?),
            type_code::POINT => {
                let floats: Vec<f32> = decode_scalars(payload, f32::from_le_bytes)?;
                if floats.len() % 2 != 0 {
                    return Err(Error::BadData("point payload not a multiple of two floats"));
                }
                Field::Point(
                    floats
                        .chunks_exact(2)
                        .map(|c| Point { x: c[0], y: c[1] })
                        .collect(),
                )
            }
            type_code::RECT => {
                let floats: Vec<f32> = decode_scalars(payload, f32::from_le_bytes)?;
                if floats.len() % 4 != 0 {
                    return Err(Error::BadData("rect payload not a multiple of four floats"));
                }
                Field::Rect(
                    floats
                        .chunks_exact(4)
                        .map(|c| Rect {
                            left: c[0],
                            top: c[1],
                            right: c[2],
                            bottom: c[3],
                        })
                        .collect(),
                )
            }
            type_code::STRING => Field::String(decode_strings(payload)?),
            type_code::MESSAGE => {
                let mut items = Vec::new();
                for chunk in decode_length_prefixed(payload)? {
                    items.push(Message::unflatten_at_depth(chunk, depth + 1)?);
                }
                Field::Message(items)
            }
            other => Field::Blob {
                type_code: other,
                items: decode_length_prefixed(payload)?
                    .into_iter()
                    .map(Bytes::copy_from_slice)
                    .collect(),
            },
        })
    }

    pub(crate) fn checksum(&self, acc: u32) -> u32 {
        match self {
            Field::Bool(v) => v.iter().fold(acc, |a, b| mix_u32(a, u32::from(*b))),
            Field::Int8(v) => v.iter().fold(acc, |a, x| mix_u32(a, *x as u32)),
            Field::UInt8(v) => rolling_checksum(acc, v),
            Field::Int16(v) => v.iter().fold(acc, |a, x| mix_u32(a, *x as u32)),
            Field::UInt16(v) => v.iter().fold(acc, |a, x| mix_u32(a, u32::from(*x))),
            Field::Int32(v) => v.iter().fold(acc, |a, x| mix_u32(a, *x as u32)),
            Field::UInt32(v) => v.iter().fold(acc, |a, x| mix_u32(a, *x)),
            Field::Int64(v) => v.iter().fold(acc, |a, x| mix_u64(a, *x as u64)),
            Field::UInt64(v) => v.iter().fold(acc, |a, x| mix_u64(a, *x)),
            Field::Float(v) => v.iter().fold(acc, |a, x| mix_u32(a, x.to_bits())),
            Field::Double(v) => v.iter().fold(acc, |a, x| mix_u64(a, x.to_bits())),
            Field::Point(v) => v.iter().fold(acc, |a, p| {
                mix_u32(mix_u32(a, p.x.to_bits()), p.y.to_bits())
            }),
            Field::Rect(v) => v.iter().fold(acc, |a, r| {
                let a = mix_u32(a, r.left.to_bits());
                let a = mix_u32(a, r.top.to_bits());
                let a = mix_u32(a, r.right.to_bits());
                mix_u32(a, r.bottom.to_bits())
            }),
            Field::String(v) => v
                .iter()
                .fold(acc, |a, s| rolling_checksum(a, s.as_bytes())),
            Field::Message(v) => v.iter().fold(acc, |a, m| mix_u32(a, m.checksum())),
            Field::Blob { items, .. } => {
                items.iter().fold(acc, |a, b| rolling_checksum(a, b))
            }
        }
    }
}

pub(crate) fn mix_u32(acc: u32, value: u32) -> u32 {
    rolling_checksum(acc, &value.to_le_bytes())
}

pub(crate) fn mix_u64(acc: u32, value: u64) -> u32 {
    rolling_checksum(acc, &value.to_le_bytes())
}

fn decode_scalars<T, const N: usize>(payload: &[u8], from_le: fn([u8; N]) -> T) -> Result<Vec<T>> {
    if payload.len() % N != 0 {
        return Err(Error::BadData("scalar payload not a multiple of element size"));
    }
    Ok(payload
        .chunks_exact(N)
        .map(|c| from_le(c.try_into().expect("chunk size")))
        .collect())
}

// Strings travel as a count followed by that many NUL-terminated UTF-8 runs.
fn decode_strings(payload: &[u8]) -> Result<Vec<String>> {
    let (count, mut rest) = split_count(payload)?;
    let mut out = Vec::new();
    for _ in 0..count {
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::BadData("unterminated string item"))?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| Error::BadData("string item is not UTF-8"))?;
        out.push(s.to_owned());
        rest = &rest[nul + 1..];
    }
    if !rest.is_empty() {
        return Err(Error::BadData("trailing bytes after string items"));
    }
    Ok(out)
}

// Messages and blobs travel as a count followed by per-item length + bytes.
fn decode_length_prefixed(payload: &[u8]) -> Result<Vec<&[u8]>> {
    let (count, mut rest) = split_count(payload)?;
    let mut out = Vec::new();
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(Error::BadData("truncated item length"));
        }
        let len = u32::from_le_bytes(rest[..4].try_into().expect("length prefix")) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(Error::BadData("item length exceeds payload"));
        }
        out.push(&rest[..len]);
        rest = &rest[len..];
    }
    if !rest.is_empty() {
        return Err(Error::BadData("trailing bytes after counted items"));
    }
    Ok(out)
}

fn split_count(payload: &[u8]) -> Result<(usize, &[u8])> {
    if payload.len() < 4 {
        return Err(Error::BadData("truncated item count"));
    }
    let count = u32::from_le_bytes(payload[..4].try_into().expect("count prefix")) as usize;
    Ok((count, &payload[4..]))
}
