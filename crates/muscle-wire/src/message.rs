// The typed dictionary and its flatten/unflatten codec.
use bytes::{BufMut, Bytes, BytesMut};

use crate::field::{mix_u32, Field};
use crate::{Error, Result};

/// Leading magic of every flattened message; identifies the encoding so a
/// peer can reject foreign byte streams before trusting any length field.
pub const MESSAGE_PROTOCOL_MAGIC: u32 = 1347235443;

// Nested messages deeper than this are rejected rather than recursed into.
const MAX_NESTING_DEPTH: usize = 64;

/// A what-code plus an insertion-ordered mapping of named, typed value
/// vectors.  Flattens to a self-describing byte stream any peer can decode
/// without an external schema.
///
/// ```
/// use muscle_wire::{Field, Message};
///
/// let mut msg = Message::new(1234);
/// msg.set_field("nums", Field::Int32(vec![1, -2, 3]));
/// let decoded = Message::unflatten(&msg.flatten()).expect("decode");
/// assert_eq!(decoded, msg);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub what: u32,
    // Field order is part of the wire contract, so fields live in insertion
    // order; lookups are linear over the handful of fields a message holds.
    fields: Vec<(String, Field)>,
}

impl Message {
    pub fn new(what: u32) -> Self {
        Self {
            what,
            fields: Vec::new(),
        }
    }

    /// Replaces the named field in place, or appends it.
    pub fn set_field(&mut self, name: impl Into<String>, field: Field) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = field,
            None => self.fields.push((name, field)),
        }
    }

    /// Appends a value to the named field, creating it if absent.  Returns
    /// `TypeMismatch` when the field exists with a different type.
    pub fn add_field(&mut self, name: impl Into<String>, field: Field) -> Result<()> {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            None => {
                self.fields.push((name, field));
                Ok(())
            }
            Some((n, existing)) => {
                if existing.type_code() != field.type_code() {
                    return Err(Error::TypeMismatch {
                        name: n.clone(),
                        actual: existing.type_code(),
                        requested: field.type_code(),
                    });
                }
                append_items(existing, field);
                Ok(())
            }
        }
    }

    pub fn remove_field(&mut self, name: &str) -> Result<Field> {
        match self.fields.iter().position(|(n, _)| n == name) {
            Some(at) => Ok(self.fields.remove(at).1),
            None => Err(Error::NotFound(name.to_owned())),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    /// Typed lookup distinguishing `NotFound` from `TypeMismatch`.
    pub fn get(&self, name: &str, requested: u32) -> Result<&Field> {
        let field = self
            .field(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        if field.type_code() != requested {
            return Err(Error::TypeMismatch {
                name: name.to_owned(),
                actual: field.type_code(),
                requested,
            });
        }
        Ok(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    // Convenience accessors for the handful of shapes the protocol uses.

    pub fn strings(&self, name: &str) -> Result<&[String]> {
        match self.get(name, crate::type_code::STRING)? {
            Field::String(v) => Ok(v),
            _ => unreachable!("type checked above"),
        }
    }

    pub fn first_string(&self, name: &str) -> Result<&str> {
        self.strings(name)?
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn first_i32(&self, name: &str) -> Result<i32> {
        match self.get(name, crate::type_code::INT32)? {
            Field::Int32(v) => v.first().copied().ok_or_else(|| Error::NotFound(name.to_owned())),
            _ => unreachable!("type checked above"),
        }
    }

    pub fn first_bool(&self, name: &str) -> Result<bool> {
        match self.get(name, crate::type_code::BOOL)? {
            Field::Bool(v) => v.first().copied().ok_or_else(|| Error::NotFound(name.to_owned())),
            _ => unreachable!("type checked above"),
        }
    }

    pub fn messages(&self, name: &str) -> Result<&[Message]> {
        match self.get(name, crate::type_code::MESSAGE)? {
            Field::Message(v) => Ok(v),
            _ => unreachable!("type checked above"),
        }
    }

    pub fn first_message(&self, name: &str) -> Result<&Message> {
        self.messages(name)?
            .first()
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    /// Exact size in bytes of the flattened form.
    pub fn flattened_size(&self) -> usize {
        let mut size = 12; // magic + what + field count
        for (name, field) in &self.fields {
            size += 4 + name.len() + 1; // name length + bytes + NUL
            size += 4 + 4; // type code + payload length
            size += field.payload_size();
        }
        size
    }

    pub fn flatten(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.flattened_size());
        self.flatten_into(&mut buf);
        buf.freeze()
    }

    pub fn flatten_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(MESSAGE_PROTOCOL_MAGIC);
        buf.put_u32_le(self.what);
        buf.put_u32_le(self.fields.len() as u32);
        for (name, field) in &self.fields {
            buf.put_u32_le((name.len() + 1) as u32);
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32_le(field.type_code());
            buf.put_u32_le(field.payload_size() as u32);
            field.encode_payload(buf);
        }
    }

    pub fn unflatten(input: &[u8]) -> Result<Message> {
        Self::unflatten_at_depth(input, 0)
    }

    pub(crate) fn unflatten_at_depth(input: &[u8], depth: usize) -> Result<Message> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::BadData("message nesting too deep"));
        }
        let mut cur = Cursor { rest: input };
        if cur.u32()? != MESSAGE_PROTOCOL_MAGIC {
            return Err(Error::BadData("bad message magic"));
        }
        let what = cur.u32()?;
        let num_fields = cur.u32()?;
        let mut msg = Message::new(what);
        for _ in 0..num_fields {
            let name_len = cur.u32()? as usize;
            if name_len == 0 {
                return Err(Error::BadData("zero-length field name"));
            }
            let name_bytes = cur.bytes(name_len)?;
            if name_bytes[name_len - 1] != 0 {
                return Err(Error::BadData("field name not NUL-terminated"));
            }
            let name = std::str::from_utf8(&name_bytes[..name_len - 1])
                .map_err(|_| Error::BadData("field name is not UTF-8"))?;
            let code = cur.u32()?;
            let payload_len = cur.u32()? as usize;
            let payload = cur.bytes(payload_len)?;
            let field = Field::decode_payload(code, payload, depth)?;
            if msg.field(name).is_some() {
                return Err(Error::BadData("duplicate field name"));
            }
            msg.fields.push((name.to_owned(), field));
        }
        if !cur.rest.is_empty() {
            return Err(Error::BadData("trailing bytes after last field"));
        }
        Ok(msg)
    }

    /// Order-dependent rolling checksum over the what-code, field names,
    /// type codes, and typed payloads.
    pub fn checksum(&self) -> u32 {
        let mut acc = mix_u32(0, self.what);
        for (name, field) in &self.fields {
            acc = rolling_checksum(acc, name.as_bytes());
            acc = mix_u32(acc, field.type_code());
            acc = field.checksum(acc);
        }
        acc
    }
}

/// Folds bytes into a 32-bit rolling sum.  Not cryptographic; used for
/// tree-diff hints and test assertions only.
pub fn rolling_checksum(seed: u32, bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(seed, |acc, b| acc.rotate_left(5).wrapping_add(u32::from(*b)))
}

fn append_items(existing: &mut Field, incoming: Field) {
    match (existing, incoming) {
        (Field::Bool(a), Field::Bool(b)) => a.extend(b),
        (Field::Int8(a), Field::Int8(b)) => a.extend(b),
        (Field::UInt8(a), Field::UInt8(b)) => a.extend(b),
        (Field::Int16(a), Field::Int16(b)) => a.extend(b),
        (Field::UInt16(a), Field::UInt16(b)) => a.extend(b),
        (Field::Int32(a), Field::Int32(b)) => a.extend(b),
        (Field::UInt32(a), Field::UInt32(b)) => a.extend(b),
        (Field::Int64(a), Field::Int64(b)) => a.extend(b),
        (Field::UInt64(a), Field::UInt64(b)) => a.extend(b),
        (Field::Float(a), Field::Float(b)) => a.extend(b),
        (Field::Double(a), Field::Double(b)) => a.extend(b),
        (Field::String(a), Field::String(b)) => a.extend(b),
        (Field::Point(a), Field::Point(b)) => a.extend(b),
        (Field::Rect(a), Field::Rect(b)) => a.extend(b),
        (Field::Message(a), Field::Message(b)) => a.extend(b),
        (Field::Blob { items: a, .. }, Field::Blob { items: b, .. }) => a.extend(b),
        _ => unreachable!("type codes checked by caller"),
    }
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("four bytes")))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.rest.len() < n {
            return Err(Error::BadData("truncated message"));
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }
}
