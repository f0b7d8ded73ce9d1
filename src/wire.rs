//! Untyped protobuf field walking over packet buffers.
//!
//! Redaction rewrites a handful of fields inside a `TracePacket` and must
//! leave every other field byte-for-byte intact. rust-protobuf only offers
//! full-message parsing, so this module provides the field-level view: a
//! [`FieldReader`] that walks an encoded buffer yielding borrowed
//! [`Field`]s, and a [`MessageBuffer`] that reassembles an output message
//! from verbatim copies and rebuilt fields.

use anyhow::{bail, Result};
use protobuf::{Message, MessageFull};

/// Protobuf wire types. Group types are rejected by the reader; Perfetto
/// traces never contain them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    Len,
    Fixed32,
}

impl WireType {
    fn from_tag(tag: u64) -> Result<WireType> {
        match tag & 0x7 {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::Len),
            5 => Ok(WireType::Fixed32),
            other => bail!("unsupported wire type {other}"),
        }
    }
}

/// One field of an encoded message.
///
/// `raw` spans the tag through the end of the payload, so appending it to an
/// output buffer copies the field verbatim. For `Len` fields `payload` is the
/// content bytes (a nested message, string, or packed array); for scalar
/// fields it is the encoded scalar.
#[derive(Debug, Clone, Copy)]
pub struct Field<'a> {
    pub id: u32,
    pub wire_type: WireType,
    pub raw: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> Field<'a> {
    /// Decodes the payload of a varint field.
    pub fn varint(&self) -> Result<u64> {
        if self.wire_type != WireType::Varint {
            bail!("field {} is not a varint", self.id);
        }
        let (value, _) = read_varint(self.payload, 0)?;
        Ok(value)
    }
}

/// Sequential reader over the fields of one encoded message.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> FieldReader<'a> {
        FieldReader { buf, pos: 0 }
    }

    /// Reads the next field, or `None` at the end of the buffer.
    pub fn read_field(&mut self) -> Result<Option<Field<'a>>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let start = self.pos;
        let (tag, tag_end) = read_varint(self.buf, self.pos)?;
        let id = (tag >> 3) as u32;
        if id == 0 {
            bail!("field id 0 at offset {start}");
        }
        let wire_type = WireType::from_tag(tag)?;

        let (payload_start, payload_end) = match wire_type {
            WireType::Varint => {
                let (_, end) = read_varint(self.buf, tag_end)?;
                (tag_end, end)
            }
            WireType::Fixed64 => (tag_end, tag_end + 8),
            WireType::Fixed32 => (tag_end, tag_end + 4),
            WireType::Len => {
                let (len, len_end) = read_varint(self.buf, tag_end)?;
                let Some(end) = usize::try_from(len)
                    .ok()
                    .and_then(|len| len_end.checked_add(len))
                else {
                    bail!("field {id} length {len} overflows buffer");
                };
                (len_end, end)
            }
        };

        if payload_end > self.buf.len() {
            bail!("field {id} overruns buffer ({payload_end} > {})", self.buf.len());
        }

        self.pos = payload_end;
        Ok(Some(Field {
            id,
            wire_type,
            raw: &self.buf[start..payload_end],
            payload: &self.buf[payload_start..payload_end],
        }))
    }
}

fn read_varint(buf: &[u8], mut pos: usize) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let Some(&byte) = buf.get(pos) else {
            bail!("varint overruns buffer at offset {pos}");
        };
        if shift >= 64 {
            bail!("varint longer than 10 bytes at offset {pos}");
        }
        value |= u64::from(byte & 0x7f) << shift;
        pos += 1;
        if byte & 0x80 == 0 {
            return Ok((value, pos));
        }
        shift += 7;
    }
}

/// Output message assembly. Encoded fields concatenate, so an output message
/// is just verbatim copies interleaved with rebuilt fields.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    bytes: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> MessageBuffer {
        MessageBuffer::default()
    }

    /// Copies an encoded field (tag and payload) verbatim.
    pub fn append_raw(&mut self, raw: &[u8]) {
        self.bytes.extend_from_slice(raw);
    }

    /// Writes a length-delimited field from already-encoded content bytes.
    pub fn append_len_field(&mut self, id: u32, payload: &[u8]) {
        self.push_varint(u64::from(id) << 3 | 2);
        self.push_varint(payload.len() as u64);
        self.bytes.extend_from_slice(payload);
    }

    /// Serializes a message and writes it as a length-delimited field.
    pub fn append_message<M: Message>(&mut self, id: u32, message: &M) -> Result<()> {
        let payload = message.write_to_bytes()?;
        self.append_len_field(id, &payload);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn push_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.bytes.push(byte);
                return;
            }
            self.bytes.push(byte | 0x80);
        }
    }
}

/// Resolves a field's number from the generated descriptors, so field ids can
/// never disagree with the linked `perfetto_protos` build. Panics on a field
/// name that does not exist in the descriptor; callers only pass literals.
pub fn field_number<M: MessageFull>(name: &str) -> u32 {
    M::descriptor()
        .field_by_name(name)
        .unwrap_or_else(|| panic!("{} has no field named {name}", M::descriptor().name()))
        .proto()
        .number() as u32
}
