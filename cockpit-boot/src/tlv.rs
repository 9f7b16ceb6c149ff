// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Tag-length-value field encoding used inside message bodies.
//!
//! Each field is `id: u8`, a length, then the value. Lengths up to 254 take
//! one byte; longer values use the escape byte `0xFF` followed by a
//! big-endian `u16`. Integers are big-endian with exact widths.

use crate::error::{EncodeError, Malformation};

/// Length byte announcing a two-byte length.
pub const EXTENDED_LENGTH: u8 = 0xFF;

/// Writes a tag byte and TLV fields into a caller-supplied buffer.
pub struct TlvWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> TlvWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(EncodeError::BufferFull {
                capacity: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Raw message tag.
    pub fn tag(&mut self, tag: u8) -> Result<(), EncodeError> {
        self.put(&[tag])
    }

    pub fn bytes(&mut self, id: u8, value: &[u8]) -> Result<(), EncodeError> {
        let len = value.len();
        if len < EXTENDED_LENGTH as usize {
            self.put(&[id, len as u8])?;
        } else {
            let len = u16::try_from(len).map_err(|_| EncodeError::FieldTooLong { id, len })?;
            self.put(&[id, EXTENDED_LENGTH])?;
            self.put(&len.to_be_bytes())?;
        }
        self.put(value)
    }

    pub fn u8(&mut self, id: u8, value: u8) -> Result<(), EncodeError> {
        self.bytes(id, &[value])
    }

    pub fn u16(&mut self, id: u8, value: u16) -> Result<(), EncodeError> {
        self.bytes(id, &value.to_be_bytes())
    }

    pub fn u32(&mut self, id: u8, value: u32) -> Result<(), EncodeError> {
        self.bytes(id, &value.to_be_bytes())
    }

    pub fn bool(&mut self, id: u8, value: bool) -> Result<(), EncodeError> {
        self.u8(id, value as u8)
    }

    pub fn str(&mut self, id: u8, value: &str) -> Result<(), EncodeError> {
        self.bytes(id, value.as_bytes())
    }

    /// Omitted entirely when `None`.
    pub fn opt_u32(&mut self, id: u8, value: Option<u32>) -> Result<(), EncodeError> {
        match value {
            Some(v) => self.u32(id, v),
            None => Ok(()),
        }
    }

    /// Bytes written so far.
    pub fn finish(self) -> usize {
        self.pos
    }
}

/// One decoded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub id: u8,
    pub value: &'a [u8],
}

impl<'a> Field<'a> {
    fn exact<const W: usize>(&self) -> Result<[u8; W], Malformation> {
        self.value.try_into().map_err(|_| Malformation::BadWidth {
            id: self.id,
            len: self.value.len(),
            expected: W,
        })
    }

    pub fn as_u8(&self) -> Result<u8, Malformation> {
        Ok(self.exact::<1>()?[0])
    }

    pub fn as_u16(&self) -> Result<u16, Malformation> {
        Ok(u16::from_be_bytes(self.exact()?))
    }

    pub fn as_u32(&self) -> Result<u32, Malformation> {
        Ok(u32::from_be_bytes(self.exact()?))
    }

    pub fn as_bool(&self) -> Result<bool, Malformation> {
        match self.as_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Malformation::BadValue { id: self.id }),
        }
    }

    pub fn as_str(&self) -> Result<&'a str, Malformation> {
        core::str::from_utf8(self.value).map_err(|_| Malformation::BadValue { id: self.id })
    }
}

/// Iterates the fields of a body (after the tag byte).
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, id: u8) -> Result<&'a [u8], Malformation> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(Malformation::Truncated { id })?;
        self.pos = end;
        Ok(slice)
    }

    fn read_field(&mut self, id: u8) -> Result<Field<'a>, Malformation> {
        let len = match self.take(1, id)?[0] {
            EXTENDED_LENGTH => {
                let raw = self.take(2, id)?;
                u16::from_be_bytes([raw[0], raw[1]]) as usize
            }
            short => short as usize,
        };
        let value = self.take(len, id)?;
        Ok(Field { id, value })
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<Field<'a>, Malformation>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.data.get(self.pos)?;
        self.pos += 1;

        let field = self.read_field(id);

        if field.is_err() {
            // Nothing after a truncated field can be trusted.
            self.pos = self.data.len();
        }
        Some(field)
    }
}
