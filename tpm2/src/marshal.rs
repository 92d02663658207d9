// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 wire codec
//!
//! All integers are big-endian. Byte buffers (TPM2B) carry a 2-byte length prefix.

use crate::error::{Error, Result};

/// Buffer for building TPM commands
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    pub fn put_tpm2b(&mut self, data: &[u8]) -> Result<()> {
        let len = u16::try_from(data.len()).map_err(|_| {
            Error::InvalidArgument(format!(
                "sized buffer of {} bytes exceeds 65535",
                data.len()
            ))
        })?;
        self.put_u16(len);
        self.put_bytes(data);
        Ok(())
    }

    /// Put an empty TPM2B structure
    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite a u32 at `pos` (size fields patched after the body is known)
    pub fn update_u32(&mut self, pos: usize, v: u32) -> Result<()> {
        let slot = pos
            .checked_add(4)
            .and_then(|end| self.data.get_mut(pos..end))
            .ok_or_else(|| Error::InvalidArgument(format!("no u32 slot at offset {pos}")))?;
        slot.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }
}

/// Cursor over a response body.
///
/// Every read checks the remaining length first and fails with
/// [`Error::ShortBuffer`] instead of panicking.
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::ShortBuffer {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let data: &'a [u8] = self.data;
        let out = &data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        bytes
            .try_into()
            .map_err(|_| Error::decode(format!("expected {N} bytes")))
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// TPMI_YES_NO: a single byte that must be 0 or 1
    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::decode(format!("invalid boolean byte 0x{v:02x}"))),
        }
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get remaining bytes
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// Peek at bytes without advancing position
    pub fn peek_bytes(&self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::ShortBuffer {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let data: &'a [u8] = self.data;
        Ok(&data[self.pos..self.pos + len])
    }

    /// Fail unless every byte has been consumed
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::decode(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf)?;
        Ok(buf.into_vec())
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        Self::unmarshal(&mut buf)
    }
}

macro_rules! impl_primitive {
    ($ty:ty, $put:ident, $get:ident) => {
        impl Marshal for $ty {
            fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
                buf.$put(*self);
                Ok(())
            }
        }

        impl Unmarshal for $ty {
            fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                buf.$get()
            }
        }
    };
}

impl_primitive!(u8, put_u8, get_u8);
impl_primitive!(u16, put_u16, get_u16);
impl_primitive!(u32, put_u32, get_u32);
impl_primitive!(u64, put_u64, get_u64);

/// Shape of one value in a flat wire layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Bool,
    U8,
    U16,
    U32,
    U64,
    Bytes,
}

/// A value in a flat wire layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
}

impl WireValue {
    pub fn kind(&self) -> WireKind {
        match self {
            WireValue::Bool(_) => WireKind::Bool,
            WireValue::U8(_) => WireKind::U8,
            WireValue::U16(_) => WireKind::U16,
            WireValue::U32(_) => WireKind::U32,
            WireValue::U64(_) => WireKind::U64,
            WireValue::Bytes(_) => WireKind::Bytes,
        }
    }
}

impl Marshal for WireValue {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        match self {
            WireValue::Bool(v) => buf.put_u8(u8::from(*v)),
            WireValue::U8(v) => buf.put_u8(*v),
            WireValue::U16(v) => buf.put_u16(*v),
            WireValue::U32(v) => buf.put_u32(*v),
            WireValue::U64(v) => buf.put_u64(*v),
            WireValue::Bytes(v) => buf.put_tpm2b(v)?,
        }
        Ok(())
    }
}

/// Pack values back to back.
pub fn pack(values: &[WireValue]) -> Result<Vec<u8>> {
    let mut buf = CommandBuffer::new();
    for value in values {
        value.marshal(&mut buf)?;
    }
    Ok(buf.into_vec())
}

/// Unpack `data` according to `layout`. The whole input must be consumed.
pub fn unpack(data: &[u8], layout: &[WireKind]) -> Result<Vec<WireValue>> {
    let mut buf = ResponseBuffer::new(data);
    let values = layout
        .iter()
        .map(|kind| {
            Ok(match kind {
                WireKind::Bool => WireValue::Bool(buf.get_bool()?),
                WireKind::U8 => WireValue::U8(buf.get_u8()?),
                WireKind::U16 => WireValue::U16(buf.get_u16()?),
                WireKind::U32 => WireValue::U32(buf.get_u32()?),
                WireKind::U64 => WireValue::U64(buf.get_u64()?),
                WireKind::Bytes => WireValue::Bytes(buf.get_tpm2b()?),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    buf.finish()?;
    Ok(values)
}
