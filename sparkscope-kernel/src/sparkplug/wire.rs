//! Protobuf wire-format primitives used by the Sparkplug B codec.
//!
//! Only the four wire types Sparkplug needs are supported: varint, 64-bit,
//! length-delimited and 32-bit. Group wire types are rejected.

use crate::error::DecodeError;
use bytes::{Buf, BufMut, BytesMut};

pub(crate) const VARINT: u8 = 0;
pub(crate) const FIXED64: u8 = 1;
pub(crate) const LEN: u8 = 2;
pub(crate) const FIXED32: u8 = 5;

/// Cursor over one protobuf message. Offsets in errors are absolute
/// positions within the outermost payload.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    total: usize,
    base: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            buf: data,
            total: data.len(),
            base: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.base + self.total - self.buf.remaining()
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.offset();
        let mut value = 0u64;
        for index in 0..10 {
            if !self.buf.has_remaining() {
                return Err(DecodeError::Truncated { offset: start });
            }
            let byte = self.buf.get_u8();
            value |= u64::from(byte & 0x7f) << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::VarintOverflow { offset: start })
    }

    /// Reads a field key and splits it into (field number, wire type).
    pub fn read_key(&mut self) -> Result<(u32, u8), DecodeError> {
        let at = self.offset();
        let key = self.read_varint()?;
        let field = u32::try_from(key >> 3).map_err(|_| DecodeError::InvalidField { offset: at })?;
        if field == 0 {
            return Err(DecodeError::InvalidField { offset: at });
        }
        Ok((field, (key & 0x07) as u8))
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_varint()? != 0)
    }

    pub fn read_fixed32(&mut self) -> Result<u32, DecodeError> {
        if self.buf.remaining() < 4 {
            return Err(DecodeError::Truncated { offset: self.offset() });
        }
        Ok(self.buf.get_u32_le())
    }

    pub fn read_fixed64(&mut self) -> Result<u64, DecodeError> {
        if self.buf.remaining() < 8 {
            return Err(DecodeError::Truncated { offset: self.offset() });
        }
        Ok(self.buf.get_u64_le())
    }

    pub fn read_slice(&mut self) -> Result<&'a [u8], DecodeError> {
        let at = self.offset();
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::Truncated { offset: at })?;
        if len > self.buf.len() {
            return Err(DecodeError::Truncated { offset: at });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a length-delimited field as an embedded message.
    pub fn read_message(&mut self) -> Result<WireReader<'a>, DecodeError> {
        let slice = self.read_slice()?;
        Ok(WireReader {
            buf: slice,
            total: slice.len(),
            base: self.offset() - slice.len(),
        })
    }

    pub fn read_string(&mut self, field: u32) -> Result<String, DecodeError> {
        let slice = self.read_slice()?;
        std::str::from_utf8(slice)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    pub fn skip(&mut self, field: u32, wire_type: u8) -> Result<(), DecodeError> {
        match wire_type {
            VARINT => self.read_varint().map(drop),
            FIXED64 => self.read_fixed64().map(drop),
            LEN => self.read_slice().map(drop),
            FIXED32 => self.read_fixed32().map(drop),
            other => Err(DecodeError::WireType { field, wire_type: other }),
        }
    }
}

#[derive(Default)]
pub(crate) struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        self.varint((u64::from(field) << 3) | u64::from(wire_type));
    }

    fn varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8(((value & 0x7f) as u8) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    pub fn uint64(&mut self, field: u32, value: u64) {
        self.key(field, VARINT);
        self.varint(value);
    }

    pub fn uint32(&mut self, field: u32, value: u32) {
        self.uint64(field, u64::from(value));
    }

    pub fn boolean(&mut self, field: u32, value: bool) {
        self.uint64(field, u64::from(value));
    }

    pub fn float(&mut self, field: u32, value: f32) {
        self.key(field, FIXED32);
        self.buf.put_f32_le(value);
    }

    pub fn double(&mut self, field: u32, value: f64) {
        self.key(field, FIXED64);
        self.buf.put_f64_le(value);
    }

    pub fn bytes(&mut self, field: u32, value: &[u8]) {
        self.key(field, LEN);
        self.varint(value.len() as u64);
        self.buf.put_slice(value);
    }

    pub fn string(&mut self, field: u32, value: &str) {
        self.bytes(field, value.as_bytes());
    }

    /// Encodes an embedded message built by `build` as a length-delimited field.
    pub fn message<F>(&mut self, field: u32, build: F)
    where
        F: FnOnce(&mut WireWriter),
    {
        let mut inner = WireWriter::new();
        build(&mut inner);
        self.bytes(field, &inner.buf);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_multi_byte() {
        let mut writer = WireWriter::new();
        writer.uint64(1, 300);
        let bytes = writer.into_vec();
        assert_eq!(bytes, vec![0x08, 0xAC, 0x02]);

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_key().unwrap(), (1, VARINT));
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_truncated_slice_reports_offset() {
        // field 2, LEN, declared length 5 but only 2 bytes follow
        let bytes = [0x12, 0x05, 0x01, 0x02];
        let mut reader = WireReader::new(&bytes);
        reader.read_key().unwrap();
        assert_eq!(reader.read_slice(), Err(DecodeError::Truncated { offset: 1 }));
    }

    #[test]
    fn test_varint_overflow() {
        let bytes = [0xFF; 11];
        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_varint(), Err(DecodeError::VarintOverflow { offset: 0 }));
    }

    #[test]
    fn test_skip_rejects_group_wire_type() {
        let mut reader = WireReader::new(&[]);
        assert_eq!(
            reader.skip(7, 3),
            Err(DecodeError::WireType { field: 7, wire_type: 3 })
        );
    }
}
