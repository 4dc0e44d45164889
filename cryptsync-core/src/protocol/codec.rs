//! Binary field codec for wire frames.
//!
//! Every frame starts with the pinned wire version followed by the message
//! type name and its fields in declared order. Integers are big-endian,
//! byte strings carry a u32 length prefix, and the distinguished length
//! `0xFFFF_FFFF` encodes a null byte string (used for optional fields).

use thiserror::Error;
use uuid::Uuid;

/// Pinned wire format version. There is no negotiation; a frame with any
/// other version is rejected.
pub const WIRE_VERSION: u16 = 0x0506;

const NULL_LENGTH: u32 = u32::MAX;

/// Errors produced while encoding or decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Incomplete frame")]
    UnexpectedEof,

    #[error("Wire version mismatch: got {0:#06x}")]
    VersionMismatch(u16),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Invalid field value: {0}")]
    InvalidValue(&'static str),

    #[error("Required field is null: {0}")]
    NullField(&'static str),

    #[error("Trailing bytes after frame")]
    TrailingData,
}

/// Frame writer. Starts with the wire version.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&WIRE_VERSION.to_be_bytes());
        Self { buf }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_uuid(&mut self, value: Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        debug_assert!(value.len() < NULL_LENGTH as usize);
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    pub fn put_opt_bytes(&mut self, value: Option<&[u8]>) {
        match value {
            Some(bytes) => self.put_bytes(bytes),
            None => self.put_u32(NULL_LENGTH),
        }
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame reader over a received binary message.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader and consume the leading wire version.
    pub fn new(data: &'a [u8]) -> Result<Self, CodecError> {
        let mut reader = Self { data, pos: 0 };
        let version = reader.get_u16()?;
        if version != WIRE_VERSION {
            return Err(CodecError::VersionMismatch(version));
        }
        Ok(reader)
    }

    /// Bytes consumed so far, including the version prefix.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        if self.data.len() - self.pos < count {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::InvalidValue("bool")),
        }
    }

    pub fn get_uuid(&mut self) -> Result<Uuid, CodecError> {
        let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn get_opt_bytes(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let len = self.get_u32()?;
        if len == NULL_LENGTH {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        self.get_opt_bytes()?
            .ok_or(CodecError::NullField("byte string"))
    }

    pub fn get_str(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.get_bytes()?).map_err(|_| CodecError::InvalidValue("utf8 string"))
    }

    /// Read a list count and decode each element with `f`.
    pub fn get_list<T>(
        &mut self,
        f: impl Fn(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Vec<T>, CodecError> {
        let count = self.get_u32()? as usize;
        // A non-empty element occupies at least one byte.
        if count > self.data.len() - self.pos {
            return Err(CodecError::UnexpectedEof);
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }

    /// Remaining unread bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Assert the frame has been fully consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(CodecError::TrailingData)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_roundtrip() {
        let id = Uuid::new_v4();
        let mut writer = Writer::new();
        writer.put_u32(42);
        writer.put_u64(1 << 40);
        writer.put_bool(true);
        writer.put_uuid(id);
        writer.put_bytes(b"payload");
        writer.put_str("todo/42");
        writer.put_opt_bytes(None);
        let frame = writer.finish();

        let mut reader = Reader::new(&frame).unwrap();
        assert_eq!(reader.get_u32().unwrap(), 42);
        assert_eq!(reader.get_u64().unwrap(), 1 << 40);
        assert!(reader.get_bool().unwrap());
        assert_eq!(reader.get_uuid().unwrap(), id);
        assert_eq!(reader.get_bytes().unwrap(), b"payload");
        assert_eq!(reader.get_str().unwrap(), "todo/42");
        assert_eq!(reader.get_opt_bytes().unwrap(), None);
        reader.finish().unwrap();
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut frame = Writer::new().finish();
        frame[0] = 0x06;
        match Reader::new(&frame) {
            Err(CodecError::VersionMismatch(v)) => assert_eq!(v, 0x0606),
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_rejected() {
        let mut writer = Writer::new();
        writer.put_bytes(b"payload");
        let frame = writer.finish();

        let mut reader = Reader::new(&frame[..frame.len() - 2]).unwrap();
        assert_eq!(reader.get_bytes(), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut writer = Writer::new();
        writer.put_u32(0xFFFF_FF00);
        let frame = writer.finish();

        let mut reader = Reader::new(&frame).unwrap();
        assert_eq!(reader.get_bytes(), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn trailing_data_rejected() {
        let mut writer = Writer::new();
        writer.put_u32(1);
        let mut frame = writer.finish();
        frame.push(0x00);

        let mut reader = Reader::new(&frame).unwrap();
        reader.get_u32().unwrap();
        assert_eq!(reader.finish(), Err(CodecError::TrailingData));
    }

    #[test]
    fn null_required_field_rejected() {
        let mut writer = Writer::new();
        writer.put_opt_bytes(None);
        let frame = writer.finish();

        let mut reader = Reader::new(&frame).unwrap();
        assert!(matches!(reader.get_bytes(), Err(CodecError::NullField(_))));
    }

    #[test]
    fn list_roundtrip() {
        let mut writer = Writer::new();
        writer.put_u32(3);
        for value in [7u32, 8, 9] {
            writer.put_u32(value);
        }
        let frame = writer.finish();

        let mut reader = Reader::new(&frame).unwrap();
        let items = reader.get_list(|r| r.get_u32()).unwrap();
        assert_eq!(items, vec![7, 8, 9]);
    }

    #[test]
    fn absurd_list_count_rejected() {
        let mut writer = Writer::new();
        writer.put_u32(u32::MAX - 1);
        let frame = writer.finish();

        let mut reader = Reader::new(&frame).unwrap();
        assert_eq!(
            reader.get_list(|r| r.get_u32()),
            Err(CodecError::UnexpectedEof)
        );
    }
}
