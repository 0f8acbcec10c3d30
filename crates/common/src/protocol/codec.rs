// lib0-compatible binary primitives: unsigned varints plus
// length-prefixed byte arrays and strings. This is the low-level
// encoding the browser y-websocket clients speak, so the layout here
// is fixed by interop rather than by taste.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("varint exceeds 64 bits")]
    VarIntOverflow,
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Cursor over a received frame.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Little-endian base-128 varint, 7 payload bits per byte.
    pub fn read_var_u64(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEof(self.pos))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(CodecError::VarIntOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_var_buf(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_var_u64()? as usize;
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof(self.pos))?;
        if end > self.buf.len() {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_var_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_var_buf()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

/// Growable frame writer; the mirror image of [`Reader`].
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_var_u64(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub fn write_var_buf(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_var_string(&mut self, value: &str) {
        self.write_var_buf(value.as_bytes());
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips_across_width_boundaries() {
        let values = [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX];

        let mut writer = Writer::new();
        for value in values {
            writer.write_var_u64(value);
        }

        let encoded = writer.into_vec();
        let mut reader = Reader::new(&encoded);
        for value in values {
            assert_eq!(reader.read_var_u64().expect("varint should decode"), value);
        }
        assert!(reader.is_empty());
    }

    #[test]
    fn small_varints_use_a_single_byte() {
        let mut writer = Writer::new();
        writer.write_var_u64(127);
        assert_eq!(writer.into_vec(), vec![0x7f]);

        let mut writer = Writer::new();
        writer.write_var_u64(128);
        assert_eq!(writer.into_vec(), vec![0x80, 0x01]);
    }

    #[test]
    fn string_round_trips_including_non_ascii() {
        let mut writer = Writer::new();
        writer.write_var_string("héllo ✓");
        let encoded = writer.into_vec();

        let mut reader = Reader::new(&encoded);
        assert_eq!(reader.read_var_string().expect("string should decode"), "héllo ✓");
    }

    #[test]
    fn truncated_buffer_reports_eof() {
        let mut writer = Writer::new();
        writer.write_var_buf(b"abcdef");
        let mut encoded = writer.into_vec();
        encoded.truncate(4);

        let mut reader = Reader::new(&encoded);
        assert_eq!(reader.read_var_buf(), Err(CodecError::UnexpectedEof(1)));
    }

    #[test]
    fn empty_input_reports_eof_at_zero() {
        let mut reader = Reader::new(&[]);
        assert_eq!(reader.read_var_u64(), Err(CodecError::UnexpectedEof(0)));
    }

    #[test]
    fn unterminated_varint_overflows() {
        let encoded = [0xffu8; 11];
        let mut reader = Reader::new(&encoded);
        assert_eq!(reader.read_var_u64(), Err(CodecError::VarIntOverflow));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut writer = Writer::new();
        writer.write_var_buf(&[0xff, 0xfe]);
        let encoded = writer.into_vec();

        let mut reader = Reader::new(&encoded);
        assert_eq!(reader.read_var_string(), Err(CodecError::InvalidUtf8));
    }
}
