// Little-endian binary cursor types for the relay wire format.
//
// Frames carry no length prefix or type tag beyond the leading opcode byte, so
// everything here works on one complete frame at a time (the transport already
// delivers whole WebSocket messages). `Reader` walks a borrowed `&[u8]` and
// fails with `DecodeError` instead of reading past the end; callers that need
// to detect length-implied optional fields use `has_remaining()` before
// reading them.
//
// Strings come in two flavours, both NUL-terminated:
// - 8-bit: one byte per character, mapped 1:1 onto U+0000..=U+00FF (Latin-1).
// - wide: one u16 little-endian code unit per character, decoded as UTF-16
//   (lossy, unpaired surrogates become U+FFFD).
//
// `Writer` is always created with the exact byte length of the frame it will
// produce (see the `encoded_len` helpers in `message.rs`), so encoding never
// reallocates.

use thiserror::Error;

/// Errors produced while decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame had no bytes at all, not even an opcode.
    #[error("empty frame")]
    Empty,

    /// The leading opcode byte is not part of the protocol.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    /// A field extends past the end of the frame.
    #[error("unexpected end of frame: needed {needed} bytes at offset {offset}, frame is {len} bytes")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        len: usize,
    },
}

/// Cursor over a single received frame.
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Current read position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left between the cursor and the end of the frame.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.offset + N;
        let bytes = self
            .buf
            .get(self.offset..end)
            .ok_or(DecodeError::UnexpectedEof {
                offset: self.offset,
                needed: N,
                len: self.buf.len(),
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.offset = end;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.take().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.take().map(u32::from_le_bytes)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        self.take().map(i16::from_le_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.take().map(f64::from_le_bytes)
    }

    /// Read an 8-bit NUL-terminated string. The terminator is consumed but
    /// not included. A missing terminator is `UnexpectedEof`.
    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let mut out = String::new();
        loop {
            match self.read_u8()? {
                0 => return Ok(out),
                byte => out.push(char::from(byte)),
            }
        }
    }

    /// Read a NUL-terminated string of u16 code units.
    pub fn read_wide_str(&mut self) -> Result<String, DecodeError> {
        let mut units = Vec::new();
        loop {
            match self.read_u16()? {
                0 => break,
                unit => units.push(unit),
            }
        }
        Ok(String::from_utf16_lossy(&units))
    }
}

/// Fixed-capacity frame builder.
pub struct Writer {
    buf: Vec<u8>,
    len: usize,
}

impl Writer {
    /// Allocate a writer for a frame of exactly `len` bytes.
    pub fn with_len(len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(len),
            len,
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write an 8-bit NUL-terminated string. Characters outside Latin-1 are
    /// written as `?`.
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        for c in value.chars() {
            self.buf.push(u8::try_from(u32::from(c)).unwrap_or(b'?'));
        }
        self.buf.push(0);
        self
    }

    /// Write a NUL-terminated string as u16 code units.
    pub fn write_wide_str(&mut self, value: &str) -> &mut Self {
        for unit in value.encode_utf16() {
            self.write_u16(unit);
        }
        self.write_u16(0)
    }

    pub fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.buf.len(), self.len, "frame length was mis-computed");
        self.buf
    }
}

/// Encoded size of an 8-bit string including its terminator.
pub fn str_len(value: &str) -> usize {
    value.chars().count() + 1
}

/// Encoded size of a wide string including its terminator.
pub fn wide_str_len(value: &str) -> usize {
    (value.encode_utf16().count() + 1) * 2
}
