//! Fixed-width field reader/writer for handshake and command frames.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: wanted {wanted} bytes at offset {offset}, {available} left")]
    Truncated {
        offset: usize,
        wanted: usize,
        available: usize,
    },

    #[error("invalid utf-16 string")]
    InvalidString,
}

/// Cursor over a byte buffer. Every read names its width explicitly.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < len {
            return Err(FrameError::Truncated {
                offset: self.pos,
                wanted: len,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u32_le(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    pub fn u64_le(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_le_bytes(self.array::<8>()?))
    }

    /// `u32 len ‖ bytes`
    pub fn sized(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.u32_le()? as usize;
        self.bytes(len)
    }

    /// `u32 len ‖ UTF-16LE ‖ 0x0000`
    pub fn pascal(&mut self) -> Result<String, FrameError> {
        let raw = self.sized()?;
        decode_utf16le(raw)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

#[derive(Default)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32_le(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64_le(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i64_le(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn sized(&mut self, data: &[u8]) -> &mut Self {
        self.u32_le(data.len() as u32);
        self.bytes(data)
    }

    pub fn pascal(&mut self, text: &str) -> &mut Self {
        let encoded = encode_utf16le(text);
        self.sized(&encoded)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

pub fn encode_utf16le(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    out.extend_from_slice(&[0, 0]);
    out
}

pub fn decode_utf16le(raw: &[u8]) -> Result<String, FrameError> {
    if raw.len() % 2 != 0 {
        return Err(FrameError::InvalidString);
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units).map_err(|_| FrameError::InvalidString)
}

/// Text up to the first NUL of a fixed-width field.
pub fn trim_nul(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
