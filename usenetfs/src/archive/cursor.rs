use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use super::ArchiveError;

/// Reads up to `len` bytes at `offset`. Short at end of input.
pub(crate) async fn read_range<R>(reader: &mut R, offset: u64, len: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    reader.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len);
    (&mut *reader).take(len as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Bounds-checked little-endian cursor over header bytes.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], ArchiveError> {
        if self.remaining() < len {
            return Err(ArchiveError::malformed(format!(
                "header truncated at byte {} (wanted {len} more)",
                self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ArchiveError> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, ArchiveError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ArchiveError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ArchiveError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, ArchiveError> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// RAR5 variable-length integer: 7 bits per byte, low bits first.
    pub fn vint(&mut self) -> Result<u64, ArchiveError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let b = self.u8()?;
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ArchiveError::malformed("variable-length integer overflow"))
    }

    /// 7z number: the count of leading one bits in the first byte gives the
    /// number of extra bytes.
    pub fn number(&mut self) -> Result<u64, ArchiveError> {
        let first = self.u8()?;
        let mut mask = 0x80u8;
        let mut value = 0u64;
        for i in 0..8 {
            if first & mask == 0 {
                let high = u64::from(first & mask.wrapping_sub(1));
                return Ok(value | (high << (8 * i)));
            }
            value |= u64::from(self.u8()?) << (8 * i);
            mask >>= 1;
        }
        Ok(value)
    }

    pub fn usize_number(&mut self) -> Result<usize, ArchiveError> {
        let n = self.number()?;
        if n > self.data.len() as u64 * 8 + 64 {
            return Err(ArchiveError::malformed(format!("implausible count {n}")));
        }
        Ok(n as usize)
    }

    /// MSB-first bit vector of `count` entries.
    pub fn bits(&mut self, count: usize) -> Result<Vec<bool>, ArchiveError> {
        let mut out = Vec::with_capacity(count);
        let mut byte = 0u8;
        let mut mask = 0u8;
        for _ in 0..count {
            if mask == 0 {
                byte = self.u8()?;
                mask = 0x80;
            }
            out.push(byte & mask != 0);
            mask >>= 1;
        }
        Ok(out)
    }
}
