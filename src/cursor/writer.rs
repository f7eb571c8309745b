use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::io::{self, Seek, SeekFrom, Write};

use crate::error::{ArcError, Result};

/// Zero bytes needed to move `pos` onto the next multiple of `align`.
///
/// Already-aligned positions need `0`, never `align`.  `align` of 0 or 1
/// never pads.
pub fn padding_for(pos: u64, align: u64) -> u64 {
    if align <= 1 {
        return 0;
    }
    match pos % align {
        0   => 0,
        rem => align - rem,
    }
}

/// Positioned writer used by plugins to rebuild containers.
pub struct ByteWriter<W: Write + Seek> {
    inner: W,
}

impl<W: Write + Seek> ByteWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W { self.inner }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Write `bytes` at `pos`, then return to where the writer was.
    /// Used to back-patch offsets in headers written before their targets.
    pub fn overwrite_at(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        let here = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(pos))?;
        self.inner.write_all(bytes)?;
        self.inner.seek(SeekFrom::Start(here))?;
        Ok(())
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn u8(&mut self, v: u8) -> Result<()> { Ok(self.inner.write_u8(v)?) }
    pub fn u16_le(&mut self, v: u16) -> Result<()> { Ok(self.inner.write_u16::<LittleEndian>(v)?) }
    pub fn u16_be(&mut self, v: u16) -> Result<()> { Ok(self.inner.write_u16::<BigEndian>(v)?) }
    pub fn u32_le(&mut self, v: u32) -> Result<()> { Ok(self.inner.write_u32::<LittleEndian>(v)?) }
    pub fn u32_be(&mut self, v: u32) -> Result<()> { Ok(self.inner.write_u32::<BigEndian>(v)?) }
    pub fn u64_le(&mut self, v: u64) -> Result<()> { Ok(self.inner.write_u64::<LittleEndian>(v)?) }
    pub fn u64_be(&mut self, v: u64) -> Result<()> { Ok(self.inner.write_u64::<BigEndian>(v)?) }

    /// `value` NUL-padded to exactly `width` bytes.  Names that don't fit
    /// (terminator included) are rejected rather than silently cut.
    pub fn fixed_string(&mut self, value: &str, width: usize) -> Result<()> {
        let raw = value.as_bytes();
        if raw.len() >= width {
            return Err(ArcError::mismatch(format!(
                "name '{value}' does not fit a {width}-byte field"
            )));
        }
        self.inner.write_all(raw)?;
        write_zeros(&mut self.inner, (width - raw.len()) as u64)?;
        Ok(())
    }

    /// `u8` length prefix and the bytes.
    pub fn pascal_string(&mut self, value: &str) -> Result<()> {
        let len = u8::try_from(value.len()).map_err(|_| {
            ArcError::mismatch(format!("name '{value}' longer than 255 bytes"))
        })?;
        self.u8(len)?;
        self.bytes(value.as_bytes())
    }

    /// Zero-fill up to the next multiple of `align`; returns bytes written.
    pub fn pad_to(&mut self, align: u64) -> Result<u64> {
        let pos = self.inner.stream_position()?;
        let pad = padding_for(pos, align);
        write_zeros(&mut self.inner, pad)?;
        Ok(pad)
    }

    pub fn copy_from<R: io::Read>(&mut self, reader: &mut R) -> Result<u64> {
        Ok(io::copy(reader, &mut self.inner)?)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.inner.flush()?)
    }
}

fn write_zeros<W: Write>(w: &mut W, mut n: u64) -> io::Result<()> {
    const ZEROS: [u8; 512] = [0u8; 512];
    while n > 0 {
        let step = n.min(ZEROS.len() as u64) as usize;
        w.write_all(&ZEROS[..step])?;
        n -= step as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn padding_is_never_a_full_alignment() {
        assert_eq!(padding_for(0, 16), 0);
        assert_eq!(padding_for(16, 16), 0);
        assert_eq!(padding_for(17, 16), 15);
        assert_eq!(padding_for(2047, 2048), 1);
        assert_eq!(padding_for(5, 0), 0);
        assert_eq!(padding_for(5, 1), 0);
    }

    proptest! {
        #[test]
        fn padding_lands_on_boundary(pos in 0u64..1_000_000, shift in 2u32..13) {
            let align = 1u64 << shift;
            let pad = padding_for(pos, align);
            prop_assert!(pad < align);
            prop_assert_eq!((pos + pad) % align, 0);
        }
    }

    #[test]
    fn overwrite_returns_to_position() {
        let mut w = ByteWriter::new(Cursor::new(Vec::new()));
        w.u32_le(0).unwrap();
        w.bytes(b"body").unwrap();
        w.overwrite_at(0, &7u32.to_le_bytes()).unwrap();
        assert_eq!(w.position().unwrap(), 8);
        w.pad_to(16).unwrap();
        let out = w.into_inner().into_inner();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &[7, 0, 0, 0]);
        assert!(out[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn fixed_string_rejects_overlong_names() {
        let mut w = ByteWriter::new(Cursor::new(Vec::new()));
        w.fixed_string("abc", 8).unwrap();
        assert!(w.fixed_string("12345678", 8).is_err());
        assert_eq!(w.into_inner().into_inner(), b"abc\0\0\0\0\0");
    }
}
