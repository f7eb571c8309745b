//! Bounds-checked binary cursor over an archive.
//!
//! # Source
//! [`ArchiveSource`] owns the bytes: either an open file or an in-memory
//! buffer.  It only offers *positioned* reads (`read_at`), so any number of
//! cursors and exporters can share one `Arc<ArchiveSource>` across threads
//! without racing on a seek pointer.
//!
//! # Cursor
//! [`ByteCursor`] tracks its own absolute position over a shared source and
//! decodes fixed-width integers in either byte order with `byteorder`.
//! Every read is checked against the source length first; a read that would
//! cross the end fails with [`ArcError::OutOfBounds`] and leaves the position
//! untouched.  Plugins lean on that error to reject foreign files.
//!
//! Small reads go through a read-ahead window (default 16 bytes) so that
//! directory loops decoding many tiny records don't issue one syscall per
//! field.

mod writer;

pub use writer::{padding_for, ByteWriter};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{check_span, ArcError, Result};

/// Default read-ahead window in bytes.
pub const DEFAULT_READ_AHEAD: usize = 16;

/// Byte order selector for the `*_with` readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

// ── ArchiveSource ────────────────────────────────────────────────────────────

enum Backing {
    File(File),
    Memory(Vec<u8>),
}

/// Immutable, shareable byte source with positioned reads.
pub struct ArchiveSource {
    path:    Option<PathBuf>,
    label:   String,
    len:     u64,
    backing: Backing,
}

impl std::fmt::Debug for ArchiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSource")
            .field("label", &self.label)
            .field("len", &self.len)
            .finish()
    }
}

impl ArchiveSource {
    /// Open a file read-only.  The length is captured once, at open time.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len  = file.metadata()?.len();
        Ok(Arc::new(Self {
            label: path.display().to_string(),
            path: Some(path),
            len,
            backing: Backing::File(file),
        }))
    }

    pub fn from_bytes(label: impl Into<String>, bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            path:    None,
            label:   label.into(),
            len:     bytes.len() as u64,
            backing: Backing::Memory(bytes),
        })
    }

    pub fn len(&self) -> u64 { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }
    pub fn label(&self) -> &str { &self.label }

    /// Lower-cased extension of the backing path, if any.
    pub fn extension(&self) -> Option<String> {
        self.path
            .as_ref()
            .and_then(|p| p.extension())
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    /// Fill `buf` from absolute `offset`.  Fails `OutOfBounds` before touching
    /// the file if the range leaves the source.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_span("read", offset, buf.len() as u64, self.len)?;
        match &self.backing {
            Backing::Memory(bytes) => {
                let start = offset as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                Ok(())
            }
            Backing::File(file) => read_exact_at(file, offset, buf).map_err(ArcError::from),
        }
    }

    /// Copy `len` bytes starting at `offset` into a fresh buffer.
    pub fn read_vec(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        check_span("read", offset, len, self.len)?;
        let mut buf = vec![0u8; len as usize];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ── RangeReader ──────────────────────────────────────────────────────────────

/// `io::Read` over `[start, start + len)` of a source, for streaming decoders.
pub struct RangeReader {
    source: Arc<ArchiveSource>,
    pos:    u64,
    end:    u64,
}

impl RangeReader {
    pub fn new(source: Arc<ArchiveSource>, start: u64, len: u64) -> Result<Self> {
        check_span("range", start, len, source.len())?;
        Ok(Self { source, pos: start, end: start + len })
    }

    pub fn remaining(&self) -> u64 { self.end - self.pos }
}

impl Read for RangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (self.remaining() as usize).min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.source
            .read_at(self.pos, &mut buf[..n])
            .map_err(|e| match e {
                ArcError::Io(io) => io,
                other => io::Error::new(io::ErrorKind::UnexpectedEof, other.to_string()),
            })?;
        self.pos += n as u64;
        Ok(n)
    }
}

// ── ByteCursor ───────────────────────────────────────────────────────────────

/// Seekable, endian-aware reader.  Cheap to [`fork`](Self::fork).
pub struct ByteCursor {
    source:      Arc<ArchiveSource>,
    pos:         u64,
    ahead:       Vec<u8>,
    ahead_start: u64,
    ahead_len:   usize,
}

macro_rules! int_readers {
    ($($ty:ty, $n:literal, $le:ident, $be:ident, $with:ident, $decode:ident;)*) => {
        $(
            pub fn $le(&mut self) -> Result<$ty> {
                let b = self.read_array::<$n>()?;
                Ok(LittleEndian::$decode(&b))
            }

            pub fn $be(&mut self) -> Result<$ty> {
                let b = self.read_array::<$n>()?;
                Ok(BigEndian::$decode(&b))
            }

            pub fn $with(&mut self, endian: Endian) -> Result<$ty> {
                match endian {
                    Endian::Little => self.$le(),
                    Endian::Big    => self.$be(),
                }
            }
        )*
    };
}

impl ByteCursor {
    pub fn new(source: Arc<ArchiveSource>) -> Self {
        Self::with_read_ahead(source, DEFAULT_READ_AHEAD)
    }

    /// `read_ahead == 0` disables buffering entirely.
    pub fn with_read_ahead(source: Arc<ArchiveSource>, read_ahead: usize) -> Self {
        Self {
            source,
            pos:         0,
            ahead:       vec![0u8; read_ahead],
            ahead_start: 0,
            ahead_len:   0,
        }
    }

    /// Independent cursor over the same source, positioned at 0.
    pub fn fork(&self) -> Self {
        Self::with_read_ahead(Arc::clone(&self.source), self.ahead.len())
    }

    pub fn source(&self) -> &Arc<ArchiveSource> { &self.source }
    pub fn len(&self) -> u64 { self.source.len() }
    pub fn is_empty(&self) -> bool { self.source.is_empty() }
    pub fn position(&self) -> u64 { self.pos }
    pub fn remaining(&self) -> u64 { self.source.len().saturating_sub(self.pos) }

    // ── Positioning ──────────────────────────────────────────────────────────

    /// Absolute seek.  Seeking to exactly the end is allowed.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        check_span("seek", offset, 0, self.len())?;
        self.pos = offset;
        Ok(())
    }

    /// Seek to `anchor + delta`, where `anchor` is an offset the caller keeps
    /// (typically the start of the directory the offsets are relative to).
    pub fn seek_relative(&mut self, anchor: u64, delta: i64) -> Result<()> {
        let target = anchor.checked_add_signed(delta).ok_or(ArcError::OutOfBounds {
            what:   "relative seek",
            offset: anchor,
            len:    delta.unsigned_abs(),
            limit:  self.len(),
        })?;
        self.seek(target)
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        check_span("skip", self.pos, n, self.len())?;
        self.pos += n;
        Ok(())
    }

    // ── Raw bytes ────────────────────────────────────────────────────────────

    /// Fill `buf` from the current position and advance.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        check_span("read", self.pos, buf.len() as u64, self.len())?;
        if buf.len() <= self.ahead.len() {
            self.read_buffered(buf)?;
        } else {
            self.source.read_at(self.pos, buf)?;
        }
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn read_buffered(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = buf.len();
        let hit = self.pos >= self.ahead_start
            && self.pos + n as u64 <= self.ahead_start + self.ahead_len as u64;
        if !hit {
            let fill = (self.remaining() as usize).min(self.ahead.len());
            self.source.read_at(self.pos, &mut self.ahead[..fill])?;
            self.ahead_start = self.pos;
            self.ahead_len   = fill;
        }
        let at = (self.pos - self.ahead_start) as usize;
        buf.copy_from_slice(&self.ahead[at..at + n]);
        Ok(())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut b = [0u8; N];
        self.read_into(&mut b)?;
        Ok(b)
    }

    pub fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        check_span("read", self.pos, len, self.len())?;
        let mut buf = vec![0u8; len as usize];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Read without moving.  Shorter than `len` near the end of the source.
    pub fn peek_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        let len = len.min(self.remaining());
        let at  = self.pos;
        let out = self.read_bytes(len)?;
        self.pos = at;
        Ok(out)
    }

    // ── Integers ─────────────────────────────────────────────────────────────

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    int_readers! {
        u16, 2, u16_le, u16_be, u16_with, read_u16;
        i16, 2, i16_le, i16_be, i16_with, read_i16;
        u32, 4, u32_le, u32_be, u32_with, read_u32;
        i32, 4, i32_le, i32_be, i32_with, read_i32;
        u64, 8, u64_le, u64_be, u64_with, read_u64;
        i64, 8, i64_le, i64_be, i64_with, read_i64;
    }

    // ── Strings ──────────────────────────────────────────────────────────────

    /// Fixed-width field; stops at the first NUL, decodes lossily.
    pub fn fixed_string(&mut self, len: u64) -> Result<String> {
        let raw = self.read_bytes(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// NUL-terminated string of at most `max_len` bytes (terminator excluded).
    ///
    /// Running into the end of the source is `OutOfBounds`; running past
    /// `max_len` without a terminator is a `FormatMismatch`.  On error the
    /// position is restored.
    pub fn cstring(&mut self, max_len: u64) -> Result<String> {
        let start = self.pos;
        let mut raw = Vec::new();
        loop {
            let b = match self.u8() {
                Ok(b) => b,
                Err(e) => {
                    self.pos = start;
                    return Err(e);
                }
            };
            if b == 0 {
                return Ok(String::from_utf8_lossy(&raw).into_owned());
            }
            if raw.len() as u64 >= max_len {
                self.pos = start;
                return Err(ArcError::mismatch(format!(
                    "unterminated string at offset {start} (limit {max_len})"
                )));
            }
            raw.push(b);
        }
    }

    /// `u8` length prefix followed by that many bytes.
    pub fn pascal_string(&mut self) -> Result<String> {
        let len = self.u8()? as u64;
        self.fixed_string(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(bytes: &[u8]) -> ByteCursor {
        ByteCursor::new(ArchiveSource::from_bytes("mem", bytes.to_vec()))
    }

    #[test]
    fn reads_both_endians() {
        let mut c = cursor(&[0x01, 0x02, 0x03, 0x04, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(c.u32_le().unwrap(), 0x0403_0201);
        assert_eq!(c.u32_be().unwrap(), 0x0102_0304);
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn read_past_end_is_out_of_bounds_and_keeps_position() {
        let mut c = cursor(&[1, 2, 3]);
        c.skip(1).unwrap();
        let err = c.u32_le().unwrap_err();
        assert!(matches!(err, ArcError::OutOfBounds { .. }));
        assert_eq!(c.position(), 1);
        assert_eq!(c.u16_le().unwrap(), 0x0302);
    }

    #[test]
    fn seek_bounds() {
        let mut c = cursor(&[0; 8]);
        assert!(c.seek(8).is_ok());
        assert!(c.seek(9).is_err());
        assert!(c.seek_relative(4, -4).is_ok());
        assert!(c.seek_relative(4, -5).is_err());
        assert!(c.seek_relative(4, 5).is_err());
    }

    #[test]
    fn cstring_bounded() {
        let mut c = cursor(b"abc\0defgh");
        assert_eq!(c.cstring(16).unwrap(), "abc");
        assert!(matches!(c.cstring(2), Err(ArcError::FormatMismatch(_))));
        assert!(matches!(c.cstring(64), Err(ArcError::OutOfBounds { .. })));
        assert_eq!(c.position(), 4);
    }

    #[test]
    fn fixed_string_trims_nul_padding() {
        let mut c = cursor(b"name\0\0\0\0tail");
        assert_eq!(c.fixed_string(8).unwrap(), "name");
        assert_eq!(c.fixed_string(4).unwrap(), "tail");
    }

    #[test]
    fn read_ahead_serves_sequential_small_reads() {
        let bytes: Vec<u8> = (0u8..64).collect();
        let mut buffered   = ByteCursor::with_read_ahead(ArchiveSource::from_bytes("a", bytes.clone()), 8);
        let mut unbuffered = ByteCursor::with_read_ahead(ArchiveSource::from_bytes("b", bytes), 0);
        for _ in 0..21 {
            assert_eq!(buffered.u16_be().unwrap(), unbuffered.u16_be().unwrap());
            assert_eq!(buffered.u8().unwrap(), unbuffered.u8().unwrap());
        }
        assert!(buffered.u32_le().is_err());
    }

    #[test]
    fn peek_does_not_move() {
        let mut c = cursor(b"PAK\0rest");
        assert_eq!(c.peek_bytes(4).unwrap(), b"PAK\0");
        assert_eq!(c.position(), 0);
        assert_eq!(c.peek_bytes(100).unwrap().len(), 8);
    }

    #[test]
    fn range_reader_stays_inside_range() {
        let src = ArchiveSource::from_bytes("mem", b"0123456789".to_vec());
        let mut r = RangeReader::new(src.clone(), 2, 5).unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "23456");
        assert!(RangeReader::new(src, 8, 3).is_err());
    }

    #[test]
    fn file_backed_source_reads_positionally() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"header--payload").unwrap();
        let src = ArchiveSource::open(tmp.path()).unwrap();
        assert_eq!(src.len(), 15);
        assert_eq!(src.read_vec(8, 7).unwrap(), b"payload");
        assert!(src.read_vec(8, 8).is_err());
    }
}
