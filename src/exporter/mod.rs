//! Streaming exporters: "where the bytes are" decoupled from "how to decode".
//!
//! A [`Resource`] either has no exporter (stored bytes are copied through
//! [`RawExporter`]) or carries an [`ExporterFactory`].  Every extraction asks
//! the factory for a fresh [`Exporter`], so two threads extracting the same
//! resource never share decoder state.
//!
//! The exporter contract is pull-based:
//!
//! ```text
//! open(source, range) → available()? → read() … → close()
//! ```
//!
//! `read()` yields one byte; [`Exporter::read_chunk`] is the bulk form the
//! engine actually uses.  [`export_to`] enforces that exactly
//! `decompressed_len` bytes come out.

mod block;

pub use block::{collect_blocks, BlockExporter, BlockExporterFactory, BlockScan, BlockSpan};

use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::warn;

use crate::codec::{get_codec, CodecError, CodecId};
use crate::cursor::{ArchiveSource, RangeReader};
use crate::error::{ArcError, Result};
use crate::resource::Resource;

const STREAM_BUF: usize = 8 * 1024;

// ── Traits ───────────────────────────────────────────────────────────────────

/// A stateful decoder bound to one byte range for one extraction.
pub trait Exporter: Send {
    fn name(&self) -> &'static str;

    /// Bind to `[offset, offset + stored_len)` of `source`, which must decode
    /// to `decompressed_len` bytes.  Reopening resets all state.
    fn open(
        &mut self,
        source: Arc<ArchiveSource>,
        offset: u64,
        stored_len: u64,
        decompressed_len: u64,
    ) -> Result<()>;

    /// More output can be produced.
    fn available(&mut self) -> Result<bool>;

    /// Next output byte.  Calling past the end is `OutOfBounds`.
    fn read(&mut self) -> Result<u8>;

    /// Fill as much of `buf` as possible; `Ok(0)` at end of stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() && self.available()? {
            buf[n] = self.read()?;
            n += 1;
        }
        Ok(n)
    }

    fn close(&mut self);
}

/// Produces fresh exporters; this is what a resource stores.
pub trait ExporterFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(&self) -> Box<dyn Exporter>;
}

// ── Output staging ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Staging {
    data: Vec<u8>,
    pos:  usize,
}

impl Staging {
    fn is_drained(&self) -> bool { self.pos >= self.data.len() }

    fn take(&mut self, buf: &mut [u8]) -> usize {
        let n = (self.data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    fn reset(&mut self, data: Vec<u8>) {
        self.data = data;
        self.pos  = 0;
    }
}

fn past_end(what: &'static str, at: u64) -> ArcError {
    ArcError::OutOfBounds { what, offset: at, len: 1, limit: at }
}

// ── RawExporter ──────────────────────────────────────────────────────────────

/// Copies stored bytes verbatim.
#[derive(Default)]
pub struct RawExporter {
    reader:  Option<RangeReader>,
    staging: Staging,
    emitted: u64,
}

impl RawExporter {
    pub fn new() -> Self { Self::default() }

    fn refill(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.as_mut() {
            let want = (reader.remaining() as usize).min(STREAM_BUF);
            let mut data = vec![0u8; want];
            reader.read_exact(&mut data)?;
            self.staging.reset(data);
        }
        Ok(())
    }
}

impl Exporter for RawExporter {
    fn name(&self) -> &'static str { "raw" }

    fn open(&mut self, source: Arc<ArchiveSource>, offset: u64, stored_len: u64, _: u64) -> Result<()> {
        self.reader  = Some(RangeReader::new(source, offset, stored_len)?);
        self.staging = Staging::default();
        self.emitted = 0;
        Ok(())
    }

    fn available(&mut self) -> Result<bool> {
        if !self.staging.is_drained() {
            return Ok(true);
        }
        Ok(self.reader.as_ref().is_some_and(|r| r.remaining() > 0))
    }

    fn read(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        match self.read_chunk(&mut b)? {
            1 => Ok(b[0]),
            _ => Err(past_end("raw export", self.emitted)),
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.staging.is_drained() {
            self.refill()?;
        }
        let n = self.staging.take(buf);
        self.emitted += n as u64;
        Ok(n)
    }

    fn close(&mut self) {
        self.reader  = None;
        self.staging = Staging::default();
    }
}

pub struct RawExporterFactory;

impl ExporterFactory for RawExporterFactory {
    fn name(&self) -> &'static str { "raw" }
    fn create(&self) -> Box<dyn Exporter> { Box::new(RawExporter::new()) }
}

// ── CodecExporter ────────────────────────────────────────────────────────────

enum CodecState {
    Closed,
    /// Incremental decoder pulling from the archive.
    Stream(Box<dyn Read + Send>),
    /// One-shot codec, already fully decoded into the staging buffer.
    Buffered,
}

/// Decodes a range through one of the built-in codecs.
pub struct CodecExporter {
    codec:    CodecId,
    state:    CodecState,
    staging:  Staging,
    expected: u64,
    emitted:  u64,
}

impl CodecExporter {
    pub fn new(codec: CodecId) -> Self {
        Self {
            codec,
            state:    CodecState::Closed,
            staging:  Staging::default(),
            expected: 0,
            emitted:  0,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let want = ((self.expected - self.emitted) as usize).min(STREAM_BUF);
        if let CodecState::Stream(reader) = &mut self.state {
            let mut data = vec![0u8; want];
            let mut got  = 0;
            while got < want {
                match reader.read(&mut data[got..]) {
                    Ok(0) => break,
                    Ok(n) => got += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(CodecError::Decompression(e.to_string()).into()),
                }
            }
            if got == 0 && want > 0 {
                return Err(CodecError::SizeMismatch {
                    expected: self.expected,
                    actual:   self.emitted,
                }
                .into());
            }
            data.truncate(got);
            self.staging.reset(data);
        }
        Ok(())
    }
}

impl Exporter for CodecExporter {
    fn name(&self) -> &'static str { self.codec.name() }

    fn open(
        &mut self,
        source: Arc<ArchiveSource>,
        offset: u64,
        stored_len: u64,
        decompressed_len: u64,
    ) -> Result<()> {
        self.expected = decompressed_len;
        self.emitted  = 0;
        self.staging  = Staging::default();

        let reader = RangeReader::new(Arc::clone(&source), offset, stored_len)?;
        self.state = match self.codec.stream_decoder(reader)? {
            Some(stream) => CodecState::Stream(stream),
            None => {
                let packed = source.read_vec(offset, stored_len)?;
                let mut out = get_codec(self.codec).decompress(&packed, decompressed_len as usize)?;
                if (out.len() as u64) < decompressed_len {
                    return Err(CodecError::SizeMismatch {
                        expected: decompressed_len,
                        actual:   out.len() as u64,
                    }
                    .into());
                }
                if out.len() as u64 > decompressed_len {
                    warn!(
                        codec = self.codec.name(),
                        offset,
                        declared = decompressed_len,
                        produced = out.len(),
                        "decoder produced more than declared; truncating"
                    );
                    out.truncate(decompressed_len as usize);
                }
                self.staging.reset(out);
                CodecState::Buffered
            }
        };
        Ok(())
    }

    fn available(&mut self) -> Result<bool> {
        Ok(!matches!(self.state, CodecState::Closed) && self.emitted < self.expected)
    }

    fn read(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        match self.read_chunk(&mut b)? {
            1 => Ok(b[0]),
            _ => Err(past_end("codec export", self.emitted)),
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.available()? {
            return Ok(0);
        }
        if self.staging.is_drained() {
            self.refill()?;
        }
        let room = ((self.expected - self.emitted) as usize).min(buf.len());
        let n = self.staging.take(&mut buf[..room]);
        self.emitted += n as u64;
        Ok(n)
    }

    fn close(&mut self) {
        self.state   = CodecState::Closed;
        self.staging = Staging::default();
    }
}

/// Factory for [`CodecExporter`]; one shared instance per codec is enough.
pub struct CodecExporterFactory {
    codec: CodecId,
}

impl CodecExporterFactory {
    pub fn shared(codec: CodecId) -> Arc<dyn ExporterFactory> {
        Arc::new(Self { codec })
    }
}

impl ExporterFactory for CodecExporterFactory {
    fn name(&self) -> &'static str { self.codec.name() }
    fn create(&self) -> Box<dyn Exporter> { Box::new(CodecExporter::new(self.codec)) }
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Open the right exporter for `resource`.
pub fn open_exporter(resource: &Resource) -> Result<Box<dyn Exporter>> {
    let mut exporter = match resource.exporter() {
        Some(factory) => factory.create(),
        None          => Box::new(RawExporter::new()) as Box<dyn Exporter>,
    };
    exporter.open(
        Arc::clone(resource.source()),
        resource.offset(),
        resource.stored_len(),
        resource.decompressed_len(),
    )?;
    Ok(exporter)
}

/// Stream `resource` into `out`.  Produces exactly `decompressed_len` bytes
/// or fails.
pub fn export_to<W: Write + ?Sized>(resource: &Resource, out: &mut W) -> Result<u64> {
    let mut exporter = open_exporter(resource)?;
    let mut buf      = vec![0u8; STREAM_BUF];
    let mut total    = 0u64;
    let result = loop {
        match exporter.read_chunk(&mut buf) {
            Ok(0)  => break Ok(()),
            Ok(n)  => {
                if let Err(e) = out.write_all(&buf[..n]) {
                    break Err(ArcError::from(e));
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };
    exporter.close();
    result?;
    if total != resource.decompressed_len() {
        return Err(CodecError::SizeMismatch {
            expected: resource.decompressed_len(),
            actual:   total,
        }
        .into());
    }
    Ok(total)
}

/// Extract into memory.
pub fn export_vec(resource: &Resource) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(resource.decompressed_len().min(64 << 20) as usize);
    export_to(resource, &mut out)?;
    Ok(out)
}

/// `io::Read` adapter over an open exporter.
pub struct ResourceReader {
    exporter: Box<dyn Exporter>,
}

impl ResourceReader {
    pub fn open(resource: &Resource) -> Result<Self> {
        Ok(Self { exporter: open_exporter(resource)? })
    }
}

impl Read for ResourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.exporter.read_chunk(buf).map_err(|e| match e {
            ArcError::Io(io) => io,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        })
    }
}

impl Drop for ResourceReader {
    fn drop(&mut self) {
        self.exporter.close();
    }
}
