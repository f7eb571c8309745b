//! Composite exporter over independently compressed chunks.
//!
//! Chunked layouts store a resource as a run of blocks, each with its own
//! small header and its own codec.  [`collect_blocks`] walks such a chain and
//! records where every block's payload lives; [`BlockExporter`] then replays
//! the chain as one continuous stream, opening an inner exporter per block.

use std::sync::Arc;
use tracing::{debug, warn};

use super::{past_end, Exporter, ExporterFactory, RawExporter};
use crate::codec::CodecError;
use crate::cursor::{ArchiveSource, ByteCursor};
use crate::error::{ArcError, Result};

/// Where one block's payload lives and what it decodes to.
#[derive(Clone)]
pub struct BlockSpan {
    pub offset:           u64,
    pub stored_len:       u64,
    pub decompressed_len: u64,
    /// `None` means the payload is stored verbatim.
    pub inner:            Option<Arc<dyn ExporterFactory>>,
}

impl std::fmt::Debug for BlockSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSpan")
            .field("offset", &self.offset)
            .field("stored_len", &self.stored_len)
            .field("decompressed_len", &self.decompressed_len)
            .field("inner", &self.inner.as_ref().map(|e| e.name()))
            .finish()
    }
}

// ── Chain walking ────────────────────────────────────────────────────────────

/// Blocks recovered from one resource's chain.
#[derive(Debug, Default)]
pub struct BlockScan {
    pub blocks:    Vec<BlockSpan>,
    pub anomalies: usize,
}

impl BlockScan {
    pub fn decompressed_total(&self) -> u64 {
        self.blocks.iter().map(|b| b.decompressed_len).sum()
    }

    pub fn into_factory(self) -> Arc<dyn ExporterFactory> {
        Arc::new(BlockExporterFactory::new(self.blocks))
    }
}

/// Walk a block chain starting at `start` until `stored_len` compressed bytes
/// are consumed.
///
/// `read_header` is called with the cursor at a block header; it must leave
/// the cursor at the first payload byte and return the span with `offset`
/// set to that position.  The walker skips the payload and repeats.
///
/// A header that fails to parse, or a payload that would run past the
/// resource, ends the walk with an anomaly and keeps the blocks found so
/// far.  So does a `declared` count that disagrees with what was found.
/// Only I/O failures are returned as errors.
pub fn collect_blocks<F>(
    cursor: &mut ByteCursor,
    start: u64,
    stored_len: u64,
    declared: Option<usize>,
    max_blocks: usize,
    mut read_header: F,
) -> Result<BlockScan>
where
    F: FnMut(&mut ByteCursor) -> Result<BlockSpan>,
{
    let mut scan = BlockScan::default();
    let end = start.saturating_add(stored_len);
    cursor.seek(start)?;

    while cursor.position() < end {
        if scan.blocks.len() >= max_blocks {
            warn!(start, max_blocks, "block chain exceeds the block limit; stopping");
            scan.anomalies += 1;
            break;
        }
        let header_at = cursor.position();
        let span = match read_header(cursor) {
            Ok(span) => span,
            Err(ArcError::Io(e)) => return Err(ArcError::Io(e)),
            Err(e) => {
                warn!(start, header_at, error = %e, "unreadable block header; keeping earlier blocks");
                scan.anomalies += 1;
                break;
            }
        };
        let payload_end = span.offset.checked_add(span.stored_len);
        let overrun = payload_end.map_or(true, |e| e > end || e > cursor.len());
        if span.offset < header_at || overrun {
            warn!(
                start,
                block = scan.blocks.len(),
                offset = span.offset,
                len = span.stored_len,
                "block payload leaves the resource; keeping earlier blocks"
            );
            scan.anomalies += 1;
            break;
        }
        let payload_end = span.offset + span.stored_len;
        if payload_end == header_at {
            warn!(start, header_at, "zero-length block chain step; stopping");
            scan.anomalies += 1;
            break;
        }
        cursor.seek(payload_end)?;
        scan.blocks.push(span);
    }

    if let Some(declared) = declared {
        if declared != scan.blocks.len() {
            warn!(
                start,
                declared,
                found = scan.blocks.len(),
                "declared block count disagrees with the chain; using the blocks found"
            );
            scan.anomalies += 1;
        }
    }
    debug!(start, blocks = scan.blocks.len(), "block chain collected");
    Ok(scan)
}

// ── BlockExporter ────────────────────────────────────────────────────────────

pub struct BlockExporterFactory {
    blocks: Arc<[BlockSpan]>,
}

impl BlockExporterFactory {
    pub fn new(blocks: Vec<BlockSpan>) -> Self {
        Self { blocks: blocks.into() }
    }

    pub fn blocks(&self) -> &[BlockSpan] { &self.blocks }
}

impl ExporterFactory for BlockExporterFactory {
    fn name(&self) -> &'static str { "blocks" }

    fn create(&self) -> Box<dyn Exporter> {
        Box::new(BlockExporter::new(Arc::clone(&self.blocks)))
    }
}

/// Concatenates the decoded output of every block, in order.
pub struct BlockExporter {
    blocks:  Arc<[BlockSpan]>,
    source:  Option<Arc<ArchiveSource>>,
    next:    usize,
    current: Option<Box<dyn Exporter>>,
    emitted: u64,
}

impl BlockExporter {
    pub fn new(blocks: Arc<[BlockSpan]>) -> Self {
        Self { blocks, source: None, next: 0, current: None, emitted: 0 }
    }

    /// Make sure `current` is an exporter with output left, opening the next
    /// non-empty block when needed.  Returns false once every block is spent.
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(cur) = self.current.as_mut() {
                if cur.available()? {
                    return Ok(true);
                }
                cur.close();
                self.current = None;
            }
            let Some(block) = self.blocks.get(self.next) else {
                return Ok(false);
            };
            self.next += 1;
            if block.decompressed_len == 0 {
                continue;
            }
            let source = self
                .source
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| ArcError::mismatch("block exporter read before open"))?;
            let mut inner: Box<dyn Exporter> = match &block.inner {
                Some(factory) => factory.create(),
                None if block.stored_len == block.decompressed_len => Box::new(RawExporter::new()),
                None => {
                    return Err(CodecError::SizeMismatch {
                        expected: block.decompressed_len,
                        actual:   block.stored_len,
                    }
                    .into());
                }
            };
            inner.open(source, block.offset, block.stored_len, block.decompressed_len)?;
            self.current = Some(inner);
        }
    }
}

impl Exporter for BlockExporter {
    fn name(&self) -> &'static str { "blocks" }

    fn open(&mut self, source: Arc<ArchiveSource>, _: u64, _: u64, decompressed_len: u64) -> Result<()> {
        let total: u64 = self.blocks.iter().map(|b| b.decompressed_len).sum();
        if total != decompressed_len {
            return Err(CodecError::SizeMismatch { expected: decompressed_len, actual: total }.into());
        }
        self.close();
        self.source  = Some(source);
        self.next    = 0;
        self.emitted = 0;
        Ok(())
    }

    fn available(&mut self) -> Result<bool> {
        if self.source.is_none() {
            return Ok(false);
        }
        self.advance()
    }

    fn read(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        match self.read_chunk(&mut b)? {
            1 => Ok(b[0]),
            _ => Err(past_end("block export", self.emitted)),
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && self.available()? {
            if let Some(cur) = self.current.as_mut() {
                let n = cur.read_chunk(&mut buf[filled..])?;
                if n == 0 {
                    // Inner claimed output but produced none: the block is short.
                    return Err(CodecError::Decompression(format!(
                        "block {} ended early",
                        self.next.saturating_sub(1)
                    ))
                    .into());
                }
                filled += n;
            }
        }
        self.emitted += filled as u64;
        Ok(filled)
    }

    fn close(&mut self) {
        if let Some(mut cur) = self.current.take() {
            cur.close();
        }
        self.source = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{get_codec, CodecId};
    use crate::exporter::{export_vec, CodecExporterFactory};
    use crate::resource::ResourceBuilder;

    /// Chain layout: u32 stored, u32 raw, u8 method (0 raw, 1 zlib), payload.
    fn build_chain(chunks: &[(&[u8], bool)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (data, compress) in chunks {
            let payload = if *compress {
                get_codec(CodecId::Zlib).compress(data, 6).unwrap()
            } else {
                data.to_vec()
            };
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.push(*compress as u8);
            out.extend_from_slice(&payload);
        }
        out
    }

    fn read_header(c: &mut ByteCursor) -> Result<BlockSpan> {
        let stored = c.u32_le()? as u64;
        let raw    = c.u32_le()? as u64;
        let inner = match c.u8()? {
            0 => None,
            1 => Some(CodecExporterFactory::shared(CodecId::Zlib)),
            m => return Err(ArcError::mismatch(format!("method {m}"))),
        };
        Ok(BlockSpan { offset: c.position(), stored_len: stored, decompressed_len: raw, inner })
    }

    fn chunks() -> Vec<Vec<u8>> {
        vec![
            b"alpha-".repeat(300),
            Vec::new(),
            b"raw middle block".to_vec(),
            (0..5000u32).map(|i| (i * 7 % 256) as u8).collect(),
        ]
    }

    #[test]
    fn stitched_stream_equals_concatenation() {
        let chunks = chunks();
        let layout: Vec<(&[u8], bool)> = vec![
            (chunks[0].as_slice(), true),
            (chunks[1].as_slice(), false),
            (chunks[2].as_slice(), false),
            (chunks[3].as_slice(), true),
        ];
        let chain = build_chain(&layout);
        let src = ArchiveSource::from_bytes("mem", chain.clone());
        let mut cursor = ByteCursor::new(src.clone());
        let scan = collect_blocks(&mut cursor, 0, chain.len() as u64, Some(4), 1000, read_header).unwrap();
        assert_eq!(scan.blocks.len(), 4);
        assert_eq!(scan.anomalies, 0);

        let expected: Vec<u8> = chunks.concat();
        assert_eq!(scan.decompressed_total(), expected.len() as u64);

        let r = ResourceBuilder::new("stitched")
            .offset(0)
            .stored_len(chain.len() as u64)
            .decompressed_len(scan.decompressed_total())
            .exporter(scan.into_factory())
            .finalize(&src)
            .unwrap();
        assert_eq!(export_vec(&r).unwrap(), expected);
    }

    #[test]
    fn count_mismatch_is_an_anomaly_not_an_error() {
        let data = b"one block only".to_vec();
        let chain = build_chain(&[(data.as_slice(), false)]);
        let src = ArchiveSource::from_bytes("mem", chain.clone());
        let mut cursor = ByteCursor::new(src);
        let scan = collect_blocks(&mut cursor, 0, chain.len() as u64, Some(3), 1000, read_header).unwrap();
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(scan.anomalies, 1);
    }

    #[test]
    fn truncated_chain_keeps_leading_blocks() {
        let a = b"first".to_vec();
        let b = b"second block is cut".to_vec();
        let mut chain = build_chain(&[(a.as_slice(), false), (b.as_slice(), false)]);
        let declared = chain.len() as u64;
        chain.truncate(chain.len() - 4);
        let src = ArchiveSource::from_bytes("mem", chain);
        let mut cursor = ByteCursor::new(src);
        let scan = collect_blocks(&mut cursor, 0, declared, None, 1000, read_header).unwrap();
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(scan.anomalies, 1);
    }

    #[test]
    fn declared_total_must_match_blocks() {
        let data = b"abc".to_vec();
        let chain = build_chain(&[(data.as_slice(), false)]);
        let src = ArchiveSource::from_bytes("mem", chain.clone());
        let mut cursor = ByteCursor::new(src.clone());
        let scan = collect_blocks(&mut cursor, 0, chain.len() as u64, None, 10, read_header).unwrap();
        let r = ResourceBuilder::new("x")
            .offset(0)
            .stored_len(chain.len() as u64)
            .decompressed_len(4)
            .exporter(scan.into_factory())
            .finalize(&src)
            .unwrap();
        assert!(export_vec(&r).is_err());
    }
}
