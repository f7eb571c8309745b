//! `zblk`: resources stored as chains of independently compressed blocks.
//!
//! ```text
//! header      "ZBLK", u32 version (1), u32 entry count, u32 directory offset
//! directory   count × 56 bytes:
//!               [32] name (NUL padded), u32 offset, u32 stored length,
//!               u32 decompressed length, u32 block count, u32 crc32, u32 tag
//! block       u32 compressed length, u32 decompressed length,
//!             u16 flags (0 stored, 1 zlib, 2 lz4), u16 reserved, payload
//! ```
//!
//! A block decodes to at most 64 KiB.  `tag` is opaque; `replace` carries it
//! over from the previous archive.

use std::collections::HashMap;
use std::io::{Seek, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::codec::{get_codec, CodecId};
use crate::cursor::{ArchiveSource, ByteCursor, ByteWriter};
use crate::error::{check_span, ArcError, Result};
use crate::exporter::{collect_blocks, BlockSpan, CodecExporterFactory};
use crate::plugin::{
    Capabilities, EntrySource, FormatPlugin, PluginInfo, ProbeContext, Rating, RebuildEntry,
    WriteSeek,
};
use crate::resource::{EntryCollector, ReadOutcome, ResourceBuilder};

const MAGIC: &[u8; 4] = b"ZBLK";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const NAME_LEN: usize = 32;
const ENTRY_LEN: u64 = NAME_LEN as u64 + 24;
const MAX_BLOCK: usize = 64 * 1024;

const FLAG_STORED: u16 = 0;
const FLAG_ZLIB: u16 = 1;
const FLAG_LZ4: u16 = 2;

pub struct ZblkFormat;

static INFO: PluginInfo = PluginInfo {
    code:         "zblk",
    name:         "Block-compressed archive",
    extensions:   &["zblk", "zbk"],
    platforms:    &["pc", "x360"],
    capabilities: Capabilities {
        can_read:                true,
        can_write:               true,
        can_replace:             true,
        can_rename:              false,
        can_scan_for_file_types: false,
    },
};

#[derive(Clone)]
struct DirEntry {
    name:     String,
    offset:   u64,
    stored:   u64,
    unpacked: u64,
    blocks:   u32,
    crc:      u32,
    tag:      u32,
}

fn read_block_header(cursor: &mut ByteCursor) -> Result<BlockSpan> {
    let stored   = cursor.u32_le()? as u64;
    let unpacked = cursor.u32_le()? as u64;
    let flags    = cursor.u16_le()?;
    let _        = cursor.u16_le()?;
    if unpacked as usize > MAX_BLOCK {
        return Err(ArcError::mismatch(format!("block decodes to {unpacked} bytes")));
    }
    let inner = match flags {
        FLAG_STORED if stored == unpacked => None,
        FLAG_STORED => return Err(ArcError::mismatch("stored block with differing lengths")),
        FLAG_ZLIB   => Some(CodecExporterFactory::shared(CodecId::Zlib)),
        FLAG_LZ4    => Some(CodecExporterFactory::shared(CodecId::Lz4)),
        other       => return Err(ArcError::mismatch(format!("unknown block flags {other:#x}"))),
    };
    Ok(BlockSpan { offset: cursor.position(), stored_len: stored, decompressed_len: unpacked, inner })
}

fn read_directory(cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<Vec<DirEntry>> {
    cursor.seek(0)?;
    if &cursor.read_array::<4>()? != MAGIC {
        return Err(ArcError::mismatch("missing ZBLK magic"));
    }
    let version = cursor.u32_le()?;
    ctx.limits().check_range("zblk version", version as u64, 1, VERSION as u64)?;
    let count   = cursor.u32_le()? as u64;
    let dir_at  = cursor.u32_le()? as u64;
    ctx.limits().check_range("zblk entry count", count, 0, ctx.limits().max_entries)?;
    check_span("zblk directory", dir_at, count * ENTRY_LEN, cursor.len())?;

    cursor.seek(dir_at)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(DirEntry {
            name:     cursor.fixed_string(NAME_LEN as u64)?,
            offset:   cursor.u32_le()? as u64,
            stored:   cursor.u32_le()? as u64,
            unpacked: cursor.u32_le()? as u64,
            blocks:   cursor.u32_le()?,
            crc:      cursor.u32_le()?,
            tag:      cursor.u32_le()?,
        });
    }
    Ok(out)
}

impl FormatPlugin for ZblkFormat {
    fn info(&self) -> &PluginInfo { &INFO }

    fn match_rating(&self, cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<Rating> {
        let mut r = Rating::new();
        r.check(ctx.extension_in(INFO.extensions), 25);
        if !r.require(&cursor.read_array::<4>()? == MAGIC, 50) {
            return Ok(r);
        }
        let _      = cursor.u32_le()?;
        let count  = cursor.u32_le()? as u64;
        let dir_at = cursor.u32_le()? as u64;
        r.check(dir_at >= HEADER_LEN && check_span("", dir_at, count * ENTRY_LEN, cursor.len()).is_ok(), 10);
        r.check(count > 0 && count <= ctx.limits().max_entries, 5);
        Ok(r)
    }

    fn read(&self, cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<ReadOutcome> {
        let dir = read_directory(cursor, ctx)?;
        let mut entries = EntryCollector::new(dir.len());

        for (index, e) in dir.into_iter().enumerate() {
            if let Err(err) = check_span("zblk entry", e.offset, e.stored, cursor.len()) {
                entries.drop_entry(index, &err);
                continue;
            }
            let scan = collect_blocks(
                cursor,
                e.offset,
                e.stored,
                Some(e.blocks as usize),
                ctx.limits().max_blocks_per_resource,
                read_block_header,
            )?;
            for _ in 0..scan.anomalies {
                entries.anomaly(&format!("zblk entry '{}': block chain inconsistent", e.name));
            }
            let total = scan.decompressed_total();
            let mut b = ResourceBuilder::new(e.name)
                .offset(e.offset)
                .stored_len(e.stored)
                .property("crc32", e.crc)
                .property("tag", e.tag)
                .property("blocks", scan.blocks.len() as u32);
            if total != e.unpacked {
                entries.anomaly(&format!(
                    "zblk entry '{}': declares {} bytes, blocks hold {total}",
                    b.name, e.unpacked
                ));
                b = b.property("truncated", true);
            }
            b.attach_exporter(scan.into_factory(), total);
            entries.push(b);
        }
        Ok(entries.finish(cursor.source()))
    }

    fn write(&self, entries: &[RebuildEntry], out: &mut dyn WriteSeek, _: &ProbeContext<'_>) -> Result<()> {
        write_archive(entries, &Prior::default(), out)
    }

    fn replace(
        &self,
        entries: &[RebuildEntry],
        source_archive: &Path,
        out: &mut dyn WriteSeek,
        ctx: &ProbeContext<'_>,
    ) -> Result<()> {
        let source = ArchiveSource::open(source_archive)?;
        let mut cursor = ByteCursor::with_read_ahead(Arc::clone(&source), ctx.config.read_ahead);
        let prior = Prior::load(&mut cursor, ctx)?;
        info!(archive = %source_archive.display(), entries = prior.tags.len(), "replacing zblk entries");
        write_archive(entries, &prior, out)
    }
}

/// What `replace` keeps from the archive being replaced.
#[derive(Default)]
struct Prior {
    source: Option<Arc<ArchiveSource>>,
    tags:   HashMap<String, u32>,
    /// Entries that can be copied through without recompression, by offset.
    raw:    HashMap<u64, DirEntry>,
}

impl Prior {
    fn load(cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<Self> {
        let dir = read_directory(cursor, ctx)?;
        let mut prior = Prior { source: Some(Arc::clone(cursor.source())), ..Prior::default() };
        for e in dir {
            prior.tags.insert(e.name.clone(), e.tag);
            prior.raw.insert(e.offset, e);
        }
        Ok(prior)
    }

    /// Directory entry for `entry` if it is an unchanged resource of the
    /// prior archive.
    fn passthrough(&self, entry: &RebuildEntry) -> Option<&DirEntry> {
        let EntrySource::Resource(r) = &entry.source else { return None };
        let prior = self.source.as_ref()?;
        let same_file = match (r.source().path(), prior.path()) {
            (Some(a), Some(b)) => a == b || same_path(a, b),
            _ => Arc::ptr_eq(r.source(), prior),
        };
        if !same_file || r.property("truncated").is_some() {
            return None;
        }
        self.raw.get(&r.offset()).filter(|e| e.stored == r.stored_len())
    }
}

fn write_archive(entries: &[RebuildEntry], prior: &Prior, out: &mut dyn WriteSeek) -> Result<()> {
    let mut w = ByteWriter::new(out);
    w.bytes(MAGIC)?;
    w.u32_le(VERSION)?;
    w.u32_le(entries.len() as u32)?;
    w.u32_le(0)?;

    let mut dir = Vec::with_capacity(entries.len());
    for entry in entries {
        let offset = w.position()?;
        let tag = prior.tags.get(&entry.name).copied().unwrap_or(0);
        let mut record = match (prior.passthrough(entry), &prior.source) {
            (Some(old), Some(src)) => {
                let raw = src.read_vec(old.offset, old.stored)?;
                w.bytes(&raw)?;
                debug!(name = %entry.name, "block chain copied through");
                DirEntry { offset, ..old.clone() }
            }
            _ => write_chain(&mut w, &entry.bytes()?, offset)?,
        };
        record.name = entry.name.clone();
        record.tag  = tag;
        dir.push(record);
    }

    let dir_at = w.position()?;
    for e in &dir {
        w.fixed_string(&e.name, NAME_LEN)?;
        for v in [e.offset, e.stored, e.unpacked] {
            w.u32_le(to_u32(v)?)?;
        }
        w.u32_le(e.blocks)?;
        w.u32_le(e.crc)?;
        w.u32_le(e.tag)?;
    }
    w.overwrite_at(12, &to_u32(dir_at)?.to_le_bytes())?;
    w.flush()
}

fn write_chain<W: Write + Seek>(w: &mut ByteWriter<W>, data: &[u8], offset: u64) -> Result<DirEntry> {
    let zlib = get_codec(CodecId::Zlib);
    let mut blocks = 0u32;
    for chunk in data.chunks(MAX_BLOCK) {
        let packed = zlib.compress(chunk, 6)?;
        let (flags, payload) = if packed.len() < chunk.len() {
            (FLAG_ZLIB, packed.as_slice())
        } else {
            (FLAG_STORED, chunk)
        };
        w.u32_le(payload.len() as u32)?;
        w.u32_le(chunk.len() as u32)?;
        w.u16_le(flags)?;
        w.u16_le(0)?;
        w.bytes(payload)?;
        blocks += 1;
    }
    Ok(DirEntry {
        name:     String::new(),
        offset,
        stored:   w.position()? - offset,
        unpacked: data.len() as u64,
        blocks,
        crc:      crc32fast::hash(data),
        tag:      0,
    })
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn to_u32(v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| ArcError::mismatch(format!("{v} does not fit a zblk u32 field")))
}
