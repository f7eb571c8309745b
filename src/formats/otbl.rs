//! `otbl`: a bare offset table.
//!
//! ```text
//! 0   u32 count
//! 4   count × u32 absolute offset
//! ..  data
//! ```
//!
//! The table stores neither names nor lengths.  Lengths come from the
//! sorted offsets; names are assigned from content by the registry.  An
//! entry beginning `ZLB\0` + u32 raw length is zlib data starting 8 bytes
//! in.

use tracing::debug;

use crate::codec::{get_codec, CodecId};
use crate::cursor::{ByteCursor, ByteWriter};
use crate::directory::derive_builder_lengths;
use crate::error::{check_span, ArcError, Result};
use crate::exporter::CodecExporterFactory;
use crate::plugin::{
    Capabilities, FormatPlugin, PluginInfo, ProbeContext, Rating, RebuildEntry, WriteSeek,
};
use crate::resource::{EntryCollector, ReadOutcome, ResourceBuilder};

const PACKED_MAGIC: &[u8; 4] = b"ZLB\0";
const PACKED_HEADER: u64 = 8;
/// Entries smaller than this are never packed.
const PACK_THRESHOLD: usize = 64;

pub struct OtblFormat;

static INFO: PluginInfo = PluginInfo {
    code:         "otbl",
    name:         "Offset table",
    extensions:   &["otbl", "tbl"],
    platforms:    &["pc", "ps2"],
    capabilities: Capabilities {
        can_read:                true,
        can_write:               true,
        can_replace:             false,
        can_rename:              false,
        can_scan_for_file_types: true,
    },
};

fn read_table(cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<Vec<u64>> {
    cursor.seek(0)?;
    let count = cursor.u32_le()? as u64;
    ctx.limits().check_count("otbl entry", count)?;
    check_span("otbl table", 4, count * 4, cursor.len())?;
    (0..count).map(|_| Ok(cursor.u32_le()? as u64)).collect()
}

impl FormatPlugin for OtblFormat {
    fn info(&self) -> &PluginInfo { &INFO }

    fn match_rating(&self, cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<Rating> {
        let mut r = Rating::new();
        r.check(ctx.extension_in(INFO.extensions), 10);

        let count = cursor.u32_le()? as u64;
        let table_end = 4 + count * 4;
        if count == 0 || table_end > cursor.len() {
            r.reject();
            return Ok(r);
        }
        r.check(count <= ctx.limits().max_entries, 20);

        let first = cursor.u32_le()? as u64;
        r.check(first == table_end, 20);

        let mut prev     = first;
        let mut in_order = first <= cursor.len();
        for _ in 1..count.min(ctx.limits().max_entries) {
            let next = cursor.u32_le()? as u64;
            in_order &= next >= prev && next <= cursor.len();
            prev = next;
        }
        r.check(in_order, 20);
        Ok(r)
    }

    fn read(&self, cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<ReadOutcome> {
        let offsets = read_table(cursor, ctx)?;
        let table_end = 4 + offsets.len() as u64 * 4;

        let mut entries = EntryCollector::new(offsets.len());
        for &offset in &offsets {
            let offset = if offset < table_end && offset != 0 {
                entries.anomaly(&format!("otbl offset {offset} points into the table"));
                0
            } else {
                offset
            };
            entries.push(ResourceBuilder::at(offset));
        }
        let removed = derive_builder_lengths(&mut entries, cursor.len());
        debug!(count = offsets.len(), removed, "otbl lengths derived");

        // Second pass: bind the zlib exporter where the content says so.
        let mut packed = 0usize;
        for b in entries.builders_mut().iter_mut() {
            let (Some(offset), Some(len)) = (b.offset, b.stored_len) else { continue };
            if len < PACKED_HEADER {
                continue;
            }
            cursor.seek(offset)?;
            if &cursor.read_array::<4>()? != PACKED_MAGIC {
                continue;
            }
            let raw_len  = cursor.u32_le()? as u64;
            b.offset     = Some(offset + PACKED_HEADER);
            b.stored_len = Some(len - PACKED_HEADER);
            b.attach_exporter(CodecExporterFactory::shared(CodecId::Zlib), raw_len);
            packed += 1;
        }
        debug!(packed, "otbl packed entries bound");
        Ok(entries.finish(cursor.source()))
    }

    fn write(&self, entries: &[RebuildEntry], out: &mut dyn WriteSeek, _: &ProbeContext<'_>) -> Result<()> {
        if entries.is_empty() {
            return Err(ArcError::mismatch("otbl needs at least one entry"));
        }
        let mut w = ByteWriter::new(out);
        w.u32_le(entries.len() as u32)?;
        for _ in entries {
            w.u32_le(0)?;
        }

        let zlib = get_codec(CodecId::Zlib);
        for (i, entry) in entries.iter().enumerate() {
            let at = w.position()?;
            let offset = u32::try_from(at)
                .map_err(|_| ArcError::mismatch("otbl archive larger than 4 GiB"))?;
            w.overwrite_at(4 + i as u64 * 4, &offset.to_le_bytes())?;

            let data = entry.bytes()?;
            // Raw bytes that open with the frame magic would be misread as packed.
            let must_frame = data.starts_with(PACKED_MAGIC);
            let packed = if must_frame || data.len() >= PACK_THRESHOLD {
                Some(zlib.compress(&data, 6)?)
                    .filter(|p| must_frame || p.len() + (PACKED_HEADER as usize) < data.len())
            } else {
                None
            };
            match packed {
                Some(p) => {
                    w.bytes(PACKED_MAGIC)?;
                    w.u32_le(data.len() as u32)?;
                    w.bytes(&p)?;
                }
                None => w.bytes(&data)?,
            }
        }
        w.flush()
    }
}
