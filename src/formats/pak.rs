//! `pak`: a data region followed by a nested directory record.
//!
//! ```text
//! 0   "PAK\0"
//! 4   u32 data offset
//! 8   u32 data length
//! 12  u8  root-name length, root name
//! ..  file data (each file 16-byte aligned)
//! ..  directory record, at data offset + data length:
//!       u8 name_len, name, u32 subdir_count, u32 file_count,
//!       file_count × (u8 name_len, name, u32 offset from data start, u32 length),
//!       subdir_count × directory record
//! ```

use std::collections::BTreeMap;
use std::io::{Seek, Write};
use tracing::debug;

use crate::cursor::{ByteCursor, ByteWriter};
use crate::directory::DirectoryTree;
use crate::error::{check_span, ArcError, Result};
use crate::plugin::{
    Capabilities, FormatPlugin, PluginInfo, ProbeContext, Rating, RebuildEntry, WriteSeek,
};
use crate::resource::{EntryCollector, ReadOutcome, ResourceBuilder};

use super::split_path;

const MAGIC: &[u8; 4] = b"PAK\0";
const FIXED_HEADER: u64 = 13;
const ALIGN: u64 = 16;

pub struct PakFormat;

static INFO: PluginInfo = PluginInfo {
    code:         "pak",
    name:         "Generic PAK archive",
    extensions:   &["pak"],
    platforms:    &["pc"],
    capabilities: Capabilities {
        can_read:                true,
        can_write:               true,
        can_replace:             false,
        can_rename:              true,
        can_scan_for_file_types: false,
    },
};

struct Header {
    data_offset: u64,
    data_len:    u64,
    root_name:   String,
}

fn read_header(cursor: &mut ByteCursor) -> Result<Header> {
    cursor.seek(0)?;
    if &cursor.read_array::<4>()? != MAGIC {
        return Err(ArcError::mismatch("missing PAK magic"));
    }
    let data_offset = cursor.u32_le()? as u64;
    let data_len    = cursor.u32_le()? as u64;
    let root_name   = cursor.pascal_string()?;
    Ok(Header { data_offset, data_len, root_name })
}

impl FormatPlugin for PakFormat {
    fn info(&self) -> &PluginInfo { &INFO }

    fn match_rating(&self, cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<Rating> {
        let mut r = Rating::new();
        r.check(ctx.extension_in(INFO.extensions), 25);

        let magic = cursor.read_array::<4>()?;
        if !r.require(&magic == MAGIC, 50) {
            return Ok(r);
        }
        let data_offset = cursor.u32_le()? as u64;
        let data_len    = cursor.u32_le()? as u64;
        let root_len    = cursor.u8()? as u64;
        let header_end  = FIXED_HEADER + root_len;

        r.check(data_offset + data_len <= cursor.len(), 5);
        r.check(data_offset >= header_end, 5);
        r.check(root_len <= ctx.limits().max_name_length && header_end <= cursor.len(), 5);
        Ok(r)
    }

    fn read(&self, cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<ReadOutcome> {
        let limits = ctx.limits();
        let header = read_header(cursor)?;
        check_span("pak data region", header.data_offset, header.data_len, cursor.len())?;
        cursor.seek(header.data_offset + header.data_len)?;

        let mut tree     = DirectoryTree::new(limits.max_directory_depth);
        let mut builders = Vec::new();
        let mut owners   = Vec::new();
        let mut declared = 0u64;
        let mut dropped  = Vec::new();

        // (directory, subdirectories still to read)
        let mut open: Vec<(usize, u32)> = Vec::new();
        let mut parent = None;
        loop {
            if open.len() > limits.max_directory_depth {
                return Err(ArcError::mismatch("pak directory nesting too deep"));
            }
            let name    = cursor.pascal_string()?;
            limits.check_name_length(name.len() as u64)?;
            let subdirs = cursor.u32_le()?;
            let files   = cursor.u32_le()?;
            declared += files as u64;
            limits.check_range("pak file count", declared, 0, limits.max_entries)?;

            let dir = tree.add(name, parent);
            for _ in 0..files {
                let file   = cursor.pascal_string()?;
                limits.check_name_length(file.len() as u64)?;
                let offset = cursor.u32_le()? as u64;
                let len    = cursor.u32_le()? as u64;
                match check_span("pak file", offset, len, header.data_len) {
                    Ok(()) => {
                        builders.push(
                            ResourceBuilder::new(file)
                                .offset(header.data_offset + offset)
                                .stored_len(len),
                        );
                        owners.push(Some(dir));
                    }
                    Err(e) => dropped.push((builders.len() + dropped.len(), e)),
                }
            }
            open.push((dir, subdirs));

            parent = loop {
                match open.last_mut() {
                    Some((d, left)) if *left > 0 => {
                        *left -= 1;
                        break Some(*d);
                    }
                    Some(_) => {
                        open.pop();
                    }
                    None => break None,
                }
            };
            if parent.is_none() {
                break;
            }
        }
        debug!(dirs = tree.len(), files = declared, "pak directory parsed");

        tree.apply_prefixes(&mut builders, &owners, "/")?;
        let mut entries = EntryCollector::new(declared as usize);
        for (index, e) in &dropped {
            entries.drop_entry(*index, e);
        }
        for mut b in builders {
            if !header.root_name.is_empty() {
                b = b.property("root", header.root_name.as_str());
            }
            entries.push(b);
        }
        Ok(entries.finish(cursor.source()))
    }

    fn write(&self, entries: &[RebuildEntry], out: &mut dyn WriteSeek, _: &ProbeContext<'_>) -> Result<()> {
        let mut root = DirNode::default();
        for (index, entry) in entries.iter().enumerate() {
            let (dirs, file) = split_path(&entry.name)?;
            root.insert(&dirs, file, index);
        }

        let mut w = ByteWriter::new(out);
        w.bytes(MAGIC)?;
        w.u32_le(0)?;
        w.u32_le(0)?;
        w.pascal_string("")?;
        w.pad_to(ALIGN)?;
        let data_offset = w.position()?;

        let mut placed = Vec::with_capacity(entries.len());
        for entry in entries {
            let at  = w.position()? - data_offset;
            let len = w.copy_from(&mut entry.open()?)?;
            placed.push((to_u32(at)?, to_u32(len)?));
            w.pad_to(ALIGN)?;
        }
        let data_len = to_u32(w.position()? - data_offset)?;

        root.write(&mut w, &placed)?;
        w.overwrite_at(4, &to_u32(data_offset)?.to_le_bytes())?;
        w.overwrite_at(8, &data_len.to_le_bytes())?;
        w.flush()
    }
}

fn to_u32(v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| ArcError::mismatch(format!("{v} does not fit a pak u32 field")))
}

/// Directory being assembled for writing.
#[derive(Default)]
struct DirNode {
    name:    String,
    files:   Vec<(String, usize)>,
    subdirs: BTreeMap<String, DirNode>,
}

impl DirNode {
    fn insert(&mut self, dirs: &[&str], file: &str, index: usize) {
        match dirs.split_first() {
            None => self.files.push((file.to_string(), index)),
            Some((first, rest)) => self
                .subdirs
                .entry(first.to_string())
                .or_insert_with(|| DirNode { name: first.to_string(), ..DirNode::default() })
                .insert(rest, file, index),
        }
    }

    fn write<W: Write + Seek>(&self, w: &mut ByteWriter<W>, placed: &[(u32, u32)]) -> Result<()> {
        w.pascal_string(&self.name)?;
        w.u32_le(self.subdirs.len() as u32)?;
        w.u32_le(self.files.len() as u32)?;
        for (name, index) in &self.files {
            let (offset, len) = placed[*index];
            w.pascal_string(name)?;
            w.u32_le(offset)?;
            w.u32_le(len)?;
        }
        for sub in self.subdirs.values() {
            sub.write(w, placed)?;
        }
        Ok(())
    }
}
