//! The contract every container format implements.
//!
//! A [`FormatPlugin`] is a stateless strategy object: it rates how likely a
//! byte source is to be its format, parses the directory into resources, and
//! optionally rebuilds a container from a list of [`RebuildEntry`]s.
//!
//! # Rating
//! Scores are additive and non-negative.  A plugin adds points for every
//! check that passes (extension, magic, sane header fields).  A check that
//! *contradicts* the format calls [`Rating::reject`], which pins the score
//! at zero no matter what is added afterwards.

pub mod sniff;

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::config::{EngineConfig, ValidationLimits};
use crate::cursor::ByteCursor;
use crate::error::{ArcError, Result};
use crate::exporter::{export_vec, ResourceReader};
use crate::resource::{ReadOutcome, Resource};

// ── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub can_read:                bool,
    pub can_write:               bool,
    pub can_replace:             bool,
    pub can_rename:              bool,
    pub can_scan_for_file_types: bool,
}

impl Capabilities {
    pub const READ_ONLY: Capabilities = Capabilities {
        can_read:                true,
        can_write:               false,
        can_replace:             false,
        can_rename:              false,
        can_scan_for_file_types: false,
    };

    /// Short flag string for listings, e.g. `RW-N-`.
    pub fn flags(&self) -> String {
        [
            (self.can_read, 'R'),
            (self.can_write, 'W'),
            (self.can_replace, 'P'),
            (self.can_rename, 'N'),
            (self.can_scan_for_file_types, 'S'),
        ]
        .iter()
        .map(|&(on, c)| if on { c } else { '-' })
        .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Short unique code, e.g. `"pak"`.
    pub code:         &'static str,
    pub name:         &'static str,
    /// Lower-case, without the dot.
    pub extensions:   &'static [&'static str],
    pub platforms:    &'static [&'static str],
    pub capabilities: Capabilities,
}

// ── Rating ───────────────────────────────────────────────────────────────────

/// Additive confidence score with a permanent reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rating {
    score:    u32,
    rejected: bool,
}

impl Rating {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, points: u32) {
        if !self.rejected {
            self.score = self.score.saturating_add(points);
        }
    }

    /// Add `points` if `cond` holds; returns `cond`.
    pub fn check(&mut self, cond: bool, points: u32) -> bool {
        if cond {
            self.add(points);
        }
        cond
    }

    /// Add `points` if `cond` holds, otherwise reject.  Returns `cond`.
    pub fn require(&mut self, cond: bool, points: u32) -> bool {
        if cond {
            self.add(points);
        } else {
            self.reject();
        }
        cond
    }

    pub fn reject(&mut self) {
        self.score    = 0;
        self.rejected = true;
    }

    pub fn score(&self) -> u32 { self.score }
    pub fn is_rejected(&self) -> bool { self.rejected }
}

// ── Context ──────────────────────────────────────────────────────────────────

/// What a plugin knows about the file besides its bytes.
#[derive(Debug, Clone, Copy)]
pub struct ProbeContext<'a> {
    /// Lower-cased extension of the source path, if any.
    pub extension: Option<&'a str>,
    pub config:    &'a EngineConfig,
}

impl<'a> ProbeContext<'a> {
    pub fn new(extension: Option<&'a str>, config: &'a EngineConfig) -> Self {
        Self { extension, config }
    }

    pub fn limits(&self) -> &ValidationLimits { &self.config.limits }

    pub fn extension_in(&self, extensions: &[&str]) -> bool {
        self.extension.map_or(false, |e| extensions.contains(&e))
    }
}

// ── Rebuild input ────────────────────────────────────────────────────────────

/// Where a rebuilt entry's bytes come from.
#[derive(Debug, Clone)]
pub enum EntrySource {
    /// An existing resource, decoded through its exporter.
    Resource(Resource),
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// A name plus content available on demand.
#[derive(Debug, Clone)]
pub struct RebuildEntry {
    pub name:   String,
    pub source: EntrySource,
}

impl RebuildEntry {
    pub fn from_resource(resource: &Resource) -> Self {
        Self { name: resource.name().to_string(), source: EntrySource::Resource(resource.clone()) }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), source: EntrySource::Bytes(bytes) }
    }

    pub fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), source: EntrySource::File(path.into()) }
    }

    /// Decoded length.
    pub fn len(&self) -> Result<u64> {
        Ok(match &self.source {
            EntrySource::Resource(r) => r.decompressed_len(),
            EntrySource::Bytes(b)    => b.len() as u64,
            EntrySource::File(p)     => std::fs::metadata(p)?.len(),
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Stream the decoded content.
    pub fn open(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(match &self.source {
            EntrySource::Resource(r) => Box::new(ResourceReader::open(r)?),
            EntrySource::Bytes(b)    => Box::new(Cursor::new(b.as_slice())),
            EntrySource::File(p)     => Box::new(File::open(p)?),
        })
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        match &self.source {
            EntrySource::Resource(r) => export_vec(r),
            EntrySource::Bytes(b)    => Ok(b.clone()),
            EntrySource::File(p)     => Ok(std::fs::read(p)?),
        }
    }
}

// ── Plugin trait ─────────────────────────────────────────────────────────────

/// Output sink for `write` / `replace`.
pub trait WriteSeek: Write + Seek {}
impl<T: Write + Seek> WriteSeek for T {}

pub trait FormatPlugin: Send + Sync {
    fn info(&self) -> &PluginInfo;

    /// Confidence that `cursor` holds this format.  Must not panic on any
    /// input; errors are treated as a score of zero.
    fn match_rating(&self, cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<Rating>;

    /// Parse the directory.  Reading the same bytes twice yields the same
    /// resources.
    fn read(&self, cursor: &mut ByteCursor, ctx: &ProbeContext<'_>) -> Result<ReadOutcome>;

    /// Build a new container holding `entries`.  Offsets are recomputed.
    fn write(
        &self,
        _entries: &[RebuildEntry],
        _out: &mut dyn WriteSeek,
        _ctx: &ProbeContext<'_>,
    ) -> Result<()> {
        Err(self.unsupported("write"))
    }

    /// Like `write`, but fields this engine does not interpret may be
    /// carried over from `source_archive`.
    fn replace(
        &self,
        _entries: &[RebuildEntry],
        _source_archive: &Path,
        _out: &mut dyn WriteSeek,
        _ctx: &ProbeContext<'_>,
    ) -> Result<()> {
        Err(self.unsupported("replace"))
    }

    /// Extension for an unnamed resource, from its first bytes.  Only asked
    /// when `can_scan_for_file_types` is set.
    fn guess_extension(&self, _resource: &Resource, header: &[u8]) -> Option<&'static str> {
        sniff::guess_from_magic(header)
    }

    fn unsupported(&self, operation: &'static str) -> ArcError {
        ArcError::Unsupported { format: self.info().code.to_string(), operation }
    }
}

impl fmt::Debug for dyn FormatPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatPlugin").field("code", &self.info().code).finish()
    }
}

/// Copy an entry into `out`, returning the bytes written.
pub fn copy_entry<W: Write + ?Sized>(entry: &RebuildEntry, out: &mut W) -> Result<u64> {
    let mut reader = entry.open()?;
    Ok(io::copy(&mut reader, out)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::ArchiveSource;
    use crate::resource::ResourceBuilder;

    #[test]
    fn reject_is_permanent() {
        let mut r = Rating::new();
        r.add(25);
        assert!(r.require(true, 50));
        assert_eq!(r.score(), 75);
        assert!(!r.require(false, 50));
        r.add(10);
        r.check(true, 5);
        assert_eq!(r.score(), 0);
        assert!(r.is_rejected());
    }

    #[test]
    fn capability_flags_render() {
        let caps = Capabilities { can_write: true, can_rename: true, ..Capabilities::READ_ONLY };
        assert_eq!(caps.flags(), "RW-N-");
    }

    #[test]
    fn rebuild_entries_yield_bytes_on_demand() {
        let src = ArchiveSource::from_bytes("mem", b"..payload..".to_vec());
        let res = ResourceBuilder::new("p").offset(2).stored_len(7).finalize(&src).unwrap();
        let e = RebuildEntry::from_resource(&res);
        assert_eq!(e.len().unwrap(), 7);
        assert_eq!(e.bytes().unwrap(), b"payload");

        let mut out = Vec::new();
        assert_eq!(copy_entry(&RebuildEntry::from_bytes("b", vec![1, 2, 3]), &mut out).unwrap(), 3);
        assert_eq!(out, vec![1, 2, 3]);
    }
}
