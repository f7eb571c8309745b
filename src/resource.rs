//! The uniform descriptor of one logical file inside an archive.
//!
//! Plugins never hand out half-built entries.  During `read()` they work on
//! [`ResourceBuilder`]s (offsets may be provisional, names get directory
//! prefixes later, exporters get attached by a second pass) and push them
//! into an [`EntryCollector`].  [`EntryCollector::finish`] validates every
//! builder against the source and turns it into an immutable [`Resource`];
//! builders that fail are dropped individually and the shortfall is reported
//! in the [`ReadOutcome`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::cursor::ArchiveSource;
use crate::error::{check_span, ArcError, Result};
use crate::exporter::ExporterFactory;

// ── Properties ───────────────────────────────────────────────────────────────

/// Scalar metadata a viewer may want (width, height, sample rate, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl From<i64> for PropertyValue { fn from(v: i64) -> Self { PropertyValue::Int(v) } }
impl From<u32> for PropertyValue { fn from(v: u32) -> Self { PropertyValue::Int(v as i64) } }
impl From<f64> for PropertyValue { fn from(v: f64) -> Self { PropertyValue::Float(v) } }
impl From<bool> for PropertyValue { fn from(v: bool) -> Self { PropertyValue::Bool(v) } }
impl From<&str> for PropertyValue { fn from(v: &str) -> Self { PropertyValue::Text(v.to_string()) } }
impl From<String> for PropertyValue { fn from(v: String) -> Self { PropertyValue::Text(v) } }

// ── Resource ─────────────────────────────────────────────────────────────────

/// Stable identity of a resource: which file, which offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceId {
    pub source: String,
    pub offset: u64,
}

/// A finalized, immutable resource.
#[derive(Clone)]
pub struct Resource {
    source:           Arc<ArchiveSource>,
    offset:           u64,
    stored_len:       u64,
    decompressed_len: u64,
    name:             String,
    exporter:         Option<Arc<dyn ExporterFactory>>,
    properties:       BTreeMap<String, PropertyValue>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("stored_len", &self.stored_len)
            .field("decompressed_len", &self.decompressed_len)
            .field("exporter", &self.exporter.as_ref().map(|e| e.name()))
            .finish()
    }
}

impl Resource {
    pub fn source(&self) -> &Arc<ArchiveSource> { &self.source }
    pub fn offset(&self) -> u64 { self.offset }
    pub fn stored_len(&self) -> u64 { self.stored_len }
    pub fn decompressed_len(&self) -> u64 { self.decompressed_len }
    pub fn name(&self) -> &str { &self.name }
    pub fn exporter(&self) -> Option<&Arc<dyn ExporterFactory>> { self.exporter.as_ref() }
    pub fn is_compressed(&self) -> bool { self.exporter.is_some() }
    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> { &self.properties }
    pub fn property(&self, key: &str) -> Option<&PropertyValue> { self.properties.get(key) }

    /// Checksum of the decoded content, when the directory records one.
    pub fn crc32(&self) -> Option<u32> {
        match self.properties.get("crc32")? {
            PropertyValue::Int(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            source: self.source.label().to_string(),
            offset: self.offset,
        }
    }

    /// True when the directory stored no name for this entry.
    pub fn is_unnamed(&self) -> bool { self.name.is_empty() }

    /// Extension of the display name, lower-cased.
    pub fn extension(&self) -> Option<String> {
        let base = self.name.rsplit('/').next()?;
        let (_, ext) = base.rsplit_once('.')?;
        (!ext.is_empty()).then(|| ext.to_lowercase())
    }

    /// Only the detection pipeline renames, before resources are returned.
    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Reopen as a builder, e.g. to feed a rebuilt archive.
    pub fn to_builder(&self) -> ResourceBuilder {
        ResourceBuilder {
            offset:           Some(self.offset),
            stored_len:       Some(self.stored_len),
            decompressed_len: Some(self.decompressed_len),
            name:             self.name.clone(),
            exporter:         self.exporter.clone(),
            properties:       self.properties.clone(),
        }
    }
}

// ── ResourceBuilder ──────────────────────────────────────────────────────────

/// Mutable, provisional resource owned by a plugin while it parses.
#[derive(Clone, Default)]
pub struct ResourceBuilder {
    pub offset:           Option<u64>,
    pub stored_len:       Option<u64>,
    pub decompressed_len: Option<u64>,
    pub name:             String,
    pub exporter:         Option<Arc<dyn ExporterFactory>>,
    pub properties:       BTreeMap<String, PropertyValue>,
}

impl fmt::Debug for ResourceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBuilder")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("stored_len", &self.stored_len)
            .field("decompressed_len", &self.decompressed_len)
            .finish()
    }
}

impl ResourceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn at(offset: u64) -> Self {
        Self { offset: Some(offset), ..Self::default() }
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn stored_len(mut self, len: u64) -> Self {
        self.stored_len = Some(len);
        self
    }

    pub fn decompressed_len(mut self, len: u64) -> Self {
        self.decompressed_len = Some(len);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn ExporterFactory>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn attach_exporter(&mut self, exporter: Arc<dyn ExporterFactory>, decompressed_len: u64) {
        self.exporter         = Some(exporter);
        self.decompressed_len = Some(decompressed_len);
    }

    /// Prepend a directory path (`"dir"` + `"file"` → `"dir/file"`).
    pub fn prefix_name(&mut self, prefix: &str) {
        let prefix = prefix.trim_end_matches(['/', '\\']);
        if prefix.is_empty() {
            return;
        }
        self.name = if self.name.is_empty() {
            format!("{prefix}/")
        } else {
            format!("{prefix}/{}", self.name)
        };
    }

    /// Validate against `source` and freeze.
    pub fn finalize(self, source: &Arc<ArchiveSource>) -> Result<Resource> {
        let offset = self
            .offset
            .ok_or_else(|| ArcError::mismatch(format!("entry '{}' has no offset", self.name)))?;
        let stored_len = self
            .stored_len
            .ok_or_else(|| ArcError::mismatch(format!("entry '{}' has no length", self.name)))?;
        check_span("resource", offset, stored_len, source.len())?;

        let decompressed_len = match (&self.exporter, self.decompressed_len) {
            (None, Some(d)) if d != stored_len => {
                return Err(ArcError::mismatch(format!(
                    "entry '{}' is uncompressed but declares {d} bytes for {stored_len} stored",
                    self.name
                )));
            }
            (None, _)          => stored_len,
            (Some(_), Some(d)) => d,
            (Some(_), None)    => {
                return Err(ArcError::mismatch(format!(
                    "entry '{}' has an exporter but no decompressed length",
                    self.name
                )));
            }
        };

        Ok(Resource {
            source: Arc::clone(source),
            offset,
            stored_len,
            decompressed_len,
            name: self.name,
            exporter: self.exporter,
            properties: self.properties,
        })
    }
}

// ── Collection ───────────────────────────────────────────────────────────────

/// Result of a plugin's `read()`.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub resources: Vec<Resource>,
    /// Entry count the directory declared.
    pub expected:  usize,
    /// Non-fatal inconsistencies seen while parsing.
    pub anomalies: usize,
}

impl ReadOutcome {
    pub fn is_partial(&self) -> bool {
        self.resources.len() < self.expected
    }

    pub fn summary(&self) -> String {
        if self.is_partial() {
            format!(
                "archive opened with {} of {} expected entries",
                self.resources.len(),
                self.expected
            )
        } else {
            format!("archive opened with {} entries", self.resources.len())
        }
    }
}

/// Accumulates builders during `read()`; drops bad entries one at a time.
#[derive(Debug, Default)]
pub struct EntryCollector {
    builders:  Vec<ResourceBuilder>,
    expected:  usize,
    dropped:   usize,
    anomalies: usize,
}

impl EntryCollector {
    pub fn new(expected: usize) -> Self {
        Self { builders: Vec::with_capacity(expected.min(4096)), expected, ..Self::default() }
    }

    pub fn push(&mut self, builder: ResourceBuilder) {
        self.builders.push(builder);
    }

    /// Record an entry that was skipped before it became a builder.
    pub fn drop_entry(&mut self, index: usize, reason: &ArcError) {
        warn!(index, %reason, "dropping directory entry");
        self.dropped += 1;
    }

    /// Record a non-fatal inconsistency.
    pub fn anomaly(&mut self, message: &str) {
        warn!("{message}");
        self.anomalies += 1;
    }

    pub fn builders(&self) -> &[ResourceBuilder] { &self.builders }
    pub fn builders_mut(&mut self) -> &mut Vec<ResourceBuilder> { &mut self.builders }
    pub fn expected(&self) -> usize { self.expected }
    pub fn dropped(&self) -> usize { self.dropped }

    pub fn finish(self, source: &Arc<ArchiveSource>) -> ReadOutcome {
        let mut resources = Vec::with_capacity(self.builders.len());
        for (index, builder) in self.builders.into_iter().enumerate() {
            let name = builder.name.clone();
            match builder.finalize(source) {
                Ok(r)  => resources.push(r),
                Err(e) => warn!(index, name = %name, error = %e, "dropping unresolved entry"),
            }
        }
        ReadOutcome {
            resources,
            expected:  self.expected,
            anomalies: self.anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::exporter::CodecExporterFactory;

    fn source(len: usize) -> Arc<ArchiveSource> {
        ArchiveSource::from_bytes("mem", vec![0u8; len])
    }

    #[test]
    fn finalize_defaults_decompressed_to_stored() {
        let r = ResourceBuilder::new("a.bin").offset(4).stored_len(8).finalize(&source(16)).unwrap();
        assert_eq!(r.decompressed_len(), 8);
        assert!(!r.is_compressed());
    }

    #[test]
    fn finalize_rejects_out_of_range_and_unresolved() {
        let src = source(16);
        assert!(matches!(
            ResourceBuilder::new("x").offset(10).stored_len(7).finalize(&src),
            Err(ArcError::OutOfBounds { .. })
        ));
        assert!(ResourceBuilder::new("x").stored_len(1).finalize(&src).is_err());
        assert!(ResourceBuilder::at(0).finalize(&src).is_err());
        assert!(ResourceBuilder::at(0).stored_len(4).decompressed_len(9).finalize(&src).is_err());
    }

    #[test]
    fn compressed_entries_need_a_length() {
        let src = source(16);
        let f = CodecExporterFactory::shared(CodecId::Zlib);
        assert!(ResourceBuilder::at(0).stored_len(4).exporter(f.clone()).finalize(&src).is_err());
        let r = ResourceBuilder::at(0).stored_len(4).exporter(f).decompressed_len(40).finalize(&src).unwrap();
        assert_eq!(r.decompressed_len(), 40);
        assert!(r.is_compressed());
    }

    #[test]
    fn prefixing_joins_paths() {
        let mut b = ResourceBuilder::new("file.dds");
        b.prefix_name("textures/");
        b.prefix_name("data");
        assert_eq!(b.name, "data/textures/file.dds");
        b.prefix_name("");
        assert_eq!(b.name, "data/textures/file.dds");
    }

    #[test]
    fn collector_shrinks_instead_of_failing() {
        let src = source(32);
        let mut c = EntryCollector::new(3);
        c.push(ResourceBuilder::new("ok").offset(0).stored_len(8));
        c.push(ResourceBuilder::new("bad").offset(30).stored_len(8));
        c.push(ResourceBuilder::new("ok2").offset(8).stored_len(8));
        let out = c.finish(&src);
        assert_eq!(out.resources.len(), 2);
        assert!(out.is_partial());
        assert_eq!(out.summary(), "archive opened with 2 of 3 expected entries");
    }

    #[test]
    fn extension_comes_from_last_component() {
        let r = ResourceBuilder::new("dir.v2/Tex.DDS").offset(0).stored_len(0).finalize(&source(1)).unwrap();
        assert_eq!(r.extension().as_deref(), Some("dds"));
        let r = ResourceBuilder::new("dir.v2/noext").offset(0).stored_len(0).finalize(&source(1)).unwrap();
        assert_eq!(r.extension(), None);
    }
}
