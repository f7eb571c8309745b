//! One archive, end to end: open → detect → read → extract → rebuild.
//!
//! Reads go through positioned I/O on a shared [`ArchiveSource`], so
//! resources can be extracted from several threads at once (the `parallel`
//! feature does this in [`ArchiveSession::extract_all`]).  Writers take a
//! process-wide lock on the destination path; a second writer to the same
//! path fails with [`ArcError::DestinationBusy`] instead of interleaving.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::cursor::{ArchiveSource, ByteCursor};
use crate::error::{ArcError, Result};
use crate::exporter::export_to;
use crate::plugin::{FormatPlugin, ProbeContext, RebuildEntry, WriteSeek};
use crate::registry::{Candidate, Registry};
use crate::resource::{ReadOutcome, Resource};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ── Session ──────────────────────────────────────────────────────────────────

pub struct ArchiveSession {
    registry: Arc<Registry>,
    config:   EngineConfig,
    source:   Arc<ArchiveSource>,
    plugin:   Option<Arc<dyn FormatPlugin>>,
    outcome:  ReadOutcome,
}

/// Result of [`ArchiveSession::extract_all`] or [`ArchiveSession::verify`].
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failures:  Vec<(String, ArcError)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool { self.failures.is_empty() }
}

impl ArchiveSession {
    pub fn open<P: AsRef<Path>>(path: P, registry: Arc<Registry>, config: EngineConfig) -> Result<Self> {
        let source = ArchiveSource::open(path)?;
        Ok(Self::from_source(source, registry, config))
    }

    pub fn from_source(source: Arc<ArchiveSource>, registry: Arc<Registry>, config: EngineConfig) -> Self {
        Self { registry, config, source, plugin: None, outcome: ReadOutcome::default() }
    }

    pub fn source(&self) -> &Arc<ArchiveSource> { &self.source }
    pub fn config(&self) -> &EngineConfig { &self.config }
    pub fn plugin(&self) -> Option<&Arc<dyn FormatPlugin>> { self.plugin.as_ref() }
    pub fn outcome(&self) -> &ReadOutcome { &self.outcome }
    pub fn resources(&self) -> &[Resource] { &self.outcome.resources }

    pub fn find(&self, name: &str) -> Option<&Resource> {
        self.outcome.resources.iter().find(|r| r.name() == name)
    }

    /// Every plugin's score, in registration order.
    pub fn scores(&self) -> Vec<Candidate> {
        self.registry.score_all(&self.source, &self.config)
    }

    pub fn detect(&self) -> Option<Candidate> {
        self.registry.detect(&self.source, &self.config)
    }

    /// Detect and parse, falling back per the config.
    pub fn read(&mut self) -> Result<&ReadOutcome> {
        let (plugin, outcome) = self.registry.read_with_fallback(&self.source, &self.config)?;
        self.finish_read(plugin, outcome);
        Ok(&self.outcome)
    }

    /// Parse with a specific plugin, skipping detection.
    pub fn read_as(&mut self, code: &str) -> Result<&ReadOutcome> {
        let plugin = self
            .registry
            .find(code)
            .ok_or_else(|| ArcError::Config(format!("unknown format code '{code}'")))?;
        let ext = self.source.extension();
        let ctx = ProbeContext::new(ext.as_deref(), &self.config);
        let mut cursor = ByteCursor::with_read_ahead(Arc::clone(&self.source), self.config.read_ahead);
        let mut outcome = plugin.read(&mut cursor, &ctx)?;
        Registry::sniff_names(plugin.as_ref(), &mut outcome.resources, self.config.sniff_window);
        self.finish_read(plugin, outcome);
        Ok(&self.outcome)
    }

    fn finish_read(&mut self, plugin: Arc<dyn FormatPlugin>, outcome: ReadOutcome) {
        let summary = outcome.summary();
        if outcome.is_partial() {
            warn!(source = self.source.label(), format = plugin.info().code, "{summary}");
        } else {
            info!(source = self.source.label(), format = plugin.info().code, "{summary}");
        }
        self.plugin  = Some(plugin);
        self.outcome = outcome;
    }

    // ── Extraction ───────────────────────────────────────────────────────────

    /// Stream exactly `decompressed_len` bytes of `resource` into `out`.
    pub fn extract<W: Write + ?Sized>(&self, resource: &Resource, out: &mut W) -> Result<u64> {
        export_to(resource, out)
    }

    /// Write `resource` under `dir`, creating directories from its name.
    pub fn extract_to_dir(&self, resource: &Resource, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(safe_relative_path(resource.name())?);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&path)?);
        export_to(resource, &mut out)?;
        out.flush()?;
        debug!(name = resource.name(), path = %path.display(), "extracted");
        Ok(path)
    }

    /// Extract every resource under `dir`.  `progress(done, total)` is called
    /// after each resource.  Individual failures are collected, not fatal.
    pub fn extract_all<F>(&self, dir: &Path, progress: F) -> Result<BatchReport>
    where
        F: FnMut(u64, u64) + Send,
    {
        fs::create_dir_all(dir)?;
        let report = self.for_each_resource(progress, |r| self.extract_to_dir(r, dir).map(|_| ()));
        info!(
            dir = %dir.display(),
            extracted = report.succeeded,
            failed = report.failures.len(),
            "extraction finished"
        );
        Ok(report)
    }

    /// Decode every resource and compare against recorded checksums.
    pub fn verify<F>(&self, progress: F) -> BatchReport
    where
        F: FnMut(u64, u64) + Send,
    {
        self.for_each_resource(progress, verify_resource)
    }

    fn for_each_resource<F, T>(&self, progress: F, task: T) -> BatchReport
    where
        F: FnMut(u64, u64) + Send,
        T: Fn(&Resource) -> Result<()> + Sync,
    {
        let total    = self.outcome.resources.len() as u64;
        let progress = Mutex::new((0u64, progress));
        let run = |r: &Resource| {
            let result = task(r);
            if let Ok(mut guard) = progress.lock() {
                let (done, sink) = &mut *guard;
                *done += 1;
                sink(*done, total);
            }
            result.err().map(|e| (r.name().to_string(), e))
        };

        #[cfg(feature = "parallel")]
        let failures: Vec<_> = self.outcome.resources.par_iter().filter_map(run).collect();
        #[cfg(not(feature = "parallel"))]
        let failures: Vec<_> = self.outcome.resources.iter().filter_map(run).collect();

        for (name, e) in &failures {
            warn!(name = %name, error = %e, "resource failed");
        }
        BatchReport { succeeded: total as usize - failures.len(), failures }
    }

    // ── Rebuilding ───────────────────────────────────────────────────────────

    /// Every current resource as a rebuild entry, in order.
    pub fn rebuild_entries(&self) -> Vec<RebuildEntry> {
        self.outcome.resources.iter().map(RebuildEntry::from_resource).collect()
    }

    /// Rebuild this archive with `replacements` swapped in by name; names
    /// not present are appended.  Fields the format keeps opaque are copied
    /// from this archive.
    pub fn replace(&self, replacements: Vec<RebuildEntry>, dest: &Path) -> Result<()> {
        let plugin = self.require_plugin()?;
        if !plugin.info().capabilities.can_replace {
            return Err(plugin.unsupported("replace"));
        }
        let source_path = self
            .source
            .path()
            .ok_or_else(|| ArcError::Config("replace needs an archive opened from a file".into()))?
            .to_path_buf();

        let mut entries = self.rebuild_entries();
        for new in replacements {
            match entries.iter_mut().find(|e| e.name == new.name) {
                Some(slot) => *slot = new,
                None => entries.push(new),
            }
        }
        let ext = self.source.extension();
        let ctx = ProbeContext::new(ext.as_deref(), &self.config);
        write_locked(dest, |out| plugin.replace(&entries, &source_path, out, &ctx))?;
        info!(dest = %dest.display(), entries = entries.len(), "archive replaced");
        Ok(())
    }

    /// Rebuild with entries renamed (`old name → new name`).
    pub fn rename(&self, renames: &[(String, String)], dest: &Path) -> Result<()> {
        let plugin = self.require_plugin()?;
        if !plugin.info().capabilities.can_rename {
            return Err(plugin.unsupported("rename"));
        }
        let mut entries = self.rebuild_entries();
        for (from, to) in renames {
            let entry = entries
                .iter_mut()
                .find(|e| &e.name == from)
                .ok_or_else(|| ArcError::Config(format!("no entry named '{from}'")))?;
            entry.name = to.clone();
        }
        write_archive(plugin.as_ref(), &entries, dest, &self.config)
    }

    fn require_plugin(&self) -> Result<&Arc<dyn FormatPlugin>> {
        self.plugin
            .as_ref()
            .ok_or_else(|| ArcError::Config("archive has not been read".into()))
    }
}

fn verify_resource(resource: &Resource) -> Result<()> {
    let mut sink = CrcSink { hasher: crc32fast::Hasher::new() };
    export_to(resource, &mut sink)?;
    match resource.crc32() {
        Some(expected) => {
            let actual = sink.hasher.finalize();
            if actual != expected {
                return Err(ArcError::mismatch(format!(
                    "crc32 {actual:08x} does not match recorded {expected:08x}"
                )));
            }
            Ok(())
        }
        None => Ok(()),
    }
}

struct CrcSink {
    hasher: crc32fast::Hasher,
}

impl Write for CrcSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

/// Reject names that would escape the extraction directory.
fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for part in name.split(['/', '\\']) {
        match Path::new(part).components().next() {
            None | Some(Component::CurDir) => {}
            Some(Component::Normal(p)) if Path::new(part).components().count() == 1 => out.push(p),
            _ => return Err(ArcError::mismatch(format!("unsafe entry name '{name}'"))),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ArcError::mismatch(format!("empty entry name '{name}'")));
    }
    Ok(out)
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Build a new archive of format `plugin` at `dest`.
pub fn write_archive(
    plugin: &dyn FormatPlugin,
    entries: &[RebuildEntry],
    dest: &Path,
    config: &EngineConfig,
) -> Result<()> {
    if !plugin.info().capabilities.can_write {
        return Err(plugin.unsupported("write"));
    }
    let ext = dest.extension().map(|e| e.to_string_lossy().to_lowercase());
    let ctx = ProbeContext::new(ext.as_deref(), config);
    write_locked(dest, |out| plugin.write(entries, out, &ctx))?;
    info!(format = plugin.info().code, dest = %dest.display(), entries = entries.len(), "archive written");
    Ok(())
}

fn busy_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static BUSY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    BUSY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a destination path for this process.
pub struct DestinationLock {
    key: PathBuf,
}

impl DestinationLock {
    pub fn acquire(dest: &Path) -> Result<Self> {
        let key = lock_key(dest);
        let mut busy = busy_paths()
            .lock()
            .map_err(|_| ArcError::Config("destination lock poisoned".into()))?;
        if !busy.insert(key.clone()) {
            return Err(ArcError::DestinationBusy(dest.to_path_buf()));
        }
        Ok(Self { key })
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        if let Ok(mut busy) = busy_paths().lock() {
            busy.remove(&self.key);
        }
    }
}

fn lock_key(dest: &Path) -> PathBuf {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), dest.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => dest.to_path_buf(),
    }
}

/// Write to a sibling `.partial` file under the destination lock, then
/// move it into place.  The destination is untouched if `body` fails.
fn write_locked<F>(dest: &Path, body: F) -> Result<()>
where
    F: FnOnce(&mut dyn WriteSeek) -> Result<()>,
{
    let _lock = DestinationLock::acquire(dest)?;
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let result = (|| -> Result<()> {
        let mut out = BufWriter::new(File::create(&partial)?);
        body(&mut out)?;
        out.flush()?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            fs::rename(&partial, dest)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}
