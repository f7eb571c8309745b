//! Format registry and detection.
//!
//! Detection is an explicit state machine:
//!
//! ```text
//! Idle → Probing(0) → Scored(0, r) → Probing(1) → … → Selected(best) → Parsing → Done
//!                                                    ↘ Rejected (nothing scored > 0)
//! ```
//!
//! The highest score wins; ties go to the plugin registered first; a score
//! of zero is never selected.  A probe that errors or panics scores zero,
//! so nothing a plugin does while probing reaches the caller.
//!
//! If the selected plugin's `read()` fails and
//! [`EngineConfig::retry_on_read_failure`] is set, the next positively rated
//! candidate is selected and parsed instead.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::cursor::{ArchiveSource, ByteCursor};
use crate::error::{ArcError, Result};
use crate::formats::{OtblFormat, PakFormat, ZblkFormat};
use crate::plugin::{FormatPlugin, ProbeContext};
use crate::resource::{ReadOutcome, Resource};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Registry {
    plugins: Vec<Arc<dyn FormatPlugin>>,
}

/// One plugin's score against one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub index: usize,
    pub code:  &'static str,
    pub score: u32,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// The reference formats, in a fixed order.
    pub fn with_builtin() -> Self {
        let mut r = Self::new();
        r.plugins.push(Arc::new(PakFormat));
        r.plugins.push(Arc::new(ZblkFormat));
        r.plugins.push(Arc::new(OtblFormat));
        r
    }

    /// Append a plugin.  Codes must be unique.
    pub fn register(&mut self, plugin: Arc<dyn FormatPlugin>) -> Result<()> {
        let code = plugin.info().code;
        if self.find(code).is_some() {
            return Err(ArcError::Config(format!("format code '{code}' registered twice")));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn len(&self) -> usize { self.plugins.len() }
    pub fn is_empty(&self) -> bool { self.plugins.is_empty() }
    pub fn plugins(&self) -> &[Arc<dyn FormatPlugin>] { &self.plugins }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn FormatPlugin>> {
        self.plugins.get(index)
    }

    pub fn find(&self, code: &str) -> Option<Arc<dyn FormatPlugin>> {
        self.plugins.iter().find(|p| p.info().code == code).cloned()
    }

    /// Every plugin's score, in registration order.
    pub fn score_all(&self, source: &Arc<ArchiveSource>, config: &EngineConfig) -> Vec<Candidate> {
        let ext = source.extension();
        let ctx = ProbeContext::new(ext.as_deref(), config);
        let score_one = |(index, plugin): (usize, &Arc<dyn FormatPlugin>)| Candidate {
            index,
            code:  plugin.info().code,
            score: rate(plugin.as_ref(), source, &ctx),
        };

        #[cfg(feature = "parallel")]
        let scores = self.plugins.par_iter().enumerate().map(score_one).collect();
        #[cfg(not(feature = "parallel"))]
        let scores = self.plugins.iter().enumerate().map(score_one).collect();

        scores
    }

    /// Run scoring to completion and return the winner, if any.
    pub fn detect(&self, source: &Arc<ArchiveSource>, config: &EngineConfig) -> Option<Candidate> {
        let mut detector = Detector::new(self, Arc::clone(source), config);
        match detector.run() {
            DetectState::Selected { index, score } => Some(Candidate {
                index,
                code: self.plugins[index].info().code,
                score,
            }),
            _ => None,
        }
    }

    /// Detect, then read, falling back to the next candidate on failure.
    /// Unnamed resources get sniffed names.
    pub fn read_with_fallback(
        &self,
        source: &Arc<ArchiveSource>,
        config: &EngineConfig,
    ) -> Result<(Arc<dyn FormatPlugin>, ReadOutcome)> {
        let mut detector = Detector::new(self, Arc::clone(source), config);
        let (index, mut outcome) = detector.parse()?;
        let plugin = Arc::clone(&self.plugins[index]);
        Self::sniff_names(plugin.as_ref(), &mut outcome.resources, config.sniff_window);
        Ok((plugin, outcome))
    }

    /// Name every unnamed resource `NNNNN.ext`.  Plugins that can scan for
    /// file types are asked for the extension from the first `window`
    /// decoded bytes; everything else is named `.bin`.
    pub fn sniff_names(plugin: &dyn FormatPlugin, resources: &mut [Resource], window: usize) {
        let scan = plugin.info().capabilities.can_scan_for_file_types;
        for (index, resource) in resources.iter_mut().enumerate() {
            if !resource.is_unnamed() {
                continue;
            }
            let ext = if scan {
                match sniff_header(resource, window) {
                    Ok(header) => plugin.guess_extension(resource, &header),
                    Err(e) => {
                        debug!(index, error = %e, "header unreadable; naming as bin");
                        None
                    }
                }
            } else {
                None
            };
            resource.set_name(format!("{index:05}.{}", ext.unwrap_or("bin")));
        }
    }
}

fn rate(plugin: &dyn FormatPlugin, source: &Arc<ArchiveSource>, ctx: &ProbeContext<'_>) -> u32 {
    let code       = plugin.info().code;
    let mut cursor = ByteCursor::with_read_ahead(Arc::clone(source), ctx.config.read_ahead);
    match panic::catch_unwind(AssertUnwindSafe(|| plugin.match_rating(&mut cursor, ctx))) {
        Ok(Ok(rating)) => rating.score(),
        Ok(Err(e)) => {
            debug!(code, error = %e, "probe failed");
            0
        }
        Err(_) => {
            warn!(code, "probe panicked; scoring 0");
            0
        }
    }
}

fn sniff_header(resource: &Resource, window: usize) -> Result<Vec<u8>> {
    use std::io::Read;
    let want = (window as u64).min(resource.decompressed_len());
    if !resource.is_compressed() {
        return resource.source().read_vec(resource.offset(), want);
    }
    let mut header = Vec::with_capacity(want as usize);
    crate::exporter::ResourceReader::open(resource)?
        .take(want)
        .read_to_end(&mut header)?;
    Ok(header)
}

// ── Detector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectState {
    Idle,
    Probing(usize),
    Scored { index: usize, score: u32 },
    Selected { index: usize, score: u32 },
    Parsing(usize),
    Done(usize),
    Rejected,
}

pub struct Detector<'r> {
    registry:  &'r Registry,
    source:    Arc<ArchiveSource>,
    config:    &'r EngineConfig,
    extension: Option<String>,
    state:     DetectState,
    scores:    Vec<Option<u32>>,
}

impl<'r> Detector<'r> {
    pub fn new(registry: &'r Registry, source: Arc<ArchiveSource>, config: &'r EngineConfig) -> Self {
        let extension = source.extension();

        #[cfg(feature = "parallel")]
        let scores = registry
            .score_all(&source, config)
            .into_iter()
            .map(|c| Some(c.score))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let scores = vec![None; registry.len()];

        Self { registry, source, config, extension, state: DetectState::Idle, scores }
    }

    pub fn state(&self) -> DetectState { self.state }

    /// Scores computed so far, in registration order.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.scores
            .iter()
            .enumerate()
            .filter_map(|(index, s)| {
                s.map(|score| Candidate { index, code: self.registry.plugins[index].info().code, score })
            })
            .collect()
    }

    /// Advance the scoring phase by one transition.  Selected, Parsing, Done
    /// and Rejected are fixed points here; [`parse`](Self::parse) moves past
    /// them.
    pub fn step(&mut self) -> DetectState {
        let n = self.registry.len();
        let next = match self.state {
            DetectState::Idle if n == 0 => DetectState::Rejected,
            DetectState::Idle => DetectState::Probing(0),
            DetectState::Probing(index) => DetectState::Scored { index, score: self.score(index) },
            DetectState::Scored { index, .. } if index + 1 < n => DetectState::Probing(index + 1),
            DetectState::Scored { .. } => self.select(&[]),
            fixed => fixed,
        };
        self.state = next;
        next
    }

    /// Step until a plugin is selected or every plugin scored zero.
    pub fn run(&mut self) -> DetectState {
        while matches!(
            self.state,
            DetectState::Idle | DetectState::Probing(_) | DetectState::Scored { .. }
        ) {
            self.step();
        }
        self.state
    }

    /// Select, read, and fall back.  Returns the index of the plugin that
    /// produced the outcome.
    pub fn parse(&mut self) -> Result<(usize, ReadOutcome)> {
        let mut tried: Vec<usize> = Vec::new();
        let mut last_err = None;
        loop {
            match self.run() {
                DetectState::Selected { index, score } => {
                    self.state = DetectState::Parsing(index);
                    let registry = self.registry;
                    let plugin = &registry.plugins[index];
                    info!(format = plugin.info().code, score, "parsing");
                    let ctx = ProbeContext::new(self.extension.as_deref(), self.config);
                    let mut cursor =
                        ByteCursor::with_read_ahead(Arc::clone(&self.source), self.config.read_ahead);
                    match plugin.read(&mut cursor, &ctx) {
                        Ok(outcome) => {
                            self.state = DetectState::Done(index);
                            return Ok((index, outcome));
                        }
                        Err(e) => {
                            warn!(format = plugin.info().code, error = %e, "read failed");
                            tried.push(index);
                            let fatal = matches!(e, ArcError::Io(_));
                            last_err = Some(e);
                            self.state = if self.config.retry_on_read_failure && !fatal {
                                self.select(&tried)
                            } else {
                                DetectState::Rejected
                            };
                        }
                    }
                }
                DetectState::Parsing(index) | DetectState::Done(index) => {
                    let score = self.scores[index].unwrap_or(0);
                    self.state = DetectState::Selected { index, score };
                }
                _ => {
                    return Err(last_err.unwrap_or_else(|| {
                        info!(source = self.source.label(), "format not recognized");
                        ArcError::NotRecognized
                    }));
                }
            }
        }
    }

    fn score(&mut self, index: usize) -> u32 {
        if let Some(score) = self.scores[index] {
            return score;
        }
        let plugin = Arc::clone(&self.registry.plugins[index]);
        let ctx    = ProbeContext::new(self.extension.as_deref(), self.config);
        let score  = rate(plugin.as_ref(), &self.source, &ctx);
        debug!(format = plugin.info().code, score, "scored");
        self.scores[index] = Some(score);
        score
    }

    /// Best positive score not in `exclude`; earlier registration wins ties.
    fn select(&mut self, exclude: &[usize]) -> DetectState {
        let mut best: Option<(usize, u32)> = None;
        for index in 0..self.registry.len() {
            if exclude.contains(&index) {
                continue;
            }
            let score = self.score(index);
            if score > 0 && best.map_or(true, |(_, b)| score > b) {
                best = Some((index, score));
            }
        }
        match best {
            Some((index, score)) => DetectState::Selected { index, score },
            None => DetectState::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Capabilities, PluginInfo, Rating};
    use crate::resource::{EntryCollector, ResourceBuilder};

    /// Scores a fixed value; optionally fails to read or panics while probing.
    struct Fixed {
        info:      PluginInfo,
        score:     u32,
        fail_read: bool,
        panics:    bool,
    }

    fn fixed(code: &'static str, score: u32) -> Fixed {
        Fixed {
            info: PluginInfo {
                code,
                name:         code,
                extensions:   &[],
                platforms:    &[],
                capabilities: Capabilities::READ_ONLY,
            },
            score,
            fail_read: false,
            panics:    false,
        }
    }

    impl FormatPlugin for Fixed {
        fn info(&self) -> &PluginInfo { &self.info }

        fn match_rating(&self, _: &mut ByteCursor, _: &ProbeContext<'_>) -> Result<Rating> {
            if self.panics {
                panic!("probe bug");
            }
            let mut r = Rating::new();
            r.add(self.score);
            Ok(r)
        }

        fn read(&self, cursor: &mut ByteCursor, _: &ProbeContext<'_>) -> Result<ReadOutcome> {
            if self.fail_read {
                return Err(ArcError::mismatch("directory corrupt"));
            }
            let mut c = EntryCollector::new(1);
            c.push(ResourceBuilder::new(self.info.code).offset(0).stored_len(cursor.len()));
            Ok(c.finish(cursor.source()))
        }
    }

    fn source() -> Arc<ArchiveSource> {
        ArchiveSource::from_bytes("mem", vec![0u8; 8])
    }

    fn registry(plugins: Vec<Fixed>) -> Registry {
        let mut r = Registry::new();
        for p in plugins {
            r.register(Arc::new(p)).unwrap();
        }
        r
    }

    #[test]
    fn ties_go_to_first_registered() {
        let r = registry(vec![fixed("a", 10), fixed("b", 40), fixed("c", 40)]);
        let best = r.detect(&source(), &EngineConfig::default()).unwrap();
        assert_eq!((best.code, best.score), ("b", 40));
    }

    #[test]
    fn zero_is_never_selected() {
        let r = registry(vec![fixed("a", 0), fixed("b", 0)]);
        assert_eq!(r.detect(&source(), &EngineConfig::default()), None);
        let cfg = EngineConfig::default();
        let mut d = Detector::new(&r, source(), &cfg);
        assert!(matches!(d.parse(), Err(ArcError::NotRecognized)));
        assert_eq!(d.state(), DetectState::Rejected);
    }

    #[test]
    fn state_machine_walks_every_plugin() {
        let r = registry(vec![fixed("a", 5), fixed("b", 9)]);
        let cfg = EngineConfig::default();
        let mut d = Detector::new(&r, source(), &cfg);
        let mut seen = vec![d.state()];
        while !matches!(d.state(), DetectState::Selected { .. } | DetectState::Rejected) {
            seen.push(d.step());
        }
        assert_eq!(
            seen,
            vec![
                DetectState::Idle,
                DetectState::Probing(0),
                DetectState::Scored { index: 0, score: 5 },
                DetectState::Probing(1),
                DetectState::Scored { index: 1, score: 9 },
                DetectState::Selected { index: 1, score: 9 },
            ]
        );
        let (index, _) = d.parse().unwrap();
        assert_eq!(index, 1);
        assert_eq!(d.state(), DetectState::Done(1));
    }

    #[test]
    fn panicking_probe_scores_zero() {
        let mut bad = fixed("bad", 100);
        bad.panics = true;
        let r = registry(vec![bad, fixed("ok", 1)]);
        let scores = r.score_all(&source(), &EngineConfig::default());
        assert_eq!(scores[0].score, 0);
        assert_eq!(r.detect(&source(), &EngineConfig::default()).unwrap().code, "ok");
    }

    #[test]
    fn failing_read_falls_back_when_enabled() {
        let mut broken = fixed("broken", 90);
        broken.fail_read = true;
        let r = registry(vec![broken, fixed("second", 20), fixed("zero", 0)]);

        let (plugin, outcome) = r.read_with_fallback(&source(), &EngineConfig::default()).unwrap();
        assert_eq!(plugin.info().code, "second");
        assert_eq!(outcome.resources[0].name(), "second");

        let strict = EngineConfig { retry_on_read_failure: false, ..EngineConfig::default() };
        assert!(matches!(
            r.read_with_fallback(&source(), &strict),
            Err(ArcError::FormatMismatch(_))
        ));
    }

    #[test]
    fn duplicate_codes_are_refused() {
        let mut r = registry(vec![fixed("a", 1)]);
        assert!(matches!(r.register(Arc::new(fixed("a", 2))), Err(ArcError::Config(_))));
    }

    #[test]
    fn builtin_order_is_fixed() {
        let r = Registry::with_builtin();
        let codes: Vec<_> = r.plugins().iter().map(|p| p.info().code).collect();
        assert_eq!(codes, vec!["pak", "zblk", "otbl"]);
        assert!(r.find("zblk").is_some());
        assert!(r.find("nope").is_none());
    }

    #[test]
    fn unnamed_resources_get_sniffed_names() {
        let mut bytes = b"OggS\0\0".to_vec();
        bytes.extend_from_slice(&[0, 1, 2, 3]);
        let src = ArchiveSource::from_bytes("mem", bytes);
        let mut resources = vec![
            ResourceBuilder::at(0).stored_len(6).finalize(&src).unwrap(),
            ResourceBuilder::at(6).stored_len(4).finalize(&src).unwrap(),
            ResourceBuilder::new("kept.dat").offset(0).stored_len(1).finalize(&src).unwrap(),
        ];
        let blind = resources.clone();

        let mut scanner = fixed("x", 1);
        scanner.info.capabilities.can_scan_for_file_types = true;
        Registry::sniff_names(&scanner, &mut resources, 16);
        let names: Vec<_> = resources.iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["00000.ogg", "00001.bin", "kept.dat"]);

        let mut resources = blind;
        Registry::sniff_names(&fixed("y", 1), &mut resources, 16);
        let names: Vec<_> = resources.iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["00000.bin", "00001.bin", "kept.dat"]);
    }
}
