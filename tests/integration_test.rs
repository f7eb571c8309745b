use gamearc::cursor::ByteCursor;
use gamearc::plugin::{PluginInfo, ProbeContext, Rating};
use gamearc::resource::{PropertyValue, ReadOutcome};
use gamearc::{
    export_vec, write_archive, ArcError, ArchiveSession, ArchiveSource, EngineConfig,
    FormatPlugin, RebuildEntry, Registry,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, NamedTempFile};

fn builtin() -> Arc<Registry> {
    Arc::new(Registry::with_builtin())
}

fn pack(code: &str, entries: &[RebuildEntry], dest: &Path) {
    let registry = Registry::with_builtin();
    let plugin = registry.find(code).unwrap();
    write_archive(plugin.as_ref(), entries, dest, &EngineConfig::default()).unwrap();
}

fn open(path: &Path) -> ArchiveSession {
    let mut s = ArchiveSession::open(path, builtin(), EngineConfig::default()).unwrap();
    s.read().unwrap();
    s
}

fn memory_session(bytes: Vec<u8>) -> ArchiveSession {
    ArchiveSession::from_source(ArchiveSource::from_bytes("mem", bytes), builtin(), EngineConfig::default())
}

// ── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn pak_round_trip_through_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.pak");
    let texture: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    pack(
        "pak",
        &[
            RebuildEntry::from_bytes("textures/wall.dds", texture.clone()),
            RebuildEntry::from_bytes("scripts/init.lua", b"print('hi')".to_vec()),
            RebuildEntry::from_bytes("version.txt", b"1.0".to_vec()),
        ],
        &path,
    );

    let s = open(&path);
    assert_eq!(s.plugin().unwrap().info().code, "pak");
    assert_eq!(s.resources().len(), 3);
    let wall = s.find("textures/wall.dds").unwrap();
    assert_eq!(export_vec(wall).unwrap(), texture);
    assert_eq!(wall.offset() % 16, 0);
    assert_eq!(export_vec(s.find("version.txt").unwrap()).unwrap(), b"1.0");
}

#[test]
fn zblk_round_trip_with_checksums() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("level.zblk");
    let big: Vec<u8> = b"tile;".iter().copied().cycle().take(200_000).collect();
    pack(
        "zblk",
        &[RebuildEntry::from_bytes("map.bin", big.clone()), RebuildEntry::from_bytes("a.txt", b"x".to_vec())],
        &path,
    );

    let s = open(&path);
    let map = s.find("map.bin").unwrap();
    assert!(map.is_compressed());
    assert!(map.stored_len() < big.len() as u64);
    assert_eq!(map.decompressed_len(), big.len() as u64);
    assert_eq!(export_vec(map).unwrap(), big);
    assert!(s.verify(|_, _| {}).is_clean());
}

#[test]
fn otbl_names_are_sniffed_from_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sounds.otbl");
    let mut ogg = b"OggS".to_vec();
    ogg.extend(std::iter::repeat(0x11).take(300));
    pack(
        "otbl",
        &[
            RebuildEntry::from_bytes("ignored", ogg.clone()),
            RebuildEntry::from_bytes("ignored", b"plain words here".to_vec()),
            RebuildEntry::from_bytes("ignored", vec![0, 1, 2, 3]),
        ],
        &path,
    );

    let s = open(&path);
    let names: Vec<_> = s.resources().iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["00000.ogg", "00001.txt", "00002.bin"]);
    assert!(s.resources()[0].is_compressed());
    assert_eq!(export_vec(&s.resources()[0]).unwrap(), ogg);
}

// ── Detection ────────────────────────────────────────────────────────────────

#[test]
fn minimal_pak_header_is_detected_without_extension() {
    let bytes = {
        let mut out = std::io::Cursor::new(Vec::new());
        let cfg = EngineConfig::default();
        Registry::with_builtin()
            .find("pak")
            .unwrap()
            .write(&[], &mut out, &ProbeContext::new(None, &cfg))
            .unwrap();
        out.into_inner()
    };
    assert_eq!(&bytes[..13], b"PAK\0\x10\0\0\0\0\0\0\0\0");

    let s = memory_session(bytes);
    let best = s.detect().unwrap();
    assert_eq!(best.code, "pak");
    assert!(best.score >= 60);
    assert!(s.scores().iter().filter(|c| c.code != "pak").all(|c| c.score < best.score));
}

#[test]
fn wrong_magic_zeroes_the_score_despite_extension() {
    let mut f = tempfile::Builder::new().suffix(".pak").tempfile().unwrap();
    std::io::Write::write_all(&mut f, b"NOPE\x10\0\0\0\0\0\0\0\0\0\0\0").unwrap();
    let s = ArchiveSession::open(f.path(), builtin(), EngineConfig::default()).unwrap();
    let pak = s.scores().into_iter().find(|c| c.code == "pak").unwrap();
    assert_eq!(pak.score, 0);
    assert!(s.detect().is_none());
}

#[test]
fn unknown_bytes_are_not_recognized() {
    let mut s = memory_session(vec![0xFF; 64]);
    assert!(matches!(s.read(), Err(ArcError::NotRecognized)));
}

/// Rates above everything, then fails to parse.
struct Greedy;

static GREEDY: PluginInfo = PluginInfo {
    code:         "greedy",
    name:         "Claims everything",
    extensions:   &[],
    platforms:    &[],
    capabilities: gamearc::plugin::Capabilities::READ_ONLY,
};

impl FormatPlugin for Greedy {
    fn info(&self) -> &PluginInfo { &GREEDY }

    fn match_rating(&self, _: &mut ByteCursor, _: &ProbeContext<'_>) -> gamearc::Result<Rating> {
        let mut r = Rating::new();
        r.add(1000);
        Ok(r)
    }

    fn read(&self, _: &mut ByteCursor, _: &ProbeContext<'_>) -> gamearc::Result<ReadOutcome> {
        Err(ArcError::mismatch("not actually mine"))
    }
}

#[test]
fn failed_read_falls_back_to_next_candidate() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("x.pak");
    pack("pak", &[RebuildEntry::from_bytes("a.txt", b"abc".to_vec())], &path);

    let mut registry = Registry::with_builtin();
    registry.register(Arc::new(Greedy)).unwrap();
    let registry = Arc::new(registry);

    let mut s = ArchiveSession::open(&path, Arc::clone(&registry), EngineConfig::default()).unwrap();
    s.read().unwrap();
    assert_eq!(s.plugin().unwrap().info().code, "pak");

    let strict = EngineConfig { retry_on_read_failure: false, ..EngineConfig::default() };
    let mut s = ArchiveSession::open(&path, registry, strict).unwrap();
    assert!(matches!(s.read(), Err(ArcError::FormatMismatch(_))));
}

// ── Damage ───────────────────────────────────────────────────────────────────

#[test]
fn partial_archive_reports_shortfall() {
    let tmp = NamedTempFile::new().unwrap();
    pack(
        "zblk",
        &[RebuildEntry::from_bytes("ok", vec![1; 10]), RebuildEntry::from_bytes("bad", vec![2; 10])],
        tmp.path(),
    );
    let mut bytes = fs::read(tmp.path()).unwrap();
    let dir_at = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let second_offset = dir_at + 56 + 32;
    bytes[second_offset..second_offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());

    let mut s = memory_session(bytes);
    let outcome = s.read().unwrap();
    assert_eq!(outcome.resources.len(), 1);
    assert_eq!(outcome.summary(), "archive opened with 1 of 2 expected entries");
}

#[test]
fn truncated_archives_never_panic() {
    let entries = [
        RebuildEntry::from_bytes("dir/a", b"hello hello hello hello".to_vec()),
        RebuildEntry::from_bytes("b", vec![9; 80]),
        RebuildEntry::from_bytes("c", b"OggS".iter().copied().cycle().take(600).collect()),
    ];
    for code in ["pak", "zblk", "otbl"] {
        let tmp = NamedTempFile::new().unwrap();
        pack(code, &entries, tmp.path());
        let full = fs::read(tmp.path()).unwrap();
        for cut in 0..full.len() {
            let mut s = memory_session(full[..cut].to_vec());
            if let Ok(outcome) = s.read() {
                for r in &outcome.resources {
                    let _ = export_vec(r);
                }
            }
        }
    }
}

// ── Parallel batches ─────────────────────────────────────────────────────────

#[cfg(feature = "parallel")]
#[test]
fn parallel_scoring_and_extraction_match_serial_results() {
    use std::sync::Mutex;

    let dir = tempdir().unwrap();
    let path = dir.path().join("many.pak");
    let entries: Vec<_> = (0..64u32)
        .map(|i| RebuildEntry::from_bytes(format!("d{}/f{i}.bin", i % 4), vec![i as u8; 100 + i as usize]))
        .collect();
    pack("pak", &entries, &path);

    let s = open(&path);
    let registry = builtin();
    let scores = s.scores();
    assert_eq!(scores.len(), registry.len());
    for (i, (candidate, plugin)) in scores.iter().zip(registry.plugins()).enumerate() {
        assert_eq!(candidate.index, i);
        assert_eq!(candidate.code, plugin.info().code);
    }
    for _ in 0..8 {
        assert_eq!(s.scores(), scores);
    }
    let best = s.detect().unwrap();
    assert_eq!(best.code, "pak");
    assert!(scores.iter().filter(|c| c.code != "pak").all(|c| c.score < best.score));

    let seen = Mutex::new(Vec::new());
    let out = dir.path().join("out");
    let report = s.extract_all(&out, |done, total| seen.lock().unwrap().push((done, total))).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.succeeded, 64);

    let mut seen = seen.into_inner().unwrap();
    seen.sort();
    assert_eq!(seen, (1..=64).map(|d| (d, 64)).collect::<Vec<_>>());
    for (i, e) in entries.iter().enumerate() {
        let written = fs::read(out.join(&e.name)).unwrap();
        assert_eq!(written, vec![i as u8; 100 + i]);
    }

    let report = s.verify(|_, _| {});
    assert!(report.is_clean());
    assert_eq!(report.succeeded, 64);
}

// ── Rebuilding ───────────────────────────────────────────────────────────────

#[test]
fn replace_keeps_opaque_tags_and_untouched_data() {
    let dir = tempdir().unwrap();
    let original = dir.path().join("orig.zblk");
    pack(
        "zblk",
        &[RebuildEntry::from_bytes("keep.bin", vec![4; 1000]), RebuildEntry::from_bytes("swap.bin", vec![5; 10])],
        &original,
    );

    // Stamp tags the engine never interprets.
    let mut bytes = fs::read(&original).unwrap();
    let dir_at = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    for (i, tag) in [0xAAAA_0001u32, 0xBBBB_0002].iter().enumerate() {
        let at = dir_at + i * 56 + 52;
        bytes[at..at + 4].copy_from_slice(&tag.to_le_bytes());
    }
    fs::write(&original, &bytes).unwrap();

    let replacement = dir.path().join("new.bin");
    fs::write(&replacement, b"replaced content").unwrap();
    let out = dir.path().join("out.zblk");
    let s = open(&original);
    s.replace(vec![RebuildEntry::from_file("swap.bin", &replacement)], &out).unwrap();

    let rebuilt = open(&out);
    let keep = rebuilt.find("keep.bin").unwrap();
    let swap = rebuilt.find("swap.bin").unwrap();
    assert_eq!(keep.property("tag"), Some(&PropertyValue::Int(0xAAAA_0001)));
    assert_eq!(swap.property("tag"), Some(&PropertyValue::Int(0xBBBB_0002)));
    assert_eq!(export_vec(keep).unwrap(), vec![4; 1000]);
    assert_eq!(export_vec(swap).unwrap(), b"replaced content");
    assert!(rebuilt.verify(|_, _| {}).is_clean());
}

#[test]
fn rename_rebuilds_with_new_names() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("r.pak");
    pack("pak", &[RebuildEntry::from_bytes("old/name.txt", b"data".to_vec())], &path);

    let out = dir.path().join("renamed.pak");
    open(&path)
        .rename(&[("old/name.txt".to_string(), "new/dir/name.txt".to_string())], &out)
        .unwrap();

    let s = open(&out);
    assert!(s.find("old/name.txt").is_none());
    assert_eq!(export_vec(s.find("new/dir/name.txt").unwrap()).unwrap(), b"data");
}

#[test]
fn write_is_refused_by_read_only_formats() {
    let dir = tempdir().unwrap();
    let err = write_archive(&Greedy, &[], &dir.path().join("g.bin"), &EngineConfig::default()).unwrap_err();
    assert!(matches!(err, ArcError::Unsupported { operation: "write", .. }));
}
