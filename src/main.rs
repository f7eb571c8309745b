use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gamearc::{write_archive, ArchiveSession, EngineConfig, RebuildEntry, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gamearc", about = "Inspect, extract and rebuild game archives")]
struct Cli {
    /// JSON engine settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the formats this build understands
    Formats,
    /// Score a file against every format
    Detect {
        input: PathBuf,
    },
    /// List archive contents
    List {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Extract resources
    Extract {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Extract only these names
        #[arg(long, num_args = 1..)]
        only: Vec<String>,
    },
    /// BLAKE3 of every decoded resource
    Hash {
        input: PathBuf,
    },
    /// Build a new archive from files or directories
    Pack {
        #[arg(short, long)]
        format: String,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
    },
    /// Rebuild an archive with some entries swapped for files on disk
    Replace {
        archive: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// NAME=PATH
        #[arg(long = "file", required = true, num_args = 1..)]
        files: Vec<String>,
    },
    /// Rebuild an archive with entries renamed
    Rename {
        archive: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// OLD=NEW
        #[arg(long = "entry", required = true, num_args = 1..)]
        entries: Vec<String>,
    },
    /// Decode every resource and check recorded checksums
    Verify {
        input: PathBuf,
    },
}

#[derive(Serialize)]
struct ListRow<'a> {
    name:             &'a str,
    offset:           u64,
    stored_len:       u64,
    decompressed_len: u64,
    exporter:         &'a str,
    properties:       &'a BTreeMap<String, gamearc::resource::PropertyValue>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let registry = Arc::new(Registry::with_builtin());

    match cli.command {

        // ── Formats ──────────────────────────────────────────────────────────
        Commands::Formats => {
            println!("{:<6} {:<28} {:<6} {}", "Code", "Name", "Caps", "Extensions");
            for p in registry.plugins() {
                let info = p.info();
                println!(
                    "{:<6} {:<28} {:<6} {}",
                    info.code,
                    info.name,
                    info.capabilities.flags(),
                    info.extensions.join(", ")
                );
            }
        }

        // ── Detect ───────────────────────────────────────────────────────────
        Commands::Detect { input } => {
            let session = ArchiveSession::open(&input, registry, config)?;
            println!("{:<6} {:>5}", "Code", "Score");
            for c in session.scores() {
                println!("{:<6} {:>5}", c.code, c.score);
            }
            match session.detect() {
                Some(best) => println!("Detected: {} ({})", best.code, best.score),
                None       => bail!("format not recognized: {}", input.display()),
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, json } => {
            let session = read_session(&input, registry, config)?;
            let rows: Vec<ListRow> = session
                .resources()
                .iter()
                .map(|r| ListRow {
                    name:             r.name(),
                    offset:           r.offset(),
                    stored_len:       r.stored_len(),
                    decompressed_len: r.decompressed_len(),
                    exporter:         r.exporter().map_or("raw", |e| e.name()),
                    properties:       r.properties(),
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("{:<40} {:>12} {:>12} {:>12}  Exporter", "Name", "Offset", "Stored", "Size");
                for row in &rows {
                    println!(
                        "{:<40} {:>12} {:>12} {:>12}  {}",
                        row.name, row.offset, row.stored_len, row.decompressed_len, row.exporter
                    );
                }
                println!("{}", session.outcome().summary());
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir, only } => {
            let session = read_session(&input, registry, config)?;
            if only.is_empty() {
                let report = session.extract_all(&output_dir, |done, total| {
                    tracing::debug!(done, total, "progress");
                })?;
                for (name, e) in &report.failures {
                    eprintln!("  failed  {name}: {e}");
                }
                println!("Extracted {} resources to {}", report.succeeded, output_dir.display());
                if !report.is_clean() {
                    bail!("{} resources failed", report.failures.len());
                }
            } else {
                for name in &only {
                    let r = session
                        .find(name)
                        .with_context(|| format!("no resource named '{name}'"))?;
                    let path = session.extract_to_dir(r, &output_dir)?;
                    println!("  extracted  {}", path.display());
                }
            }
        }

        // ── Hash ─────────────────────────────────────────────────────────────
        Commands::Hash { input } => {
            let session = read_session(&input, registry, config)?;
            for r in session.resources() {
                let mut hasher = blake3::Hasher::new();
                session.extract(r, &mut hasher)?;
                println!("{}  {}", hex::encode(hasher.finalize().as_bytes()), r.name());
            }
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { format, output, inputs } => {
            let plugin = registry
                .find(&format)
                .with_context(|| format!("unknown format '{format}'"))?;
            let mut entries = Vec::new();
            for path in &inputs {
                collect_inputs(path, &mut entries)?;
            }
            write_archive(plugin.as_ref(), &entries, &output, &config)?;
            for e in &entries {
                println!("  packed  {}", e.name);
            }
            println!("Created: {}", output.display());
        }

        // ── Replace ──────────────────────────────────────────────────────────
        Commands::Replace { archive, output, files } => {
            let session = read_session(&archive, registry, config)?;
            let mut replacements = Vec::new();
            for pair in &files {
                let (name, path) = split_pair(pair)?;
                replacements.push(RebuildEntry::from_file(name, path));
            }
            session.replace(replacements, &output)?;
            println!("Created: {}", output.display());
        }

        // ── Rename ───────────────────────────────────────────────────────────
        Commands::Rename { archive, output, entries } => {
            let session = read_session(&archive, registry, config)?;
            let renames = entries
                .iter()
                .map(|s| split_pair(s).map(|(a, b)| (a.to_string(), b.to_string())))
                .collect::<Result<Vec<_>>>()?;
            session.rename(&renames, &output)?;
            println!("Created: {}", output.display());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let session = read_session(&input, registry, config)?;
            let report = session.verify(|_, _| {});
            for (name, e) in &report.failures {
                println!("  FAIL  {name}: {e}");
            }
            println!("{} ok, {} failed", report.succeeded, report.failures.len());
            if !report.is_clean() {
                bail!("verification failed");
            }
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("gamearc=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gamearc=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_session(path: &Path, registry: Arc<Registry>, config: EngineConfig) -> Result<ArchiveSession> {
    let mut session = ArchiveSession::open(path, registry, config)
        .with_context(|| format!("opening {}", path.display()))?;
    session.read().with_context(|| format!("reading {}", path.display()))?;
    Ok(session)
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((a, b)) if !a.is_empty() && !b.is_empty() => Ok((a, b)),
        _ => bail!("expected NAME=VALUE, got '{pair}'"),
    }
}

/// Files are added by file name; directories recursively, relative to
/// themselves.
fn collect_inputs(path: &Path, out: &mut Vec<RebuildEntry>) -> Result<()> {
    if path.is_dir() {
        walk_dir(path, path, out)
    } else {
        let name = path
            .file_name()
            .with_context(|| format!("no file name in {}", path.display()))?
            .to_string_lossy()
            .into_owned();
        out.push(RebuildEntry::from_file(name, path));
        Ok(())
    }
}

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<RebuildEntry>) -> Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());
    for child in children {
        let path = child.path();
        if path.is_dir() {
            walk_dir(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root)?;
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(RebuildEntry::from_file(name, path.clone()));
        }
    }
    Ok(())
}
