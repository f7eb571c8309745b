//! Detection, extraction and rebuilding of game archive containers.
//!
//! ```text
//! ArchiveSource ─► ByteCursor ─► FormatPlugin::read ─► Resource ─► Exporter ─► bytes
//!                         ▲
//!            Registry ────┘ (match_rating over every plugin, best score wins)
//! ```

pub mod codec;
pub mod config;
pub mod cursor;
pub mod directory;
pub mod error;
pub mod exporter;
pub mod formats;
pub mod plugin;
pub mod registry;
pub mod resource;
pub mod session;

pub use codec::{get_codec, CodecId};
pub use config::{EngineConfig, ValidationLimits};
pub use cursor::{ArchiveSource, ByteCursor, ByteWriter};
pub use error::{ArcError, Result};
pub use exporter::{export_to, export_vec, Exporter, ExporterFactory};
pub use plugin::{FormatPlugin, PluginInfo, Rating, RebuildEntry};
pub use registry::{Candidate, DetectState, Registry};
pub use resource::{ReadOutcome, Resource, ResourceBuilder};
pub use session::{write_archive, ArchiveSession, BatchReport};
