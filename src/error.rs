//! Error taxonomy shared by the cursor, exporters, plugins and the session.
//!
//! | Kind | Meaning | Recovery |
//! |------|---------|----------|
//! | `FormatMismatch` | a structural field failed validation | try the next plugin |
//! | `OutOfBounds` | offset/length arithmetic left the source | drop the entry, or abort the parse for header fields |
//! | `Io` | the underlying file failed | always fatal |
//! | `Codec` | a decompressor rejected its input | fatal for that resource only |
//!
//! Internally inconsistent but usable data is *not* an error: it is reported
//! through `tracing::warn!` and counted in [`crate::resource::ReadOutcome`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;

pub type Result<T> = std::result::Result<T, ArcError>;

#[derive(Error, Debug)]
pub enum ArcError {
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),
    #[error("Out of bounds: {what} at offset {offset} (+{len}) exceeds length {limit}")]
    OutOfBounds {
        what:   &'static str,
        offset: u64,
        len:    u64,
        limit:  u64,
    },
    #[error("Format not recognized")]
    NotRecognized,
    #[error("Operation not supported by format '{format}': {operation}")]
    Unsupported {
        format:    String,
        operation: &'static str,
    },
    #[error("Destination is being written by another task: {0}")]
    DestinationBusy(PathBuf),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ArcError {
    pub fn mismatch(msg: impl Into<String>) -> Self {
        ArcError::FormatMismatch(msg.into())
    }

    /// True for the kinds that only mean "these bytes are not what we hoped".
    /// A plugin's `read` failing this way lets the registry try another plugin.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ArcError::FormatMismatch(_) | ArcError::OutOfBounds { .. })
    }
}

/// Check that `offset + len` stays within `limit`, without overflowing.
pub fn check_span(what: &'static str, offset: u64, len: u64, limit: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(ArcError::OutOfBounds { what, offset, len, limit }),
    }
}
