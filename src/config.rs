//! Engine settings, loadable from JSON.
//!
//! Every field has a default, so a config file only names what it changes:
//!
//! ```json
//! { "read_ahead": 64, "limits": { "max_entries": 2000000 } }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::cursor::DEFAULT_READ_AHEAD;
use crate::error::{ArcError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cursor read-ahead buffer, in bytes.
    pub read_ahead:            usize,
    /// Header bytes handed to `guess_extension`.
    pub sniff_window:          usize,
    /// On a failing `read()`, try the next positively-rated plugin.
    pub retry_on_read_failure: bool,
    pub limits:                ValidationLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_ahead:            DEFAULT_READ_AHEAD,
            sniff_window:          16,
            retry_on_read_failure: true,
            limits:                ValidationLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ArcError::Config(format!("{}: {e}", path.display())))
    }
}

/// Sanity bounds plugins apply to values read from untrusted headers.
///
/// A value outside these bounds means "this is not my format", so
/// violations are `FormatMismatch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_entries:             u64,
    pub max_name_length:         u64,
    pub max_directory_depth:     usize,
    pub max_blocks_per_resource: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_entries:             500_000,
            max_name_length:         1024,
            max_directory_depth:     64,
            max_blocks_per_resource: 1_000_000,
        }
    }
}

impl ValidationLimits {
    /// Entry counts must be non-zero and at most `max_entries`.
    pub fn check_count(&self, what: &str, count: u64) -> Result<()> {
        if count == 0 || count > self.max_entries {
            return Err(ArcError::mismatch(format!(
                "{what} count {count} outside 1..={}",
                self.max_entries
            )));
        }
        Ok(())
    }

    pub fn check_range(&self, what: &str, value: u64, min: u64, max: u64) -> Result<()> {
        if value < min || value > max {
            return Err(ArcError::mismatch(format!("{what} {value} outside {min}..={max}")));
        }
        Ok(())
    }

    pub fn check_name_length(&self, len: u64) -> Result<()> {
        self.check_range("name length", len, 0, self.max_name_length)
    }
}
