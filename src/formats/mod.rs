//! Reference container formats.
//!
//! | Code | Layout | Capabilities |
//! |------|--------|--------------|
//! | `pak`  | header + data region + nested directory record | read, write, rename |
//! | `zblk` | header + per-entry block chains + fixed-width directory | read, write, replace |
//! | `otbl` | offset table only, names sniffed from content | read, write, scan |
//!
//! All integers are little-endian.

mod otbl;
mod pak;
mod zblk;

pub use otbl::OtblFormat;
pub use pak::PakFormat;
pub use zblk::ZblkFormat;

use crate::error::{ArcError, Result};

/// Split an entry name into directory components and a file name.
pub(crate) fn split_path(name: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts: Vec<&str> = name.split(['/', '\\']).filter(|p| !p.is_empty()).collect();
    let file = parts
        .pop()
        .ok_or_else(|| ArcError::mismatch(format!("entry name '{name}' has no file component")))?;
    Ok((parts, file))
}
