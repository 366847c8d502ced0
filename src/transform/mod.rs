// src/transform/mod.rs

//! Builtin transforms: file copy, SQL script execution, database restore

mod copy;
mod restore;
mod sql;

pub use copy::CopyTransform;
pub use restore::RestoreDatabasesTransform;
pub use sql::SqlTransform;

use crate::error::Result;
use crate::hash::portable_name;
use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Enumerate files under `root` whose base name matches `pattern`
///
/// Returns `(relative_name, absolute_path)` pairs sorted by the
/// `/`-separated relative name, case-sensitively. Hash folds must never
/// depend on directory iteration order.
pub(crate) fn matched_files(root: &Path, pattern: &Regex) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();

    // A missing source directory enumerates as empty; the requirements
    // pass reports it before anything runs
    if !root.is_dir() {
        return Ok(out);
    }

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !pattern.is_match(&name) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        out.push((portable_name(&relative), entry.path().to_path_buf()));
    }

    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
