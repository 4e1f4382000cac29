//! Whitelist/blacklist files and the run manifest.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::filter::parse_id_file;
use crate::io::write_atomic;

/// Read a one-id-per-line file. A missing file is an error.
pub fn read_id_file(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_id_file(&text))
}

/// Overwrite the run manifest with one id per line.
pub fn write_manifest(path: &Path, ids: &[String]) -> Result<()> {
    let mut contents = String::new();
    for id in ids {
        contents.push_str(id);
        contents.push('\n');
    }
    write_atomic(path, &contents)
}
