//! Side-effecting adapters. Each external system sits behind a trait so the
//! controller can be driven by scripted fakes in tests.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub mod config;
pub mod git;
pub mod harness;
pub mod hooks;
pub mod http;
pub mod lists;
pub mod process;
pub mod provision;
pub mod report;
pub mod state;
pub mod tracker;

/// Write `contents` to `path` via a sibling temp file and rename, so readers
/// never observe a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
