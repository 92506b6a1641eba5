use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Sibling-path conventions
// ---------------------------------------------------------------------------

/// Staging sibling for an atomic replacement: `state.json` → `state.json.tmp`.
pub fn staging_path(path: &Path) -> PathBuf {
    sibling(path, "tmp")
}

/// Where an incompatible file is moved aside: `state.json` → `state.json.backup`.
pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, "backup")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// File operations
// ---------------------------------------------------------------------------

/// Replace `path` atomically: stage the bytes at [`staging_path`], then
/// rename over the target. The rename is the commit point; a reader sees
/// the old content or the new, never a torn write.
pub fn replace_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = staging_path(path);
    std::fs::write(&staging, data)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

/// Seed `path` with `contents` unless it already exists; returns whether
/// the file was created. `create_new` makes the existence check race-free.
pub fn seed_file(path: &Path, contents: &str) -> Result<bool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            file.write_all(contents.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
