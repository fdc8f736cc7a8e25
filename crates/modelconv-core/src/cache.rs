//! Step output caching.
//!
//! [`CachePolicy::PathExists`] treats an existing output path as a completed
//! step. [`CachePolicy::CompletionMarker`] additionally requires a hidden
//! `.<name>.done` file beside the output holding the SHA-256 of the output;
//! a truncated or partially written output then fails the check.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// How a step decides its output is already satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    PathExists,
    CompletionMarker,
}

/// Outcome of checking an existing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing at the output path.
    Missing,
    /// Output satisfies the policy.
    Satisfied,
    /// Output exists but cannot be trusted; it must be rebuilt.
    Stale,
}

impl CachePolicy {
    pub fn check(&self, output: &Path) -> CacheState {
        if !output.exists() {
            return CacheState::Missing;
        }
        match self {
            CachePolicy::PathExists => CacheState::Satisfied,
            CachePolicy::CompletionMarker => {
                let recorded = fs::read_to_string(marker_path(output)).ok();
                let actual = digest_path(output).ok();
                match (recorded, actual) {
                    (Some(r), Some(a)) if r.trim() == a => CacheState::Satisfied,
                    _ => CacheState::Stale,
                }
            }
        }
    }

    /// Record a freshly produced output.
    pub fn record(&self, output: &Path) -> io::Result<()> {
        if *self == CachePolicy::CompletionMarker {
            let digest = digest_path(output)?;
            fs::write(marker_path(output), digest)?;
        }
        Ok(())
    }
}

/// Completion marker for `output`: `<dir>/.<file name>.done`.
pub fn marker_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    output.with_file_name(format!(".{name}.done"))
}

/// Remove a stale output and its marker.
pub fn invalidate(output: &Path) -> io::Result<()> {
    debug!(output = ?output, "Removing stale step output");
    if output.is_dir() {
        fs::remove_dir_all(output)?;
    } else if output.exists() {
        fs::remove_file(output)?;
    }
    match fs::remove_file(marker_path(output)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// SHA-256 of a file, or of a directory tree (relative paths and contents,
/// visited in sorted order).
pub fn digest_path(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    if path.is_dir() {
        digest_dir(&mut hasher, path, path)?;
    } else {
        hasher.update(fs::read(path)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn digest_dir(hasher: &mut Sha256, root: &Path, dir: &Path) -> io::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();
    for entry in entries {
        let relative = entry.strip_prefix(root).unwrap_or(&entry);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if entry.is_dir() {
            digest_dir(hasher, root, &entry)?;
        } else {
            hasher.update(fs::read(&entry)?);
        }
    }
    Ok(())
}
