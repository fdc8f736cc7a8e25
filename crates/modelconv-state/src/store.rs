use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{StateError, StateResult};

/// Directory (relative to the workspace root) holding ledger files.
pub const RESULTS_DIR: &str = "results";

/// Filesystem-backed results ledger.
///
/// Layout: `<workspace>/results/<name>.json`
#[derive(Debug, Clone)]
pub struct ResultsStore {
    results_dir: PathBuf,
}

impl ResultsStore {
    /// Create a store for the workspace rooted at `workspace`.
    ///
    /// Nothing is created on disk until the first `dump`.
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            results_dir: workspace.as_ref().join(RESULTS_DIR),
        }
    }

    /// Path of the ledger file for `name`.
    pub fn ledger_path(&self, name: &str) -> StateResult<PathBuf> {
        validate_name(name)?;
        Ok(self.results_dir.join(format!("{name}.json")))
    }

    /// Persist `results` as the complete list for `name`, replacing any
    /// previous list.
    pub fn dump<T: Serialize>(&self, name: &str, results: &[T]) -> StateResult<()> {
        let path = self.ledger_path(name)?;
        fs::create_dir_all(&self.results_dir)?;

        let content =
            serde_json::to_vec_pretty(results).map_err(|e| StateError::Serialization {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&self.results_dir)?;
        tmp.write_all(&content)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(ledger = %name, count = results.len(), "Results ledger written");
        Ok(())
    }

    /// Load the list persisted for `name`. Missing ledgers load as empty.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> StateResult<Vec<T>> {
        let path = self.ledger_path(name)?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(ledger = %name, "No results ledger yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(StateError::Io(e)),
        };

        serde_json::from_slice(&content).map_err(|e| StateError::Deserialization {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Whether a ledger has been written for `name`.
    pub fn contains(&self, name: &str) -> StateResult<bool> {
        Ok(self.ledger_path(name)?.exists())
    }
}

fn validate_name(name: &str) -> StateResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidName(name.to_string()))
    }
}
