//! Workspace directory and sandbox context.

use std::io;
use std::path::{Path, PathBuf};

use modelconv_state::ResultsStore;
use tracing::{info, warn};

use crate::config::CONFIG_FILE_NAME;

/// Environment marker set for an invocation running inside a sandbox.
pub const RUN_BY_ENV: &str = "MODELCONV_RUN_BY";

/// Default workspace directory, relative to the current directory.
pub const DEFAULT_WORKSPACE: &str = "navigator_workspace";

/// Where this invocation runs relative to other orchestrators.
///
/// Built from the environment once, at the process boundary, and passed
/// down explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxContext {
    /// Running inside a sandbox started by a parent invocation. Forces
    /// local execution.
    pub already_sandboxed: bool,
    /// The workspace belongs to a parent invocation and must not be wiped.
    pub protect_workspace: bool,
}

impl SandboxContext {
    /// Top-level invocation on the host.
    pub fn host() -> Self {
        Self::default()
    }

    /// Invocation nested inside a sandbox.
    pub fn nested() -> Self {
        Self {
            already_sandboxed: true,
            protect_workspace: true,
        }
    }

    /// Context from the value of [`RUN_BY_ENV`].
    pub fn from_marker(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() && v != "0" => Self::nested(),
            _ => Self::host(),
        }
    }

    /// Read [`RUN_BY_ENV`] from the process environment.
    pub fn from_env() -> Self {
        Self::from_marker(std::env::var(RUN_BY_ENV).ok().as_deref())
    }
}

/// Filesystem root owning every artifact of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Declarative config file of the request.
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    /// Engine log file written in verbose mode.
    pub fn log_path(&self) -> PathBuf {
        self.root.join("modelconv.log")
    }

    /// Scratch directory for generated container recipes.
    pub fn docker_dir(&self) -> PathBuf {
        self.root.join(".docker")
    }

    pub fn results(&self) -> ResultsStore {
        ResultsStore::new(&self.root)
    }

    /// Wipe the workspace when `override_workspace` is set and no parent
    /// invocation owns it, then make sure it exists. Returns whether it was
    /// wiped.
    pub fn clean_if_needed(&self, override_workspace: bool, context: &SandboxContext) -> io::Result<bool> {
        let mut wiped = false;
        if override_workspace && self.root.exists() {
            if context.protect_workspace {
                warn!(workspace = ?self.root, "Workspace owned by parent invocation, not wiping");
            } else {
                info!(workspace = ?self.root, "Removing existing workspace");
                std::fs::remove_dir_all(&self.root)?;
                wiped = true;
            }
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(wiped)
    }
}
