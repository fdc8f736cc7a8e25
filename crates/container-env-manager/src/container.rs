//! Ephemeral container lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::engine::ContainerEngine;
use crate::error::ContainerError;
use crate::Result;

/// Launch parameters for one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image to run.
    pub image: String,
    /// Container name.
    pub name: String,
    /// Working directory inside the container.
    pub workdir: Option<PathBuf>,
    /// Host paths mounted read-write at the same location.
    pub mounts: BTreeSet<PathBuf>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Device ids granted to the container.
    pub gpus: Vec<String>,
}

impl ContainerSpec {
    /// Spec for `image` with a fresh unique name.
    pub fn new(image: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            image: image.into(),
            name: format!("modelconv-{}", &id[..12]),
            workdir: None,
            mounts: BTreeSet::new(),
            env: BTreeMap::new(),
            gpus: Vec::new(),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Add mounts; identical paths collapse into one.
    pub fn with_mounts<I: IntoIterator<Item = PathBuf>>(mut self, mounts: I) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_gpu(mut self, device_id: impl Into<String>) -> Self {
        self.gpus.push(device_id.into());
        self
    }
}

/// A created container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub image: String,
}

impl ContainerHandle {
    /// Get short id (first 8 characters)
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}

/// Create a container from `spec` running `command`, wait for it, and
/// remove it.
///
/// The container is removed whether the command succeeds, fails, or the
/// process receives Ctrl-C while waiting. The command's exit code is
/// returned as-is; a non-zero code is not an error here.
pub async fn run_ephemeral(
    engine: &dyn ContainerEngine,
    spec: &ContainerSpec,
    command: &[String],
) -> Result<i32> {
    let container = engine.create(spec, command).await?;

    let outcome = match engine.start(&container).await {
        Ok(()) => {
            info!(container = %container.short_id(), image = %spec.image, "Sandbox container started");
            tokio::select! {
                code = engine.wait(&container) => code,
                _ = tokio::signal::ctrl_c() => Err(ContainerError::Interrupted {
                    container: container.short_id().to_string(),
                }),
            }
        }
        Err(e) => Err(e),
    };

    debug!(container = %container.short_id(), "Removing container");
    let removed = engine.remove(&container).await;

    match (outcome, removed) {
        (Ok(code), Ok(())) => Ok(code),
        (Ok(_), Err(remove_err)) => Err(remove_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(remove_err)) => {
            warn!(container = %container.short_id(), error = %remove_err, "Container removal failed");
            Err(err)
        }
    }
}
