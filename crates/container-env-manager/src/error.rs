//! Error types for container-env-manager

use thiserror::Error;

/// Errors that can occur while building images or running sandboxes
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Container engine could not be reached
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Engine API call failed
    #[error("Container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    /// Image build failed
    #[error("Failed to build image {image}: {reason}")]
    BuildFailed { image: String, reason: String },

    /// Container could not be created or started
    #[error("Failed to launch container from {image}: {reason}")]
    LaunchFailed { image: String, reason: String },

    /// Lost track of a running container before it exited
    #[error("Failed waiting for container {container}: {reason}")]
    WaitFailed { container: String, reason: String },

    /// Build recipe missing
    #[error("Build recipe not found: {0}")]
    RecipeNotFound(String),

    /// No accelerator could be granted to the sandbox
    #[error("No GPU available: {0}")]
    NoGpuAvailable(String),

    /// Run was interrupted; the container has been torn down
    #[error("Interrupted while running in container {container}")]
    Interrupted { container: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
