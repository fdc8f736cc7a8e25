//! Error types for the conversion engine.
//!
//! Three tiers:
//! - [`ConfigError`]: rejected before anything runs (bad options, cyclic
//!   step graph).
//! - [`StepError`]: one step's operation failed. Recorded in the step run
//!   and the conversion result, never raised past the conversion.
//! - [`ConvertError`]: engine-level failures surfaced to the caller.

use std::path::PathBuf;

use container_env_manager::ContainerError;
use modelconv_state::StateError;
use thiserror::Error;

use crate::config::TargetFormat;

/// Configuration rejected before execution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported option for {format}: {reason}")]
    UnsupportedOption { format: TargetFormat, reason: String },

    #[error("unknown configuration option: {0}")]
    UnknownOption(String),

    #[error("invalid {section} configuration: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },

    #[error("dependency cycle detected involving steps: {steps:?}")]
    DependencyCycle { steps: Vec<String> },

    #[error("step {step} requires unknown step {missing}")]
    UnknownDependency { step: String, missing: String },

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("cannot determine format of model at {0:?}; set model_format explicitly")]
    UnknownModelFormat(PathBuf),

    #[error("cannot read config file {path:?}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Failure of a single step's operation.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{program} exited with code {code}")]
    CommandFailed { program: String, code: i32 },

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("operation finished but produced no output at {0:?}")]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine-level failure of a conversion request.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("sandbox failure: {0}")]
    Sandbox(#[from] ContainerError),

    #[error("No successful conversion performed ({attempts} attempt(s))")]
    NoSuccessfulResult { attempts: usize },

    #[error("No such file or directory {0:?}")]
    ModelNotFound(PathBuf),

    #[error("results ledger error: {0}")]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for configuration handling.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result alias for engine-level operations.
pub type ConvertResult<T> = std::result::Result<T, ConvertError>;
