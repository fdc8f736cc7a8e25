//! modelconv-core: model conversion engine
//!
//! Converts a trained model into other serialization formats and publishes
//! the first successful artifact:
//!
//! 1. A [`ConversionSetConfig`] is expanded into an ordered sequence of
//!    [`ConversionSpec`]s.
//! 2. Each spec is planned by a [`ConversionPipeline`] into [`Step`]s, which
//!    a [`CommandGraph`] runs in dependency order with path-based caching.
//!    Every step leaves a reproduction script behind
//!    ([`ExecutionContext`]).
//! 3. Results go to the workspace ledger (`results/convert_model.json`).
//!    In docker mode the whole request runs inside an ephemeral container
//!    ([`ContainerRunner`]) and the host reads the ledger back.
//! 4. The [`selector`] copies the winning artifact and its sidecar files to
//!    the requested output path.

pub mod cache;
pub mod config;
pub mod container_runner;
pub mod convert;
pub mod converter;
pub mod error;
pub mod execution;
pub mod expand;
pub mod graph;
pub mod obs;
pub mod pipeline;
pub mod selector;
pub mod step;
pub mod telemetry;
pub mod workspace;

pub use cache::CachePolicy;
pub use config::{
    ComparatorConfig, ConversionSetConfig, ConvertConfigFile, DatasetProfileConfig, Framework,
    ModelConfig, ModelSignatureConfig, TargetFormat, TensorRtPrecision, TensorSpec,
    ToolchainConfig, CONFIG_FILE_NAME, DEFAULT_CONTAINER_VERSION,
};
pub use container_runner::{BuildSource, ContainerRunner, SandboxRequest};
pub use convert::{convert, ConvertOutcome, ConvertRequest, EngineDeps, LaunchMode};
pub use converter::{
    ConversionResult, ConversionState, ConversionStatus, Converter, ModelHandle, PreparedConversion,
    SourceModel, CONVERT_MODEL_OPERATION,
};
pub use error::{ConfigError, ConfigResult, ConvertError, ConvertResult, StepError};
pub use execution::{CommandOutput, ExecutionContext, Invocation, Reproduction, StepResult};
pub use expand::ConversionSpec;
pub use graph::{CommandGraph, RunOptions, StepRun, StepStatus};
pub use pipeline::{ConversionPipeline, ExternalToolPipeline, PipelinePlan};
pub use selector::{PublishOutcome, Selection};
pub use step::{CommandOperation, FnOperation, Step, StepInput, StepKind, StepOperation};
pub use workspace::{SandboxContext, Workspace, DEFAULT_WORKSPACE, RUN_BY_ENV};

/// Engine version; release images install this exact version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
