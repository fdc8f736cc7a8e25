//! Engine entry point: expand, run locally or in a container, publish.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use container_env_manager::{ContainerEngine, DeviceDiscovery};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::CachePolicy;
use crate::config::{ConvertConfigFile, DEFAULT_CONTAINER_VERSION};
use crate::container_runner::{BuildSource, ContainerRunner, SandboxRequest};
use crate::converter::{ConversionResult, Converter, SourceModel, CONVERT_MODEL_OPERATION};
use crate::error::{ConfigError, ConfigResult, ConvertError, ConvertResult};
use crate::expand::ConversionSpec;
use crate::graph::RunOptions;
use crate::pipeline::ConversionPipeline;
use crate::selector::{self, PublishOutcome};
use crate::workspace::{SandboxContext, Workspace, DEFAULT_WORKSPACE};

/// Where conversions run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Local,
    Docker,
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LaunchMode::Local => "local",
            LaunchMode::Docker => "docker",
        })
    }
}

impl FromStr for LaunchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(LaunchMode::Local),
            "docker" | "sandboxed" => Ok(LaunchMode::Docker),
            other => Err(ConfigError::Invalid {
                section: "launch",
                reason: format!("unknown launch mode {other:?}"),
            }),
        }
    }
}

/// One conversion request and how to run it.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub config: ConvertConfigFile,
    pub workspace: PathBuf,
    pub output_path: Option<PathBuf>,
    pub launch_mode: LaunchMode,
    pub override_workspace: bool,
    pub override_conversion_container: bool,
    pub verbose: bool,
    pub container_version: String,
    pub framework_docker_image: Option<String>,
    pub gpus: Vec<String>,
    pub cache_policy: CachePolicy,
    pub sandbox: SandboxContext,
}

impl ConvertRequest {
    /// Local request with default settings.
    pub fn new(config: ConvertConfigFile) -> Self {
        Self {
            config,
            workspace: PathBuf::from(DEFAULT_WORKSPACE),
            output_path: None,
            launch_mode: LaunchMode::Local,
            override_workspace: false,
            override_conversion_container: false,
            verbose: false,
            container_version: DEFAULT_CONTAINER_VERSION.to_string(),
            framework_docker_image: None,
            gpus: Vec::new(),
            cache_policy: CachePolicy::default(),
            sandbox: SandboxContext::host(),
        }
    }
}

/// Collaborators the engine runs against.
pub struct EngineDeps<'a> {
    pub pipeline: &'a dyn ConversionPipeline,
    pub engine: &'a dyn ContainerEngine,
    pub devices: &'a dyn DeviceDiscovery,
    /// Overrides [`BuildSource::detect`].
    pub build_source: Option<BuildSource>,
}

/// Results of a request that produced at least one usable conversion.
#[derive(Debug, Clone)]
pub struct ConvertOutcome {
    pub results: Vec<ConversionResult>,
    /// Set when an output path was requested.
    pub published: Option<PublishOutcome>,
}

/// Run a conversion request end to end.
///
/// Fails with [`ConvertError::NoSuccessfulResult`] when every attempt
/// failed; the results are persisted to the workspace ledger either way.
pub async fn convert(mut request: ConvertRequest, deps: &EngineDeps<'_>) -> ConvertResult<ConvertOutcome> {
    let model_path = &request.config.model.model_path;
    if !model_path.exists() {
        return Err(ConvertError::ModelNotFound(model_path.clone()));
    }
    let canonical = model_path.canonicalize()?;
    request.config.model.model_path = canonical;

    let source = SourceModel::from_config(&request.config.model)?;
    let framework_docker_image = request.framework_docker_image.clone().unwrap_or_else(|| {
        source
            .format()
            .framework()
            .container_image(&request.container_version)
    });

    // Rejects unsupported options before anything touches the workspace.
    let mut specs: Vec<ConversionSpec> = request.config.conversion_set.expand()?.collect();
    if specs.is_empty() {
        specs.push(ConversionSpec::passthrough());
    }

    let mut launch_mode = request.launch_mode;
    if request.sandbox.already_sandboxed && launch_mode == LaunchMode::Docker {
        warn!("Already running inside a sandbox, converting locally");
        launch_mode = LaunchMode::Local;
    }

    let workspace = Workspace::new(&request.workspace);
    let results = match launch_mode {
        LaunchMode::Local => {
            if request.verbose {
                info!(
                    model = ?request.config.model,
                    conversion_set = ?request.config.conversion_set,
                    workspace = ?request.workspace,
                    output_path = ?request.output_path,
                    override_workspace = request.override_workspace,
                    cache_policy = ?request.cache_policy,
                    framework_docker_image = %framework_docker_image,
                    "Converting locally"
                );
            }
            run_local(&request, &workspace, &source, &specs, deps.pipeline).await?
        }
        LaunchMode::Docker => {
            let cwd = std::env::current_dir()?;
            let mut runner = ContainerRunner::new(deps.engine, deps.devices);
            if let Some(build_source) = &deps.build_source {
                runner = runner.with_build_source(build_source.clone());
            }
            runner
                .run(&SandboxRequest {
                    config: &request.config,
                    workspace: &workspace,
                    framework_docker_image: &framework_docker_image,
                    override_conversion_container: request.override_conversion_container,
                    override_workspace: request.override_workspace,
                    verbose: request.verbose,
                    cache_policy: request.cache_policy,
                    gpus: &request.gpus,
                    context: request.sandbox,
                    cwd,
                })
                .await?
        }
    };

    if !results.iter().any(ConversionResult::is_success) {
        return Err(ConvertError::NoSuccessfulResult {
            attempts: results.len(),
        });
    }

    let published = match &request.output_path {
        Some(output) => Some(selector::publish(&results, output)?),
        None => None,
    };
    Ok(ConvertOutcome { results, published })
}

async fn run_local(
    request: &ConvertRequest,
    workspace: &Workspace,
    source: &SourceModel,
    specs: &[ConversionSpec],
    pipeline: &dyn ConversionPipeline,
) -> ConvertResult<Vec<ConversionResult>> {
    let options = RunOptions {
        verbose: request.verbose,
        cache_policy: request.cache_policy,
    };
    let converter = Converter::new(pipeline, workspace.path(), options);

    // Every graph is validated before the workspace is touched.
    let prepared = specs
        .iter()
        .map(|spec| converter.prepare(source, spec))
        .collect::<ConfigResult<Vec<_>>>()?;

    workspace.clean_if_needed(request.override_workspace, &request.sandbox)?;
    request.config.save(&workspace.config_path())?;

    let mut results = Vec::with_capacity(prepared.len());
    for conversion in prepared {
        results.push(converter.execute(source, conversion).await);
    }

    workspace.results().dump(CONVERT_MODEL_OPERATION, &results)?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_mode_parsing() {
        assert_eq!("local".parse::<LaunchMode>().unwrap(), LaunchMode::Local);
        assert_eq!("docker".parse::<LaunchMode>().unwrap(), LaunchMode::Docker);
        assert_eq!("sandboxed".parse::<LaunchMode>().unwrap(), LaunchMode::Docker);
        assert!("remote".parse::<LaunchMode>().is_err());
    }
}
