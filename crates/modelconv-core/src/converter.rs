//! Running one conversion spec and folding its steps into a result.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, Instrument};

use crate::config::{ModelConfig, TargetFormat};
use crate::error::ConfigResult;
use crate::expand::ConversionSpec;
use crate::graph::{CommandGraph, RunOptions, StepRun};
use crate::obs;
use crate::pipeline::ConversionPipeline;

/// Ledger name of the top-level conversion operation.
pub const CONVERT_MODEL_OPERATION: &str = "convert_model";

/// A model on disk and its format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub path: PathBuf,
    pub format: TargetFormat,
}

/// The model a request converts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceModel {
    pub name: String,
    pub handle: ModelHandle,
}

impl SourceModel {
    pub fn from_config(model: &ModelConfig) -> ConfigResult<Self> {
        Ok(Self {
            name: model.model_name.clone(),
            handle: ModelHandle {
                path: model.model_path.clone(),
                format: model.format()?,
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.handle.path
    }

    pub fn format(&self) -> TargetFormat {
        self.handle.format
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversionState {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStatus {
    pub state: ConversionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConversionStatus {
    pub fn succeeded() -> Self {
        Self {
            state: ConversionState::Succeeded,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: ConversionState::Failed,
            message: Some(message.into()),
        }
    }
}

/// Outcome of converting the source model for one spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub spec: ConversionSpec,
    pub status: ConversionStatus,
    pub source_model: ModelHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_model: Option<ModelHandle>,
    #[serde(default)]
    pub step_runs: Vec<StepRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_docker_image: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ConversionResult {
    pub fn is_success(&self) -> bool {
        self.status.state == ConversionState::Succeeded
    }
}

/// A spec whose step graph has been planned and checked.
pub struct PreparedConversion {
    spec: ConversionSpec,
    plan: Option<PreparedPlan>,
}

impl PreparedConversion {
    pub fn spec(&self) -> &ConversionSpec {
        &self.spec
    }
}

struct PreparedPlan {
    graph: CommandGraph,
    target_step: String,
    format: TargetFormat,
}

/// Runs specs against a workspace through a [`ConversionPipeline`].
pub struct Converter<'a> {
    pipeline: &'a dyn ConversionPipeline,
    workspace: &'a Path,
    options: RunOptions,
    framework_docker_image: Option<String>,
}

impl<'a> Converter<'a> {
    pub fn new(pipeline: &'a dyn ConversionPipeline, workspace: &'a Path, options: RunOptions) -> Self {
        Self {
            pipeline,
            workspace,
            options,
            framework_docker_image: None,
        }
    }

    /// Image recorded in every result produced by this converter.
    pub fn with_framework_docker_image(mut self, image: impl Into<String>) -> Self {
        self.framework_docker_image = Some(image.into());
        self
    }

    /// Convert `source` for `spec`.
    ///
    /// Step failures end up in the result; only an invalid plan (for
    /// example a cyclic step graph) is returned as an error.
    pub async fn convert(
        &self,
        source: &SourceModel,
        spec: &ConversionSpec,
    ) -> ConfigResult<ConversionResult> {
        let prepared = self.prepare(source, spec)?;
        Ok(self.execute(source, prepared).await)
    }

    /// Plan `spec` and validate its step graph without running anything.
    pub fn prepare(
        &self,
        source: &SourceModel,
        spec: &ConversionSpec,
    ) -> ConfigResult<PreparedConversion> {
        let Some(format) = spec.target_format else {
            return Ok(PreparedConversion {
                spec: spec.clone(),
                plan: None,
            });
        };
        let plan = self.pipeline.plan(source, spec)?;
        let graph = CommandGraph::new(plan.steps)?;
        Ok(PreparedConversion {
            spec: spec.clone(),
            plan: Some(PreparedPlan {
                graph,
                target_step: plan.target_step,
                format,
            }),
        })
    }

    /// Run a prepared conversion; failures are folded into the result.
    pub async fn execute(&self, source: &SourceModel, prepared: PreparedConversion) -> ConversionResult {
        let span = obs::conversion_span(&prepared.spec);
        self.execute_inner(source, prepared).instrument(span).await
    }

    async fn execute_inner(&self, source: &SourceModel, prepared: PreparedConversion) -> ConversionResult {
        let PreparedConversion { spec, plan } = prepared;
        let started_at = Utc::now();
        let start = Instant::now();
        obs::emit_conversion_started(&spec, &source.name);

        let Some(plan) = plan else {
            debug!("No target format, passing source model through");
            let result = self.result(
                &spec,
                source,
                started_at,
                ConversionStatus::succeeded(),
                Some(source.handle.clone()),
                Vec::new(),
            );
            obs::emit_conversion_finished(&spec, true, start.elapsed().as_millis() as u64);
            return result;
        };

        let runs = plan.graph.run(self.workspace, &self.options).await;

        let failed = runs.iter().find(|r| !r.status.is_satisfied());
        let (status, output_model) = match failed {
            Some(run) => (
                ConversionStatus::failed(format!(
                    "step {} {}: {}",
                    run.step,
                    run.status,
                    run.error.as_deref().unwrap_or("no details")
                )),
                None,
            ),
            None => {
                let output = runs
                    .iter()
                    .find(|r| r.step == plan.target_step)
                    .and_then(|r| r.output.clone());
                match output {
                    Some(path) => (
                        ConversionStatus::succeeded(),
                        Some(ModelHandle {
                            path,
                            format: plan.format,
                        }),
                    ),
                    None => (
                        ConversionStatus::failed(format!(
                            "target step {} produced no model",
                            plan.target_step
                        )),
                        None,
                    ),
                }
            }
        };

        let result = self.result(&spec, source, started_at, status, output_model, runs);
        obs::emit_conversion_finished(
            &spec,
            result.is_success(),
            start.elapsed().as_millis() as u64,
        );
        result
    }

    fn result(
        &self,
        spec: &ConversionSpec,
        source: &SourceModel,
        started_at: DateTime<Utc>,
        status: ConversionStatus,
        output_model: Option<ModelHandle>,
        step_runs: Vec<StepRun>,
    ) -> ConversionResult {
        ConversionResult {
            spec: spec.clone(),
            status,
            source_model: source.handle.clone(),
            output_model,
            step_runs,
            framework_docker_image: self.framework_docker_image.clone(),
            started_at,
        }
    }
}
