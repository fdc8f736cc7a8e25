//! Turning a conversion spec into a step graph.

use std::path::{Path, PathBuf};

use crate::config::{TargetFormat, TensorRtPrecision, ToolchainConfig, CONFIG_FILE_NAME};
use crate::converter::SourceModel;
use crate::error::{ConfigError, ConfigResult};
use crate::expand::ConversionSpec;
use crate::step::{CommandOperation, Step, StepKind};

/// Steps for one spec and the step whose output is the converted model.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub steps: Vec<Step>,
    pub target_step: String,
}

/// Builds the steps that convert a source model for one spec.
///
/// Implementations receive their collaborators (exporters, converters)
/// at construction; plans must be deterministic so that output paths
/// shared between specs are cached.
pub trait ConversionPipeline: Send + Sync {
    fn plan(&self, source: &SourceModel, spec: &ConversionSpec) -> ConfigResult<PipelinePlan>;
}

/// Pipeline driving external exporter, converter and verifier programs.
///
/// Each program is called as `<program> <format> [options] --output <path>`
/// from the workspace directory, with `--config-path` pointing at the
/// request's config file for signature and profile metadata.
#[derive(Debug, Clone, Default)]
pub struct ExternalToolPipeline {
    toolchain: ToolchainConfig,
}

impl ExternalToolPipeline {
    pub fn new(toolchain: ToolchainConfig) -> Self {
        Self { toolchain }
    }

    fn export_step(&self, source: &SourceModel, format: TargetFormat, opset: Option<u32>) -> Step {
        let (name, dir) = match (format, opset) {
            (TargetFormat::Onnx, Some(opset)) => {
                (format!("export_onnx_opset{opset}"), format!("onnx_opset{opset}"))
            }
            (TargetFormat::TfSavedModel, _) => {
                ("export_savedmodel".to_string(), "tf_savedmodel".to_string())
            }
            _ => (format!("export_{}", dir_name(format)), dir_name(format)),
        };
        let output = output_path(&dir, format);

        let mut op = CommandOperation::new(&self.toolchain.exporter)
            .arg(format.as_str())
            .arg("--model-path")
            .arg(source.path().to_string_lossy())
            .arg("--model-format")
            .arg(source.format().as_str());
        if let Some(opset) = opset {
            op = op.arg("--opset").arg(opset.to_string());
        }
        op = with_common_args(op, &output);

        Step::new(name, StepKind::Export, output, op)
    }

    fn convert_step(
        &self,
        name: String,
        format: TargetFormat,
        dir: &str,
        input: &Step,
        precision: TensorRtPrecision,
        max_workspace_size: Option<u64>,
    ) -> Step {
        let output = output_path(dir, format);
        let mut op = CommandOperation::new(&self.toolchain.converter)
            .arg(format.as_str())
            .arg("--input")
            .arg(input.output.to_string_lossy())
            .arg("--precision")
            .arg(precision.as_str());
        if let Some(size) = max_workspace_size {
            op = op.arg("--max-workspace-size").arg(size.to_string());
        }
        op = with_common_args(op, &output);

        Step::new(name, StepKind::Convert, output, op).requires(input.name.clone())
    }

    fn verify_step(&self, verifier: &str, source: &SourceModel, target: &Step, format: TargetFormat) -> Step {
        let dir = target
            .output
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let output = PathBuf::from(&dir).join("verify.json");
        let op = CommandOperation::new(verifier)
            .arg(format.as_str())
            .arg("--model-path")
            .arg(source.path().to_string_lossy())
            .arg("--converted-path")
            .arg(target.output.to_string_lossy());
        let op = with_common_args(op, &output);

        Step::new(format!("verify_{dir}"), StepKind::Verify, output, op).requires(target.name.clone())
    }
}

impl ConversionPipeline for ExternalToolPipeline {
    fn plan(&self, source: &SourceModel, spec: &ConversionSpec) -> ConfigResult<PipelinePlan> {
        let format = spec.target_format.ok_or_else(|| ConfigError::Invalid {
            section: "conversion_set",
            reason: "a pass-through spec has no steps to plan".to_string(),
        })?;

        let mut steps = match format {
            TargetFormat::Onnx => vec![self.export_step(source, format, Some(required_opset(spec)?))],
            TargetFormat::TorchScript | TargetFormat::TfSavedModel => {
                vec![self.export_step(source, format, None)]
            }
            TargetFormat::TensorRt => {
                let opset = required_opset(spec)?;
                let precision = required_precision(spec)?;
                let export = self.export_step(source, TargetFormat::Onnx, Some(opset));
                let convert = self.convert_step(
                    format!("convert_trt_{precision}_opset{opset}"),
                    format,
                    &format!("trt_{precision}_opset{opset}"),
                    &export,
                    precision,
                    spec.max_workspace_size,
                );
                vec![export, convert]
            }
            TargetFormat::TfTrt => {
                let precision = required_precision(spec)?;
                let export = self.export_step(source, TargetFormat::TfSavedModel, None);
                let convert = self.convert_step(
                    format!("convert_tftrt_{precision}"),
                    format,
                    &format!("tftrt_{precision}"),
                    &export,
                    precision,
                    spec.max_workspace_size,
                );
                vec![export, convert]
            }
        };

        let target_step = steps
            .last()
            .map(|s| s.name.clone())
            .unwrap_or_default();

        if let Some(verifier) = &self.toolchain.verifier {
            if let Some(target) = steps.last() {
                let verify = self.verify_step(verifier, source, target, format);
                steps.push(verify);
            }
        }

        Ok(PipelinePlan { steps, target_step })
    }
}

fn dir_name(format: TargetFormat) -> String {
    format.as_str().replace('-', "_")
}

fn output_path(dir: &str, format: TargetFormat) -> PathBuf {
    PathBuf::from(dir).join(format.artifact_name())
}

fn with_common_args(op: CommandOperation, output: &Path) -> CommandOperation {
    op.arg("--config-path")
        .arg(CONFIG_FILE_NAME)
        .arg("--output")
        .arg(output.to_string_lossy())
}

fn required_opset(spec: &ConversionSpec) -> ConfigResult<u32> {
    spec.onnx_opset.ok_or_else(|| ConfigError::Invalid {
        section: "conversion_set",
        reason: format!("{spec} requires an ONNX opset"),
    })
}

fn required_precision(spec: &ConversionSpec) -> ConfigResult<TensorRtPrecision> {
    spec.target_precision.ok_or_else(|| ConfigError::Invalid {
        section: "conversion_set",
        reason: format!("{spec} requires a target precision"),
    })
}
