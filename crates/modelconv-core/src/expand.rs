//! Conversion request expansion.
//!
//! A [`ConversionSetConfig`] is a cross product of target formats,
//! precisions and format-specific options. Expansion turns it into an
//! ordered sequence of single-target [`ConversionSpec`]s. Target formats
//! are visited in declaration order and each one is handed to a sub-expander
//! that knows which option dimensions matter for it.
//!
//! The order is stable: the same request always yields the same specs in
//! the same order, which is what makes "first successful wins" selection
//! reproducible.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::config::{ConversionSetConfig, TargetFormat, TensorRtPrecision};
use crate::error::{ConfigError, ConfigResult};

/// ONNX opsets accepted for export.
pub const SUPPORTED_ONNX_OPSETS: RangeInclusive<u32> = 7..=18;

/// One fully resolved conversion target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversionSpec {
    /// `None` passes the source model through untouched.
    pub target_format: Option<TargetFormat>,
    pub target_precision: Option<TensorRtPrecision>,
    pub onnx_opset: Option<u32>,
    pub max_workspace_size: Option<u64>,
}

impl ConversionSpec {
    /// Spec that passes the source model through.
    pub fn passthrough() -> Self {
        Self {
            target_format: None,
            target_precision: None,
            onnx_opset: None,
            max_workspace_size: None,
        }
    }

    /// Spec for `format` with no options.
    pub fn for_format(format: TargetFormat) -> Self {
        Self {
            target_format: Some(format),
            ..Self::passthrough()
        }
    }
}

impl fmt::Display for ConversionSpec {
    /// Stable slug, e.g. `trt-fp16-opset13`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target_format {
            Some(format) => write!(f, "{format}")?,
            None => write!(f, "passthrough")?,
        }
        if let Some(precision) = self.target_precision {
            write!(f, "-{precision}")?;
        }
        if let Some(opset) = self.onnx_opset {
            write!(f, "-opset{opset}")?;
        }
        Ok(())
    }
}

impl ConversionSetConfig {
    /// Expand into a lazy, finite, order-stable sequence of specs.
    ///
    /// Every target format is validated before the iterator is returned, so
    /// an unsupported option fails the whole request instead of truncating
    /// the sequence.
    pub fn expand(&self) -> ConfigResult<impl Iterator<Item = ConversionSpec> + '_> {
        for format in &self.target_formats {
            sub_expander(*format).validate(self)?;
        }
        Ok(self
            .target_formats
            .iter()
            .flat_map(move |format| sub_expander(*format).specs(self)))
    }

    /// Request that reproduces exactly one spec.
    ///
    /// A pass-through spec yields an empty request.
    pub fn from_single_spec(spec: &ConversionSpec) -> Self {
        match spec.target_format {
            None => Self {
                target_formats: Vec::new(),
                target_precisions: Vec::new(),
                onnx_opsets: Vec::new(),
                max_workspace_size: spec.max_workspace_size,
            },
            Some(format) => Self {
                target_formats: vec![format],
                target_precisions: spec.target_precision.into_iter().collect(),
                onnx_opsets: spec.onnx_opset.into_iter().collect(),
                max_workspace_size: spec.max_workspace_size,
            },
        }
    }
}

/// Format-specific expansion rules.
trait FormatExpander {
    /// Reject options this format cannot honour.
    fn validate(&self, set: &ConversionSetConfig) -> ConfigResult<()>;

    /// Specs for this format, in order.
    fn specs<'a>(&self, set: &'a ConversionSetConfig)
        -> Box<dyn Iterator<Item = ConversionSpec> + 'a>;
}

fn sub_expander(format: TargetFormat) -> &'static dyn FormatExpander {
    match format {
        TargetFormat::TfSavedModel => &NoOptions(TargetFormat::TfSavedModel),
        TargetFormat::TorchScript => &NoOptions(TargetFormat::TorchScript),
        TargetFormat::Onnx => &OnnxExpander,
        TargetFormat::TensorRt => &TensorRtExpander,
        TargetFormat::TfTrt => &TfTrtExpander,
    }
}

fn unsupported(format: TargetFormat, reason: impl Into<String>) -> ConfigError {
    ConfigError::UnsupportedOption {
        format,
        reason: reason.into(),
    }
}

fn validate_opsets(format: TargetFormat, opsets: &[u32]) -> ConfigResult<()> {
    if opsets.is_empty() {
        return Err(unsupported(format, "at least one ONNX opset is required"));
    }
    if let Some(bad) = opsets.iter().find(|o| !SUPPORTED_ONNX_OPSETS.contains(o)) {
        return Err(unsupported(
            format,
            format!(
                "ONNX opset {bad} outside supported range {}..={}",
                SUPPORTED_ONNX_OPSETS.start(),
                SUPPORTED_ONNX_OPSETS.end()
            ),
        ));
    }
    Ok(())
}

fn validate_workspace_size(format: TargetFormat, size: Option<u64>) -> ConfigResult<()> {
    if size == Some(0) {
        return Err(unsupported(format, "max_workspace_size must be positive"));
    }
    Ok(())
}

/// Formats with no option dimensions: exactly one spec.
struct NoOptions(TargetFormat);

impl FormatExpander for NoOptions {
    fn validate(&self, _set: &ConversionSetConfig) -> ConfigResult<()> {
        Ok(())
    }

    fn specs<'a>(
        &self,
        _set: &'a ConversionSetConfig,
    ) -> Box<dyn Iterator<Item = ConversionSpec> + 'a> {
        Box::new(std::iter::once(ConversionSpec::for_format(self.0)))
    }
}

struct OnnxExpander;

impl FormatExpander for OnnxExpander {
    fn validate(&self, set: &ConversionSetConfig) -> ConfigResult<()> {
        validate_opsets(TargetFormat::Onnx, &set.onnx_opsets)
    }

    fn specs<'a>(
        &self,
        set: &'a ConversionSetConfig,
    ) -> Box<dyn Iterator<Item = ConversionSpec> + 'a> {
        Box::new(set.onnx_opsets.iter().map(|opset| ConversionSpec {
            onnx_opset: Some(*opset),
            ..ConversionSpec::for_format(TargetFormat::Onnx)
        }))
    }
}

/// TensorRT plans are built from an ONNX export: precision × opset.
struct TensorRtExpander;

impl FormatExpander for TensorRtExpander {
    fn validate(&self, set: &ConversionSetConfig) -> ConfigResult<()> {
        if set.target_precisions.is_empty() {
            return Err(unsupported(
                TargetFormat::TensorRt,
                "at least one target precision is required",
            ));
        }
        validate_opsets(TargetFormat::TensorRt, &set.onnx_opsets)?;
        validate_workspace_size(TargetFormat::TensorRt, set.max_workspace_size)
    }

    fn specs<'a>(
        &self,
        set: &'a ConversionSetConfig,
    ) -> Box<dyn Iterator<Item = ConversionSpec> + 'a> {
        Box::new(set.target_precisions.iter().flat_map(move |precision| {
            set.onnx_opsets.iter().map(move |opset| ConversionSpec {
                target_format: Some(TargetFormat::TensorRt),
                target_precision: Some(*precision),
                onnx_opset: Some(*opset),
                max_workspace_size: set.max_workspace_size,
            })
        }))
    }
}

/// TF-TRT optimizes a SavedModel in place: one spec per precision.
struct TfTrtExpander;

impl FormatExpander for TfTrtExpander {
    fn validate(&self, set: &ConversionSetConfig) -> ConfigResult<()> {
        if set.target_precisions.is_empty() {
            return Err(unsupported(
                TargetFormat::TfTrt,
                "at least one target precision is required",
            ));
        }
        if let Some(bad) = set
            .target_precisions
            .iter()
            .find(|p| matches!(p, TensorRtPrecision::Tf32 | TensorRtPrecision::Int8))
        {
            return Err(unsupported(
                TargetFormat::TfTrt,
                format!("precision {bad} is not supported"),
            ));
        }
        validate_workspace_size(TargetFormat::TfTrt, set.max_workspace_size)
    }

    fn specs<'a>(
        &self,
        set: &'a ConversionSetConfig,
    ) -> Box<dyn Iterator<Item = ConversionSpec> + 'a> {
        Box::new(set.target_precisions.iter().map(move |precision| ConversionSpec {
            target_format: Some(TargetFormat::TfTrt),
            target_precision: Some(*precision),
            onnx_opset: None,
            max_workspace_size: set.max_workspace_size,
        }))
    }
}
