//! Typed configuration for a conversion request.
//!
//! One struct per concern: the source model, its signature, the conversion
//! set (the request to expand), comparator and dataset-profile settings
//! handed to verifiers, and the external toolchain. [`ConvertConfigFile`]
//! bundles them into the single declarative file that travels into a
//! sandbox.
//!
//! Loosely-typed input (CLI flags, `--set key=value`) enters only through
//! [`ConvertConfigFile::from_flat_map`], which routes every key to the
//! section that declares it and rejects anything else.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigError, ConfigResult};

/// Name of the declarative config file inside the workspace.
pub const CONFIG_FILE_NAME: &str = "convert.json";

/// Default container version used to pick a framework base image.
pub const DEFAULT_CONTAINER_VERSION: &str = "21.12";

// ---------------------------------------------------------------------------
// Formats, frameworks, precisions
// ---------------------------------------------------------------------------

/// Model serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetFormat {
    #[serde(rename = "tf-savedmodel")]
    TfSavedModel,
    #[serde(rename = "tf-trt")]
    TfTrt,
    #[serde(rename = "onnx")]
    Onnx,
    #[serde(rename = "trt")]
    TensorRt,
    #[serde(rename = "torchscript")]
    TorchScript,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 5] = [
        TargetFormat::TfSavedModel,
        TargetFormat::TfTrt,
        TargetFormat::Onnx,
        TargetFormat::TensorRt,
        TargetFormat::TorchScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFormat::TfSavedModel => "tf-savedmodel",
            TargetFormat::TfTrt => "tf-trt",
            TargetFormat::Onnx => "onnx",
            TargetFormat::TensorRt => "trt",
            TargetFormat::TorchScript => "torchscript",
        }
    }

    /// Framework whose container hosts conversions for this format.
    pub fn framework(&self) -> Framework {
        match self {
            TargetFormat::TfSavedModel | TargetFormat::TfTrt => Framework::TensorFlow2,
            TargetFormat::Onnx | TargetFormat::TensorRt | TargetFormat::TorchScript => {
                Framework::PyTorch
            }
        }
    }

    /// File (or directory) name of an artifact in this format.
    pub fn artifact_name(&self) -> &'static str {
        match self {
            TargetFormat::TfSavedModel | TargetFormat::TfTrt => "model.savedmodel",
            TargetFormat::Onnx => "model.onnx",
            TargetFormat::TensorRt => "model.plan",
            TargetFormat::TorchScript => "model.pt",
        }
    }

    /// Guess the format of an existing model from its path.
    pub fn guess_from_path(path: &Path) -> Option<TargetFormat> {
        match path.extension()?.to_str()? {
            "savedmodel" => Some(TargetFormat::TfSavedModel),
            "onnx" => Some(TargetFormat::Onnx),
            "plan" => Some(TargetFormat::TensorRt),
            "pt" | "ts" => Some(TargetFormat::TorchScript),
            _ => None,
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ConfigError::Invalid {
                section: "conversion_set",
                reason: format!("unknown target format {s:?}"),
            })
    }
}

/// Source framework of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    PyTorch,
    TensorFlow2,
}

impl Framework {
    /// Framework base image for a container release, e.g. `21.12`.
    pub fn container_image(&self, container_version: &str) -> String {
        match self {
            Framework::PyTorch => format!("nvcr.io/nvidia/pytorch:{container_version}-py3"),
            Framework::TensorFlow2 => {
                format!("nvcr.io/nvidia/tensorflow:{container_version}-tf2-py3")
            }
        }
    }
}

/// TensorRT numeric precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorRtPrecision {
    Fp32,
    Fp16,
    Tf32,
    Int8,
}

impl TensorRtPrecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TensorRtPrecision::Fp32 => "fp32",
            TensorRtPrecision::Fp16 => "fp16",
            TensorRtPrecision::Tf32 => "tf32",
            TensorRtPrecision::Int8 => "int8",
        }
    }
}

impl fmt::Display for TensorRtPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// A config section addressable through flat keys.
pub trait ConfigSection: Serialize + DeserializeOwned {
    /// Section name in the config file.
    const SECTION: &'static str;
    /// Flat keys owned by this section.
    const FIELDS: &'static [&'static str];
}

/// Source model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub model_name: String,
    pub model_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_format: Option<TargetFormat>,
}

impl ModelConfig {
    /// Explicit format, or one guessed from the path.
    pub fn format(&self) -> ConfigResult<TargetFormat> {
        self.model_format
            .or_else(|| TargetFormat::guess_from_path(&self.model_path))
            .ok_or_else(|| ConfigError::UnknownModelFormat(self.model_path.clone()))
    }
}

impl ConfigSection for ModelConfig {
    const SECTION: &'static str = "model";
    const FIELDS: &'static [&'static str] = &["model_name", "model_path", "model_format"];
}

/// Shape and dtype of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorSpec {
    pub shape: Vec<i64>,
    pub dtype: String,
}

/// Model inputs and outputs, when the model file does not carry them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSignatureConfig {
    #[serde(default)]
    pub inputs: BTreeMap<String, TensorSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, TensorSpec>,
}

impl ConfigSection for ModelSignatureConfig {
    const SECTION: &'static str = "signature";
    const FIELDS: &'static [&'static str] = &["inputs", "outputs"];
}

/// The conversion request: formats × precisions × format-specific options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversionSetConfig {
    #[serde(default = "default_target_formats")]
    pub target_formats: Vec<TargetFormat>,
    #[serde(default = "default_target_precisions")]
    pub target_precisions: Vec<TensorRtPrecision>,
    #[serde(default = "default_onnx_opsets")]
    pub onnx_opsets: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workspace_size: Option<u64>,
}

fn default_target_formats() -> Vec<TargetFormat> {
    vec![
        TargetFormat::TfSavedModel,
        TargetFormat::Onnx,
        TargetFormat::TensorRt,
        TargetFormat::TorchScript,
    ]
}

fn default_target_precisions() -> Vec<TensorRtPrecision> {
    vec![TensorRtPrecision::Fp16, TensorRtPrecision::Tf32]
}

fn default_onnx_opsets() -> Vec<u32> {
    vec![13]
}

impl Default for ConversionSetConfig {
    fn default() -> Self {
        Self {
            target_formats: default_target_formats(),
            target_precisions: default_target_precisions(),
            onnx_opsets: default_onnx_opsets(),
            max_workspace_size: None,
        }
    }
}

impl ConfigSection for ConversionSetConfig {
    const SECTION: &'static str = "conversion_set";
    const FIELDS: &'static [&'static str] = &[
        "target_formats",
        "target_precisions",
        "onnx_opsets",
        "max_workspace_size",
    ];
}

/// Tolerances handed to the verifier. Interpreted only by the verifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComparatorConfig {
    #[serde(default)]
    pub atol: BTreeMap<String, f64>,
    #[serde(default)]
    pub rtol: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<u32>,
}

impl ConfigSection for ComparatorConfig {
    const SECTION: &'static str = "comparator";
    const FIELDS: &'static [&'static str] = &["atol", "rtol", "max_batch_size"];
}

/// Input shape/value profile used when generating sample data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetProfileConfig {
    #[serde(default)]
    pub min_shapes: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    pub opt_shapes: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    pub max_shapes: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    pub value_ranges: BTreeMap<String, (f64, f64)>,
    #[serde(default)]
    pub dtypes: BTreeMap<String, String>,
}

impl ConfigSection for DatasetProfileConfig {
    const SECTION: &'static str = "dataset_profile";
    const FIELDS: &'static [&'static str] = &[
        "min_shapes",
        "opt_shapes",
        "max_shapes",
        "value_ranges",
        "dtypes",
    ];
}

/// External programs implementing export, conversion and verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolchainConfig {
    #[serde(default = "default_exporter")]
    pub exporter: String,
    #[serde(default = "default_converter")]
    pub converter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,
}

fn default_exporter() -> String {
    "modelconv-export".to_string()
}

fn default_converter() -> String {
    "modelconv-convert".to_string()
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            exporter: default_exporter(),
            converter: default_converter(),
            verifier: None,
        }
    }
}

impl ConfigSection for ToolchainConfig {
    const SECTION: &'static str = "toolchain";
    const FIELDS: &'static [&'static str] = &["exporter", "converter", "verifier"];
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

/// The declarative input of one conversion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvertConfigFile {
    pub model: ModelConfig,
    #[serde(default)]
    pub signature: ModelSignatureConfig,
    #[serde(default)]
    pub conversion_set: ConversionSetConfig,
    #[serde(default)]
    pub comparator: ComparatorConfig,
    #[serde(default)]
    pub dataset_profile: DatasetProfileConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
}

impl ConvertConfigFile {
    /// Config with defaults for everything but the model.
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            signature: ModelSignatureConfig::default(),
            conversion_set: ConversionSetConfig::default(),
            comparator: ComparatorConfig::default(),
            dataset_profile: DatasetProfileConfig::default(),
            toolchain: ToolchainConfig::default(),
        }
    }

    /// Build from flat `key → value` pairs.
    pub fn from_flat_map(map: Map<String, Value>) -> ConfigResult<Self> {
        let known = [
            ModelConfig::FIELDS,
            ModelSignatureConfig::FIELDS,
            ConversionSetConfig::FIELDS,
            ComparatorConfig::FIELDS,
            DatasetProfileConfig::FIELDS,
            ToolchainConfig::FIELDS,
        ];
        if let Some(unknown) = map
            .keys()
            .find(|k| !known.iter().any(|fields| fields.contains(&k.as_str())))
        {
            return Err(ConfigError::UnknownOption(unknown.clone()));
        }

        Ok(Self {
            model: section_from_flat(&map)?,
            signature: section_from_flat(&map)?,
            conversion_set: section_from_flat(&map)?,
            comparator: section_from_flat(&map)?,
            dataset_profile: section_from_flat(&map)?,
            toolchain: section_from_flat(&map)?,
        })
    }

    /// Flatten into `key → value` pairs; inverse of [`Self::from_flat_map`].
    pub fn to_flat_map(&self) -> ConfigResult<Map<String, Value>> {
        let mut flat = Map::new();
        flatten_into(&mut flat, &self.model)?;
        flatten_into(&mut flat, &self.signature)?;
        flatten_into(&mut flat, &self.conversion_set)?;
        flatten_into(&mut flat, &self.comparator)?;
        flatten_into(&mut flat, &self.dataset_profile)?;
        flatten_into(&mut flat, &self.toolchain)?;
        Ok(flat)
    }

    /// Read a config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&content).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write this config as pretty JSON.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let file_err = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let content = serde_json::to_string_pretty(self).map_err(|e| file_err(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| file_err(e.to_string()))
    }
}

fn section_from_flat<T: ConfigSection>(map: &Map<String, Value>) -> ConfigResult<T> {
    let section: Map<String, Value> = map
        .iter()
        .filter(|(k, _)| T::FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::from_value(Value::Object(section)).map_err(|e| ConfigError::Invalid {
        section: T::SECTION,
        reason: e.to_string(),
    })
}

fn flatten_into<T: ConfigSection>(flat: &mut Map<String, Value>, section: &T) -> ConfigResult<()> {
    match serde_json::to_value(section) {
        Ok(Value::Object(fields)) => {
            flat.extend(fields);
            Ok(())
        }
        Ok(_) => Err(ConfigError::Invalid {
            section: T::SECTION,
            reason: "section did not serialize to an object".to_string(),
        }),
        Err(e) => Err(ConfigError::Invalid {
            section: T::SECTION,
            reason: e.to_string(),
        }),
    }
}
