//! modelconv - model format conversion CLI
//!
//! ## Commands
//!
//! - `convert`: expand a conversion request, run every attempt and publish
//!   the first successful artifact
//! - `results`: show the results ledger of a workspace

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use container_env_manager::{DockerEngine, NvidiaSmi};
use modelconv_core::telemetry::init_tracing;
use modelconv_core::{
    convert, CachePolicy, ConversionResult, ConvertConfigFile, ConvertError, ConvertRequest,
    EngineDeps, ExternalToolPipeline, LaunchMode, PublishOutcome, SandboxContext, Workspace,
    CONVERT_MODEL_OPERATION, DEFAULT_CONTAINER_VERSION, DEFAULT_WORKSPACE,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "modelconv")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Convert trained models into deployable formats", long_about = None)]
struct Cli {
    /// Enable verbose output and tee logs into the workspace
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a model into every requested format and publish the first success
    Convert(ConvertArgs),

    /// Show the persisted conversion results of a workspace
    Results {
        /// Workspace to read
        #[arg(long, default_value = DEFAULT_WORKSPACE)]
        workspace_path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Config file to start from (flags and --set override its values)
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// Model name (default: file stem of --model-path)
    #[arg(long)]
    model_name: Option<String>,

    /// Path of the trained model
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Format of the model (guessed from the extension if omitted)
    #[arg(long)]
    model_format: Option<String>,

    /// Where to copy the selected artifact
    #[arg(short, long)]
    output_path: Option<PathBuf>,

    /// Run conversions in a converter container (docker) or on this host (local)
    #[arg(long, default_value = "docker")]
    launch_mode: LaunchMode,

    /// Rebuild the converter image even if it exists
    #[arg(long)]
    override_conversion_container: bool,

    /// Workspace for intermediate files, reproduction scripts and results
    #[arg(long, default_value = DEFAULT_WORKSPACE)]
    workspace_path: PathBuf,

    /// Remove the workspace before converting
    #[arg(long)]
    override_workspace: bool,

    /// Framework container release, e.g. 21.12
    #[arg(long, default_value = DEFAULT_CONTAINER_VERSION)]
    container_version: String,

    /// Base image for the converter container (derived from the model format if omitted)
    #[arg(long)]
    framework_docker_image: Option<String>,

    /// Devices for the container (default: all visible)
    #[arg(long, value_delimiter = ',')]
    gpus: Vec<String>,

    /// Formats to convert to
    #[arg(long, value_delimiter = ',')]
    target_formats: Vec<String>,

    /// TensorRT precisions
    #[arg(long, value_delimiter = ',')]
    target_precisions: Vec<String>,

    /// ONNX opsets
    #[arg(long, value_delimiter = ',')]
    onnx_opsets: Vec<u32>,

    /// TensorRT workspace size in bytes
    #[arg(long)]
    max_workspace_size: Option<u64>,

    /// Only trust step outputs that carry a matching completion marker
    #[arg(long)]
    completion_markers: bool,

    /// Any other config option; the value is parsed as JSON, falling back to a string
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    match cli.command {
        Commands::Convert(args) => cmd_convert(args, cli.verbose, cli.json, level).await,
        Commands::Results { workspace_path } => {
            init_tracing(cli.json, level, None).context("Failed to initialise logging")?;
            cmd_results(&workspace_path, cli.json)
        }
    }
}

async fn cmd_convert(args: ConvertArgs, verbose: bool, json: bool, level: Level) -> Result<()> {
    let sandbox = SandboxContext::from_env();
    let config = build_config(&args)?;

    // Wipe before the log file inside the workspace is opened.
    let workspace = Workspace::new(&args.workspace_path);
    workspace
        .clean_if_needed(args.override_workspace, &sandbox)
        .with_context(|| format!("Failed to prepare workspace {:?}", args.workspace_path))?;
    let log_file = verbose.then(|| workspace.log_path());
    init_tracing(json, level, log_file.as_deref()).context("Failed to initialise logging")?;

    info!(
        model = ?config.model.model_path,
        launch_mode = %args.launch_mode,
        workspace = ?args.workspace_path,
        "Starting conversion"
    );

    let pipeline = ExternalToolPipeline::new(config.toolchain.clone());
    let mut request = ConvertRequest::new(config);
    request.workspace = args.workspace_path;
    request.output_path = args.output_path;
    request.launch_mode = args.launch_mode;
    request.override_conversion_container = args.override_conversion_container;
    request.verbose = verbose;
    request.container_version = args.container_version;
    request.framework_docker_image = args.framework_docker_image;
    request.gpus = args.gpus;
    request.sandbox = sandbox;
    if args.completion_markers {
        request.cache_policy = CachePolicy::CompletionMarker;
    }

    let engine = DockerEngine::connect().context("Failed to set up the Docker client")?;
    let deps = EngineDeps {
        pipeline: &pipeline,
        engine: &engine,
        devices: &NvidiaSmi,
        build_source: None,
    };

    let outcome = match convert(request, &deps).await {
        Ok(outcome) => outcome,
        Err(ConvertError::NoSuccessfulResult { attempts }) => {
            anyhow::bail!(
                "None of the {} conversion attempts succeeded; step logs and reproduction scripts are in {:?}",
                attempts,
                workspace.path()
            );
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Conversion failed")),
    };

    print_results(&outcome.results);
    match outcome.published {
        Some(PublishOutcome::Published { destination, .. }) => {
            println!("Published {}", destination.display());
        }
        Some(PublishOutcome::NoUsableArtifact) => {
            warn!("No successful conversion produced an artifact to publish");
        }
        None => {}
    }
    Ok(())
}

/// Merge the config file, `--set` overrides and explicit flags, in that
/// order of precedence, into one validated config.
fn build_config(args: &ConvertArgs) -> Result<ConvertConfigFile> {
    let mut flat = match &args.config_path {
        Some(path) => ConvertConfigFile::load(path)?.to_flat_map()?,
        None => Map::new(),
    };

    for entry in &args.overrides {
        let (key, raw) = entry
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got {entry:?}"))?;
        flat.insert(key.trim().to_string(), parse_value(raw));
    }

    if let Some(name) = &args.model_name {
        flat.insert("model_name".to_string(), Value::from(name.as_str()));
    }
    if let Some(path) = &args.model_path {
        flat.insert(
            "model_path".to_string(),
            Value::from(path.to_string_lossy().as_ref()),
        );
    }
    if let Some(format) = &args.model_format {
        flat.insert("model_format".to_string(), Value::from(format.as_str()));
    }
    if !args.target_formats.is_empty() {
        flat.insert(
            "target_formats".to_string(),
            Value::from(args.target_formats.clone()),
        );
    }
    if !args.target_precisions.is_empty() {
        flat.insert(
            "target_precisions".to_string(),
            Value::from(args.target_precisions.clone()),
        );
    }
    if !args.onnx_opsets.is_empty() {
        flat.insert(
            "onnx_opsets".to_string(),
            Value::from(args.onnx_opsets.clone()),
        );
    }
    if let Some(size) = args.max_workspace_size {
        flat.insert("max_workspace_size".to_string(), Value::from(size));
    }

    if !flat.contains_key("model_name") {
        let stem = flat
            .get("model_path")
            .and_then(Value::as_str)
            .and_then(|p| Path::new(p).file_stem())
            .and_then(|s| s.to_str())
            .map(str::to_string);
        if let Some(stem) = stem {
            flat.insert("model_name".to_string(), Value::from(stem));
        }
    }

    ConvertConfigFile::from_flat_map(flat).context("Invalid conversion configuration")
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn cmd_results(workspace_path: &Path, json: bool) -> Result<()> {
    let store = Workspace::new(workspace_path).results();
    if !store.contains(CONVERT_MODEL_OPERATION)? {
        anyhow::bail!("No conversion results in {:?}", workspace_path);
    }
    let results: Vec<ConversionResult> = store
        .load(CONVERT_MODEL_OPERATION)
        .with_context(|| format!("Failed to read results from {:?}", workspace_path))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results);
    }
    Ok(())
}

fn print_results(results: &[ConversionResult]) {
    for result in results {
        let status = if result.is_success() { "OK" } else { "FAILED" };
        let detail = match (&result.output_model, &result.status.message) {
            (Some(model), _) => model.path.display().to_string(),
            (None, Some(message)) => message.clone(),
            (None, None) => String::new(),
        };
        println!("{:<7} {:<24} {}", status, result.spec.to_string(), detail);
    }
}
