//! End-to-end local conversions with injected step operations.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use container_env_manager::{
    BuildRequest, ContainerEngine, ContainerError, ContainerHandle, ContainerSpec, DeviceDiscovery,
};
use modelconv_core::{
    convert, CommandGraph, ConfigError, ConfigResult, ConversionPipeline, ConversionResult,
    ConversionSetConfig, ConversionSpec, ConvertConfigFile, ConvertError, ConvertRequest,
    EngineDeps, FnOperation, ModelConfig, PipelinePlan, PublishOutcome, RunOptions, SourceModel,
    Step, StepError, StepInput, StepKind, StepStatus, TargetFormat, TensorRtPrecision, Workspace,
    CONVERT_MODEL_OPERATION,
};

// ---------------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------------

/// One export step per spec, writing `<slug>/<artifact>`; formats listed in
/// `failing` fail instead.
struct ScriptedPipeline {
    failing: HashSet<TargetFormat>,
    invocations: Arc<AtomicUsize>,
}

impl ScriptedPipeline {
    fn new(failing: &[TargetFormat]) -> Self {
        Self {
            failing: failing.iter().copied().collect(),
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl ConversionPipeline for ScriptedPipeline {
    fn plan(&self, _source: &SourceModel, spec: &ConversionSpec) -> ConfigResult<PipelinePlan> {
        let format = spec.target_format.expect("planned specs have a target");
        let fail = self.failing.contains(&format);
        let counter = Arc::clone(&self.invocations);
        let name = format!("export_{}", spec.to_string().replace('-', "_"));
        let step = Step::new(
            name.clone(),
            StepKind::Export,
            PathBuf::from(spec.to_string()).join(format.artifact_name()),
            FnOperation::new("scripted-export", move |input: StepInput| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        return Err(StepError::Operation("exporter rejected model".to_string()));
                    }
                    std::fs::write(&input.output, b"artifact")?;
                    std::fs::write(input.output.with_extension("yaml"), b"io: meta")?;
                    Ok(())
                }
            }),
        );
        Ok(PipelinePlan {
            steps: vec![step],
            target_step: name,
        })
    }
}

/// Local runs must never reach the container engine.
struct NoEngine;

#[async_trait]
impl ContainerEngine for NoEngine {
    async fn image_exists(&self, _image: &str) -> container_env_manager::Result<bool> {
        panic!("container engine used in a local run")
    }

    async fn build_image(&self, _request: &BuildRequest) -> container_env_manager::Result<()> {
        panic!("container engine used in a local run")
    }

    async fn create(
        &self,
        _spec: &ContainerSpec,
        _command: &[String],
    ) -> container_env_manager::Result<ContainerHandle> {
        panic!("container engine used in a local run")
    }

    async fn start(&self, _container: &ContainerHandle) -> container_env_manager::Result<()> {
        panic!("container engine used in a local run")
    }

    async fn wait(&self, _container: &ContainerHandle) -> container_env_manager::Result<i32> {
        panic!("container engine used in a local run")
    }

    async fn remove(&self, _container: &ContainerHandle) -> container_env_manager::Result<()> {
        panic!("container engine used in a local run")
    }
}

struct NoGpus;

#[async_trait]
impl DeviceDiscovery for NoGpus {
    async fn get_gpus(&self, _requested: &[String]) -> container_env_manager::Result<Vec<String>> {
        Err(ContainerError::NoGpuAvailable("test".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn model_file(dir: &Path) -> PathBuf {
    let path = dir.join("models/resnet.pt");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"weights").unwrap();
    path
}

fn request(dir: &Path, formats: Vec<TargetFormat>) -> ConvertRequest {
    let mut config = ConvertConfigFile::new(ModelConfig {
        model_name: "resnet".to_string(),
        model_path: model_file(dir),
        model_format: None,
    });
    config.conversion_set.target_formats = formats;
    let mut request = ConvertRequest::new(config);
    request.workspace = dir.join("ws");
    request
}

async fn run(
    request: ConvertRequest,
    pipeline: &dyn ConversionPipeline,
) -> Result<modelconv_core::ConvertOutcome, ConvertError> {
    let deps = EngineDeps {
        pipeline,
        engine: &NoEngine,
        devices: &NoGpus,
        build_source: None,
    };
    convert(request, &deps).await
}

fn ledger(workspace: &Path) -> Vec<ConversionResult> {
    Workspace::new(workspace)
        .results()
        .load(CONVERT_MODEL_OPERATION)
        .unwrap()
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// Test: two formats, one with two precisions, expand to three specs in order
#[test]
fn test_request_expands_to_three_specs_in_order() {
    let set = ConversionSetConfig {
        target_formats: vec![TargetFormat::TensorRt, TargetFormat::TorchScript],
        target_precisions: vec![TensorRtPrecision::Fp16, TensorRtPrecision::Tf32],
        onnx_opsets: vec![13],
        max_workspace_size: None,
    };
    let specs: Vec<String> = set.expand().unwrap().map(|s| s.to_string()).collect();
    assert_eq!(
        specs,
        vec!["trt-fp16-opset13", "trt-tf32-opset13", "torchscript"]
    );
}

// ---------------------------------------------------------------------------
// Graph behaviour through the public API
// ---------------------------------------------------------------------------

fn counting_step(name: &str, output: &str, counter: &Arc<AtomicUsize>, fail: bool) -> Step {
    let counter = Arc::clone(counter);
    Step::new(
        name,
        StepKind::Convert,
        output,
        FnOperation::new(name, move |input: StepInput| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err(StepError::Operation("boom".to_string()));
                }
                std::fs::write(&input.output, b"out")?;
                Ok(())
            }
        }),
    )
}

/// Test: an existing output marks the step skipped without invoking it
#[tokio::test]
async fn test_existing_output_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("onnx")).unwrap();
    std::fs::write(dir.path().join("onnx/model.onnx"), b"cached").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let graph = CommandGraph::new(vec![
        counting_step("export", "onnx/model.onnx", &calls, false),
        counting_step("convert", "trt/model.plan", &calls, false).requires("export"),
    ])
    .unwrap();
    let runs = graph.run(dir.path(), &RunOptions::default()).await;

    assert_eq!(runs[0].status, StepStatus::Skipped);
    assert_eq!(runs[1].status, StepStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        std::fs::read(dir.path().join("onnx/model.onnx")).unwrap(),
        b"cached"
    );
}

/// Test: failure propagates as DEPENDENCY_FAILED to transitive dependents
#[tokio::test]
async fn test_failure_propagates_to_transitive_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = CommandGraph::new(vec![
        counting_step("export", "a/out", &calls, true),
        counting_step("convert", "b/out", &calls, false).requires("export"),
        counting_step("verify", "c/out", &calls, false).requires("convert"),
        counting_step("independent", "d/out", &calls, false),
    ])
    .unwrap();
    let runs = graph.run(dir.path(), &RunOptions::default()).await;

    let status = |name: &str| runs.iter().find(|r| r.step == name).unwrap().status;
    assert_eq!(status("export"), StepStatus::Failed);
    assert_eq!(status("convert"), StepStatus::DependencyFailed);
    assert_eq!(status("verify"), StepStatus::DependencyFailed);
    assert_eq!(status("independent"), StepStatus::Succeeded);
    // export and independent only
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test: a cyclic plan is rejected before any step executes
#[tokio::test]
async fn test_cyclic_plan_fails_before_execution() {
    struct Cyclic(Arc<AtomicUsize>);

    impl ConversionPipeline for Cyclic {
        fn plan(&self, _s: &SourceModel, _spec: &ConversionSpec) -> ConfigResult<PipelinePlan> {
            Ok(PipelinePlan {
                steps: vec![
                    counting_step("a", "a/out", &self.0, false).requires("b"),
                    counting_step("b", "b/out", &self.0, false).requires("a"),
                ],
                target_step: "b".to_string(),
            })
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = Cyclic(Arc::clone(&calls));
    let err = run(request(dir.path(), vec![TargetFormat::Onnx]), &pipeline)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConvertError::Config(ConfigError::DependencyCycle { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("ws/a/out").exists());
}

/// Test: a cycle in a later spec stops the request before earlier specs run
#[tokio::test]
async fn test_later_cyclic_spec_blocks_earlier_specs() {
    struct CyclicTorchScript(Arc<AtomicUsize>);

    impl ConversionPipeline for CyclicTorchScript {
        fn plan(&self, _s: &SourceModel, spec: &ConversionSpec) -> ConfigResult<PipelinePlan> {
            let steps = if spec.target_format == Some(TargetFormat::TorchScript) {
                vec![
                    counting_step("a", "ts/a", &self.0, false).requires("b"),
                    counting_step("b", "ts/b", &self.0, false).requires("a"),
                ]
            } else {
                vec![counting_step("b", "onnx/model.onnx", &self.0, false)]
            };
            Ok(PipelinePlan {
                steps,
                target_step: "b".to_string(),
            })
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = CyclicTorchScript(Arc::clone(&calls));
    let req = request(
        dir.path(),
        vec![TargetFormat::Onnx, TargetFormat::TorchScript],
    );
    let err = run(req, &pipeline).await.unwrap_err();

    assert!(matches!(
        err,
        ConvertError::Config(ConfigError::DependencyCycle { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("ws/onnx/model.onnx").exists());
    assert!(!dir.path().join("ws/convert.json").exists());
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Test: a failing spec does not abort its siblings and the first success is published
#[tokio::test]
async fn test_first_success_is_published_with_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ScriptedPipeline::new(&[TargetFormat::TfSavedModel]);
    let mut req = request(
        dir.path(),
        vec![
            TargetFormat::TfSavedModel,
            TargetFormat::TorchScript,
            TargetFormat::Onnx,
        ],
    );
    let out = dir.path().join("out/resnet.pt");
    req.output_path = Some(out.clone());

    let outcome = run(req, &pipeline).await.unwrap();

    assert_eq!(pipeline.invocations(), 3);
    let states: Vec<bool> = outcome.results.iter().map(|r| r.is_success()).collect();
    assert_eq!(states, vec![false, true, true]);

    match outcome.published {
        Some(PublishOutcome::Published { selection, .. }) => {
            assert_eq!(selection.chosen, 1);
            assert_eq!(selection.discarded, vec![2]);
        }
        other => panic!("expected a published artifact, got {other:?}"),
    }
    assert_eq!(std::fs::read(&out).unwrap(), b"artifact");
    assert_eq!(
        std::fs::read(dir.path().join("out/resnet.yaml")).unwrap(),
        b"io: meta"
    );

    let persisted = ledger(&dir.path().join("ws"));
    assert_eq!(persisted.len(), 3);
    assert!(dir.path().join("ws/convert.json").exists());
}

/// Test: when every attempt fails the engine reports it and keeps the ledger
#[tokio::test]
async fn test_all_failed_is_no_successful_result() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ScriptedPipeline::new(&[TargetFormat::Onnx, TargetFormat::TorchScript]);
    let mut req = request(dir.path(), vec![TargetFormat::Onnx, TargetFormat::TorchScript]);
    req.output_path = Some(dir.path().join("out/model.onnx"));

    let err = run(req, &pipeline).await.unwrap_err();

    assert!(matches!(err, ConvertError::NoSuccessfulResult { attempts: 2 }));
    assert!(!dir.path().join("out/model.onnx").exists());
    let persisted = ledger(&dir.path().join("ws"));
    assert_eq!(persisted.len(), 2);
    assert!(persisted.iter().all(|r| !r.is_success()));
}

/// Test: an empty format list passes the source model through
#[tokio::test]
async fn test_empty_request_passes_model_through() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ScriptedPipeline::new(&[]);
    let req = request(dir.path(), vec![]);

    let outcome = run(req, &pipeline).await.unwrap();

    assert_eq!(pipeline.invocations(), 0);
    assert_eq!(outcome.results.len(), 1);
    let output = outcome.results[0].output_model.as_ref().unwrap();
    assert!(output.path.ends_with("models/resnet.pt"));
}

/// Test: passing through onto the model's own path leaves the model intact
#[tokio::test]
async fn test_passthrough_onto_model_path_keeps_model() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path(), vec![]);
    req.output_path = Some(req.config.model.model_path.clone());

    let outcome = run(req, &ScriptedPipeline::new(&[])).await.unwrap();

    assert!(matches!(
        outcome.published,
        Some(PublishOutcome::Published { .. })
    ));
    assert_eq!(
        std::fs::read(dir.path().join("models/resnet.pt")).unwrap(),
        b"weights"
    );
}

/// Test: a missing model is reported before anything runs
#[tokio::test]
async fn test_missing_model_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path(), vec![TargetFormat::Onnx]);
    req.config.model.model_path = dir.path().join("nope.pt");

    let err = run(req, &ScriptedPipeline::new(&[])).await.unwrap_err();
    assert!(matches!(err, ConvertError::ModelNotFound(_)));
    assert!(!dir.path().join("ws").exists());
}

/// Test: unsupported options fail the request before the workspace is touched
#[tokio::test]
async fn test_unsupported_option_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path(), vec![TargetFormat::TfTrt]);
    req.config.conversion_set.target_precisions = vec![TensorRtPrecision::Int8];

    let pipeline = ScriptedPipeline::new(&[]);
    let err = run(req, &pipeline).await.unwrap_err();

    assert!(matches!(
        err,
        ConvertError::Config(ConfigError::UnsupportedOption { .. })
    ));
    assert_eq!(pipeline.invocations(), 0);
    assert!(!dir.path().join("ws").exists());
}

/// Test: rerunning a request reuses outputs from the previous run
#[tokio::test]
async fn test_rerun_skips_completed_steps() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ScriptedPipeline::new(&[]);

    run(request(dir.path(), vec![TargetFormat::TorchScript]), &pipeline)
        .await
        .unwrap();
    let outcome = run(request(dir.path(), vec![TargetFormat::TorchScript]), &pipeline)
        .await
        .unwrap();

    assert_eq!(pipeline.invocations(), 1);
    assert_eq!(outcome.results[0].step_runs[0].status, StepStatus::Skipped);
}
