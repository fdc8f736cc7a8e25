//! Running a whole conversion request inside an ephemeral container.
//!
//! The host writes the request to the workspace, makes sure a converter
//! image exists for the framework base image, starts a container with the
//! workspace, the model directory and the current directory mounted, and
//! runs `modelconv convert --launch-mode local` inside it. Results come
//! back through the shared workspace ledger, not the exit code.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use container_env_manager::{
    converter_image_tag, run_ephemeral, BuildRequest, ContainerEngine, ContainerSpec,
    DeviceDiscovery,
};
use tracing::{info, warn};

use crate::cache::CachePolicy;
use crate::config::ConvertConfigFile;
use crate::converter::{ConversionResult, CONVERT_MODEL_OPERATION};
use crate::error::ConvertResult;
use crate::obs;
use crate::workspace::{SandboxContext, Workspace, RUN_BY_ENV};

/// Recipe used when the converter is installed from a release.
const REMOTE_RECIPE: &str = include_str!("../docker/Dockerfile.remote");

/// Recipe path inside a source checkout.
const LOCAL_RECIPE: &str = "crates/modelconv-core/docker/Dockerfile.local";

/// Binary invoked inside the container.
const ENTRY_POINT: &str = "modelconv";

/// Where the converter image gets `modelconv` from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSource {
    /// Build from a source checkout rooted at `root`.
    Checkout { root: PathBuf },
    /// Install the matching release from `install_url`.
    Release { install_url: String },
}

impl BuildSource {
    /// Checkout when this binary was built from a tree that still exists,
    /// otherwise the release archive for this version.
    pub fn detect() -> Self {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        match root.join(LOCAL_RECIPE).canonicalize() {
            Ok(_) => Self::Checkout {
                root: root.canonicalize().unwrap_or(root),
            },
            Err(_) => Self::release(),
        }
    }

    /// Release archive of this exact version.
    pub fn release() -> Self {
        Self::Release {
            install_url: format!(
                "{}/archive/refs/tags/v{}.tar.gz",
                env!("CARGO_PKG_REPOSITORY"),
                crate::VERSION
            ),
        }
    }

    /// Build request for `image` on top of `base_image`.
    pub fn build_request(
        &self,
        workspace: &Workspace,
        base_image: &str,
        image: &str,
    ) -> std::io::Result<BuildRequest> {
        let mut request = match self {
            BuildSource::Checkout { root } => BuildRequest::new(root.join(LOCAL_RECIPE), root, image),
            BuildSource::Release { install_url } => {
                let context = workspace.docker_dir();
                std::fs::create_dir_all(&context)?;
                let recipe = context.join("Dockerfile");
                std::fs::write(&recipe, REMOTE_RECIPE)?;
                BuildRequest::new(recipe, context, image).with_build_arg("INSTALL_URL", install_url)
            }
        };
        request = request.with_build_arg("FROM_IMAGE_NAME", base_image);
        Ok(request)
    }
}

/// One sandboxed conversion request.
#[derive(Debug, Clone)]
pub struct SandboxRequest<'a> {
    pub config: &'a ConvertConfigFile,
    pub workspace: &'a Workspace,
    pub framework_docker_image: &'a str,
    pub override_conversion_container: bool,
    pub override_workspace: bool,
    pub verbose: bool,
    pub cache_policy: CachePolicy,
    pub gpus: &'a [String],
    pub context: SandboxContext,
    /// Working directory of the host invocation, mirrored in the container.
    pub cwd: PathBuf,
}

/// Delegates a request to a container and collects its results.
pub struct ContainerRunner<'a> {
    engine: &'a dyn ContainerEngine,
    devices: &'a dyn DeviceDiscovery,
    build_source: BuildSource,
}

impl<'a> ContainerRunner<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, devices: &'a dyn DeviceDiscovery) -> Self {
        Self {
            engine,
            devices,
            build_source: BuildSource::detect(),
        }
    }

    pub fn with_build_source(mut self, build_source: BuildSource) -> Self {
        self.build_source = build_source;
        self
    }

    /// Run `request` in a fresh container and return the patched ledger.
    ///
    /// Image build and container launch failures are fatal. A non-zero exit
    /// of the in-container command is only logged.
    pub async fn run(&self, request: &SandboxRequest<'_>) -> ConvertResult<Vec<ConversionResult>> {
        let workspace = request.workspace;
        workspace.clean_if_needed(request.override_workspace, &request.context)?;
        request.config.save(&workspace.config_path())?;

        let image = self.ensure_image(request).await?;

        let mounts = mount_points(workspace.path(), &request.config.model.model_path, &request.cwd)?;
        let gpus = self.devices.get_gpus(request.gpus).await?;
        let mut spec = ContainerSpec::new(&image)
            .with_workdir(&request.cwd)
            .with_mounts(mounts)
            .with_env(RUN_BY_ENV, "1");
        if let Some(gpu) = gpus.first() {
            spec = spec.with_gpu(gpu);
        }

        let command = sandbox_command(request)?;
        obs::emit_sandbox_started(&image, &spec.name, workspace.path());
        let code = run_ephemeral(self.engine, &spec, &command).await?;
        obs::emit_sandbox_finished(&spec.name, Some(code));
        if code != 0 {
            warn!(exit_code = code, "Conversion inside the container exited with an error");
        }

        let store = workspace.results();
        let mut results: Vec<ConversionResult> = store.load(CONVERT_MODEL_OPERATION)?;
        for result in &mut results {
            result.framework_docker_image = Some(request.framework_docker_image.to_string());
        }
        store.dump(CONVERT_MODEL_OPERATION, &results)?;
        Ok(results)
    }

    async fn ensure_image(&self, request: &SandboxRequest<'_>) -> ConvertResult<String> {
        let base = request.framework_docker_image;
        let image = converter_image_tag(base);
        if !request.override_conversion_container && self.engine.image_exists(&image).await? {
            info!(image = %image, "Using existing converter image");
            return Ok(image);
        }

        info!(image = %image, base = %base, "Building converter image");
        let build = self
            .build_source
            .build_request(request.workspace, base, &image)?;
        self.engine.build_image(&build).await?;
        Ok(image)
    }
}

/// Host paths visible in the container: workspace, model directory and
/// current directory, resolved and deduplicated.
pub fn mount_points(workspace: &Path, model_path: &Path, cwd: &Path) -> std::io::Result<BTreeSet<PathBuf>> {
    let model_dir = model_path.parent().unwrap_or(model_path);
    [workspace, model_dir, cwd]
        .into_iter()
        .map(|p| p.canonicalize())
        .collect()
}

fn sandbox_command(request: &SandboxRequest<'_>) -> std::io::Result<Vec<String>> {
    let workspace = request.workspace.path().canonicalize()?;
    let config = workspace.join(crate::config::CONFIG_FILE_NAME);

    let mut command = vec![
        ENTRY_POINT.to_string(),
        "convert".to_string(),
        "--config-path".to_string(),
        config.to_string_lossy().to_string(),
        "--launch-mode".to_string(),
        "local".to_string(),
    ];
    if request.verbose {
        command.push("-v".to_string());
    }
    command.push("--workspace-path".to_string());
    command.push(workspace.to_string_lossy().to_string());
    if request.cache_policy == CachePolicy::CompletionMarker {
        command.push("--completion-markers".to_string());
    }
    if request.override_workspace {
        command.push("--override-workspace".to_string());
    }
    Ok(command)
}
