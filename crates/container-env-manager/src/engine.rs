//! Container engine trait and the Docker Engine API backend.

use std::collections::HashMap;
use std::path::Path;
use std::pin::pin;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, DeviceRequest, HostConfig};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::container::{ContainerHandle, ContainerSpec};
use crate::error::ContainerError;
use crate::image::BuildRequest;
use crate::Result;

/// Name given to a recipe that lives outside its build context.
const EXTERNAL_RECIPE: &str = ".modelconv.Dockerfile";

/// Operations the sandbox runner needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether `image` is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build an image.
    async fn build_image(&self, request: &BuildRequest) -> Result<()>;

    /// Create (but do not start) a container that will run `command`.
    async fn create(&self, spec: &ContainerSpec, command: &[String]) -> Result<ContainerHandle>;

    /// Start a created container.
    async fn start(&self, container: &ContainerHandle) -> Result<()>;

    /// Forward the container's output until it exits and return its exit
    /// code.
    async fn wait(&self, container: &ContainerHandle) -> Result<i32>;

    /// Kill and remove the container. A container that is already gone is
    /// not an error.
    async fn remove(&self, container: &ContainerHandle) -> Result<()>;
}

/// Docker Engine API backend.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Client for the local daemon (`DOCKER_HOST` or the default socket).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::EngineUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn forward_logs(&self, container: &ContainerHandle) -> Result<()> {
        let options = LogsOptionsBuilder::default()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .build();
        let mut logs = pin!(self.docker.logs(&container.id, Some(options)));
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        while let Some(chunk) = logs.next().await {
            match chunk? {
                LogOutput::StdErr { message } => stderr.write_all(&message).await?,
                other => stdout.write_all(&other.into_bytes()).await?,
            }
        }
        stdout.flush().await?;
        Ok(())
    }

    async fn exit_code(&self, container: &ContainerHandle) -> Result<i32> {
        let mut waits = pin!(self
            .docker
            .wait_container(&container.id, None::<WaitContainerOptions>));
        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code as i32),
            // The API reports a non-zero exit as an error; it is a result here.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code as i32),
            Some(Err(e)) => Err(ContainerError::WaitFailed {
                container: container.short_id().to_string(),
                reason: e.to_string(),
            }),
            None => Err(ContainerError::WaitFailed {
                container: container.short_id().to_string(),
                reason: "engine closed the wait stream".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<()> {
        if !request.recipe.exists() {
            return Err(ContainerError::RecipeNotFound(
                request.recipe.display().to_string(),
            ));
        }
        info!(image = %request.image, recipe = ?request.recipe, "Building converter image");

        let owned = request.clone();
        let (archive, dockerfile) =
            tokio::task::spawn_blocking(move || context_archive(&owned.recipe, &owned.context))
                .await
                .map_err(|e| ContainerError::BuildFailed {
                    image: request.image.clone(),
                    reason: e.to_string(),
                })??;

        let build_args: HashMap<String, String> = request
            .build_args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let options = BuildImageOptionsBuilder::default()
            .dockerfile(&dockerfile)
            .t(&request.image)
            .buildargs(&build_args)
            .rm(true)
            .build();

        let build_failed = |reason: String| ContainerError::BuildFailed {
            image: request.image.clone(),
            reason,
        };
        let mut progress = pin!(self.docker.build_image(
            options,
            None,
            Some(bollard::body_full(archive.into()))
        ));
        // Build output goes straight to the terminal; it can take minutes.
        let mut stderr = tokio::io::stderr();
        while let Some(info) = progress.next().await {
            let info = info.map_err(|e| build_failed(e.to_string()))?;
            if let Some(detail) = info.error_detail {
                return Err(build_failed(detail.message.unwrap_or_default()));
            }
            if let Some(line) = info.stream {
                stderr.write_all(line.as_bytes()).await?;
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec, command: &[String]) -> Result<ContainerHandle> {
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        let response = self
            .docker
            .create_container(Some(options), create_body(spec, command))
            .await
            .map_err(|e| ContainerError::LaunchFailed {
                image: spec.image.clone(),
                reason: e.to_string(),
            })?;
        Ok(ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
            image: spec.image.clone(),
        })
    }

    async fn start(&self, container: &ContainerHandle) -> Result<()> {
        self.docker
            .start_container(&container.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| ContainerError::LaunchFailed {
                image: container.image.clone(),
                reason: e.to_string(),
            })
    }

    async fn wait(&self, container: &ContainerHandle) -> Result<i32> {
        let (logged, code) = tokio::join!(self.forward_logs(container), self.exit_code(container));
        if let Err(e) = logged {
            debug!(container = %container.short_id(), error = %e, "Log stream ended early");
        }
        code
    }

    async fn remove(&self, container: &ContainerHandle) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self
            .docker
            .remove_container(&container.id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            // 404: already gone, 409: removal already in progress.
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {
                debug!(container = %container.short_id(), "Container already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Engine request body for `spec` running `command`. Mounts keep their
/// host path; GPUs are requested by device id.
pub fn create_body(spec: &ContainerSpec, command: &[String]) -> ContainerCreateBody {
    let binds = spec
        .mounts
        .iter()
        .map(|mount| {
            let path = mount.to_string_lossy();
            format!("{path}:{path}:rw")
        })
        .collect();
    let device_requests = (!spec.gpus.is_empty()).then(|| {
        vec![DeviceRequest {
            device_ids: Some(spec.gpus.clone()),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]
    });

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(command.to_vec()),
        env: Some(
            spec.env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
        ),
        working_dir: spec
            .workdir
            .as_ref()
            .map(|w| w.to_string_lossy().into_owned()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            binds: Some(binds),
            device_requests,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Tar the build context. Returns the archive and the recipe's name inside
/// it; a recipe outside the context is added under [`EXTERNAL_RECIPE`].
fn context_archive(recipe: &Path, context: &Path) -> Result<(Vec<u8>, String)> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(false);
    archive.append_dir_all(".", context)?;
    let dockerfile = match recipe.strip_prefix(context) {
        Ok(relative) => relative.to_string_lossy().into_owned(),
        Err(_) => {
            archive.append_path_with_name(recipe, EXTERNAL_RECIPE)?;
            EXTERNAL_RECIPE.to_string()
        }
    };
    Ok((archive.into_inner()?, dockerfile))
}
