//! Integration tests for the ephemeral container lifecycle with a fake engine.

use async_trait::async_trait;
use container_env_manager::{
    run_ephemeral, BuildRequest, ContainerEngine, ContainerError, ContainerHandle, ContainerSpec,
};
use std::sync::Mutex;

/// Records every engine call; wait behaviour is configurable.
#[derive(Default)]
struct RecordingEngine {
    calls: Mutex<Vec<String>>,
    exit_code: Option<i32>,
    fail_start: bool,
    fail_remove: bool,
}

impl RecordingEngine {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl ContainerEngine for RecordingEngine {
    async fn image_exists(&self, _image: &str) -> container_env_manager::Result<bool> {
        Ok(true)
    }

    async fn build_image(&self, _request: &BuildRequest) -> container_env_manager::Result<()> {
        Ok(())
    }

    async fn create(
        &self,
        spec: &ContainerSpec,
        command: &[String],
    ) -> container_env_manager::Result<ContainerHandle> {
        self.record(format!("create {}", command.join(" ")));
        Ok(ContainerHandle {
            id: "c0ffee0123456789".to_string(),
            name: spec.name.clone(),
            image: spec.image.clone(),
        })
    }

    async fn start(&self, container: &ContainerHandle) -> container_env_manager::Result<()> {
        self.record("start");
        if self.fail_start {
            return Err(ContainerError::LaunchFailed {
                image: container.image.clone(),
                reason: "no runtime".to_string(),
            });
        }
        Ok(())
    }

    async fn wait(&self, container: &ContainerHandle) -> container_env_manager::Result<i32> {
        self.record("wait");
        self.exit_code.ok_or_else(|| ContainerError::WaitFailed {
            container: container.short_id().to_string(),
            reason: "connection reset".to_string(),
        })
    }

    async fn remove(&self, _container: &ContainerHandle) -> container_env_manager::Result<()> {
        self.record("remove");
        if self.fail_remove {
            return Err(ContainerError::EngineUnavailable("daemon went away".to_string()));
        }
        Ok(())
    }
}

fn command() -> Vec<String> {
    vec!["bash".to_string(), "-c".to_string(), "true".to_string()]
}

/// Test: successful run returns its exit code and the container is removed
#[tokio::test]
async fn test_container_removed_after_success() {
    let engine = RecordingEngine {
        exit_code: Some(0),
        ..Default::default()
    };
    let code = run_ephemeral(&engine, &ContainerSpec::new("img:1"), &command())
        .await
        .expect("run failed");

    assert_eq!(code, 0);
    assert_eq!(
        engine.calls(),
        vec!["create bash -c true", "start", "wait", "remove"]
    );
}

/// Test: non-zero exit is reported, not raised
#[tokio::test]
async fn test_nonzero_exit_is_not_an_error() {
    let engine = RecordingEngine {
        exit_code: Some(3),
        ..Default::default()
    };
    let code = run_ephemeral(&engine, &ContainerSpec::new("img:1"), &command())
        .await
        .expect("run failed");

    assert_eq!(code, 3);
    assert_eq!(engine.calls().last().unwrap(), "remove");
}

/// Test: wait failure propagates and the container is still removed
#[tokio::test]
async fn test_container_removed_after_wait_failure() {
    let engine = RecordingEngine::default();
    let result = run_ephemeral(&engine, &ContainerSpec::new("img:1"), &command()).await;

    assert!(matches!(result, Err(ContainerError::WaitFailed { .. })));
    assert_eq!(engine.calls().last().unwrap(), "remove");
}

/// Test: start failure is fatal, nothing is waited on, the container is removed
#[tokio::test]
async fn test_launch_failure_propagates() {
    let engine = RecordingEngine {
        fail_start: true,
        ..Default::default()
    };
    let result = run_ephemeral(&engine, &ContainerSpec::new("img:1"), &command()).await;

    assert!(matches!(result, Err(ContainerError::LaunchFailed { .. })));
    assert_eq!(engine.calls(), vec!["create bash -c true", "start", "remove"]);
}

/// Test: a removal failure after a clean run is reported
#[tokio::test]
async fn test_remove_failure_after_success_is_an_error() {
    let engine = RecordingEngine {
        exit_code: Some(0),
        fail_remove: true,
        ..Default::default()
    };
    let result = run_ephemeral(&engine, &ContainerSpec::new("img:1"), &command()).await;
    assert!(matches!(result, Err(ContainerError::EngineUnavailable(_))));
}

/// Test: when both wait and removal fail, the wait error wins
#[tokio::test]
async fn test_wait_error_wins_over_remove_error() {
    let engine = RecordingEngine {
        fail_remove: true,
        ..Default::default()
    };
    let result = run_ephemeral(&engine, &ContainerSpec::new("img:1"), &command()).await;
    assert!(matches!(result, Err(ContainerError::WaitFailed { .. })));
}
