//! GPU device discovery.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ContainerError;
use crate::Result;

/// Resolves requested device ids into concrete device identifiers.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Concrete device ids for `requested`. An empty request (or `all`)
    /// means every visible device.
    async fn get_gpus(&self, requested: &[String]) -> Result<Vec<String>>;
}

/// Discovery through `nvidia-smi`.
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmi;

#[async_trait]
impl DeviceDiscovery for NvidiaSmi {
    async fn get_gpus(&self, requested: &[String]) -> Result<Vec<String>> {
        let wants_all = requested.is_empty() || requested.iter().any(|r| r == "all");
        if !wants_all {
            return Ok(requested.to_vec());
        }

        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=uuid", "--format=csv,noheader"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ContainerError::NoGpuAvailable(format!("nvidia-smi: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::NoGpuAvailable(stderr.trim().to_string()));
        }

        let gpus = parse_device_list(&String::from_utf8_lossy(&output.stdout));
        debug!(count = gpus.len(), "Discovered GPUs");
        if gpus.is_empty() {
            return Err(ContainerError::NoGpuAvailable(
                "nvidia-smi reported no devices".to_string(),
            ));
        }
        Ok(gpus)
    }
}

fn parse_device_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
