//! Structured lifecycle events for conversions, steps and sandboxes.
//!
//! Events are emitted at `info!` level with an `event` field so they can be
//! filtered in JSON output (`--json`).

use std::fmt::Display;
use std::path::Path;

use tracing::info;

/// Span tagged with the conversion spec; attach with `Instrument`.
pub fn conversion_span(spec: &dyn Display) -> tracing::Span {
    tracing::info_span!("modelconv.conversion", spec = %spec)
}

/// Emit event: conversion of one spec started.
pub fn emit_conversion_started(spec: &dyn Display, model_name: &str) {
    info!(event = "conversion.started", spec = %spec, model = %model_name);
}

/// Emit event: conversion of one spec finished.
pub fn emit_conversion_finished(spec: &dyn Display, succeeded: bool, duration_ms: u64) {
    info!(
        event = "conversion.finished",
        spec = %spec,
        succeeded = succeeded,
        duration_ms = duration_ms,
    );
}

pub fn emit_step_finished(step: &str, status: &dyn Display, duration_ms: u64) {
    info!(
        event = "step.finished",
        step = %step,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Emit event: sandbox container started.
pub fn emit_sandbox_started(image: &str, container: &str, workspace: &Path) {
    info!(
        event = "sandbox.started",
        image = %image,
        container = %container,
        workspace = ?workspace,
    );
}

/// Emit event: sandbox container torn down.
pub fn emit_sandbox_finished(container: &str, exit_code: Option<i32>) {
    info!(event = "sandbox.finished", container = %container, exit_code = ?exit_code);
}

/// Emit event: an artifact was published, optionally over discarded alternatives.
pub fn emit_artifact_published(source: &Path, destination: &Path, discarded: usize) {
    info!(
        event = "artifact.published",
        source = ?source,
        destination = ?destination,
        discarded = discarded,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_span_create() {
        let _guard = conversion_span(&"trt-fp16-opset13").entered();
        emit_step_finished("export_onnx_opset13", &"SUCCEEDED", 12);
    }
}
