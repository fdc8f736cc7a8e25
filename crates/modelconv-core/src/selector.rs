//! Choosing and publishing the final artifact.
//!
//! The first successful result in expansion order wins. Later successes are
//! discarded with a warning; no quality ranking is applied.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, warn};

use crate::converter::ConversionResult;
use crate::obs;

/// Index of the chosen result and of the discarded successful ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub chosen: usize,
    pub discarded: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published {
        source: PathBuf,
        destination: PathBuf,
        selection: Selection,
    },
    NoUsableArtifact,
}

/// Pick the first successful result that carries a model.
pub fn select(results: &[ConversionResult]) -> Option<Selection> {
    let mut usable = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_success() && r.output_model.is_some())
        .map(|(i, _)| i);
    let chosen = usable.next()?;
    Some(Selection {
        chosen,
        discarded: usable.collect(),
    })
}

/// Copy the selected artifact and its sidecar files to `output_path`.
pub fn publish(results: &[ConversionResult], output_path: &Path) -> io::Result<PublishOutcome> {
    let Some(selection) = select(results) else {
        warn!("No usable artifact to publish");
        return Ok(PublishOutcome::NoUsableArtifact);
    };
    let chosen = &results[selection.chosen];
    let Some(model) = &chosen.output_model else {
        return Ok(PublishOutcome::NoUsableArtifact);
    };

    if !selection.discarded.is_empty() {
        let alternatives: Vec<String> = selection
            .discarded
            .iter()
            .map(|&i| results[i].spec.to_string())
            .collect();
        warn!(
            chosen = %chosen.spec,
            discarded = ?alternatives,
            "Several conversions succeeded; publishing the first one",
        );
    }

    if same_path(&model.path, output_path) {
        debug!(artifact = ?model.path, "Artifact already at the output path");
    } else {
        copy_artifact(&model.path, output_path)?;
        copy_sidecars(&model.path, output_path)?;
    }
    obs::emit_artifact_published(&model.path, output_path, selection.discarded.len());

    Ok(PublishOutcome::Published {
        source: model.path.clone(),
        destination: output_path.to_path_buf(),
        selection,
    })
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Stage the copy next to `destination`, then rename it into place.
fn copy_artifact(source: &Path, destination: &Path) -> io::Result<()> {
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    if source.is_dir() {
        let staging = TempDir::new_in(parent)?;
        let staged = staging.path().join("artifact");
        copy_dir_all(source, &staged)?;
        remove_existing(destination)?;
        fs::rename(&staged, destination)
    } else {
        let staged = NamedTempFile::new_in(parent)?;
        fs::copy(source, staged.path())?;
        if destination.is_dir() {
            fs::remove_dir_all(destination)?;
        }
        staged.persist(destination).map(|_| ()).map_err(|e| e.error)
    }
}

fn remove_existing(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        Ok(())
    }
}

fn copy_dir_all(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Sibling files named `<stem>.<suffix>` go to `<output stem>.<suffix>`.
fn copy_sidecars(source: &Path, destination: &Path) -> io::Result<()> {
    let (Some(dir), Some(stem), Some(out_stem)) = (
        source.parent(),
        source.file_stem().and_then(|s| s.to_str()),
        destination.file_stem().and_then(|s| s.to_str()),
    ) else {
        return Ok(());
    };
    let prefix = format!("{stem}.");

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path == source || !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(suffix) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
            continue;
        };
        let target = destination.with_file_name(format!("{out_stem}.{suffix}"));
        if same_path(&path, &target) {
            continue;
        }
        debug!(sidecar = ?path, target = ?target, "Copying sidecar file");
        fs::copy(&path, &target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetFormat;
    use crate::converter::{ConversionStatus, ModelHandle};
    use crate::expand::ConversionSpec;
    use chrono::Utc;

    fn result(ok: bool, path: &Path) -> ConversionResult {
        ConversionResult {
            spec: ConversionSpec::for_format(TargetFormat::Onnx),
            status: if ok {
                ConversionStatus::succeeded()
            } else {
                ConversionStatus::failed("boom")
            },
            source_model: ModelHandle {
                path: PathBuf::from("/models/m.pt"),
                format: TargetFormat::TorchScript,
            },
            output_model: ok.then(|| ModelHandle {
                path: path.to_path_buf(),
                format: TargetFormat::Onnx,
            }),
            step_runs: Vec::new(),
            framework_docker_image: None,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_select_first_success() {
        let p = Path::new("/x");
        let selection = select(&[result(false, p), result(true, p), result(true, p)]).unwrap();
        assert_eq!(selection.chosen, 1);
        assert_eq!(selection.discarded, vec![2]);
        assert!(select(&[result(false, p)]).is_none());
        assert!(select(&[]).is_none());
    }

    #[test]
    fn test_publish_file_with_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = dir.path().join("onnx_opset13");
        fs::create_dir_all(&artifact_dir).unwrap();
        let artifact = artifact_dir.join("model.onnx");
        fs::write(&artifact, b"onnx").unwrap();
        fs::write(artifact_dir.join("model.yaml"), b"shapes").unwrap();
        fs::write(artifact_dir.join("verify.json"), b"{}").unwrap();

        let out = dir.path().join("out/resnet.onnx");
        let outcome = publish(&[result(true, &artifact)], &out).unwrap();

        assert!(matches!(outcome, PublishOutcome::Published { .. }));
        assert_eq!(fs::read(&out).unwrap(), b"onnx");
        assert_eq!(fs::read(dir.path().join("out/resnet.yaml")).unwrap(), b"shapes");
        assert!(!dir.path().join("out/resnet.json").exists());
    }

    #[test]
    fn test_publish_directory_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("tf_savedmodel/model.savedmodel");
        fs::create_dir_all(artifact.join("variables")).unwrap();
        fs::write(artifact.join("saved_model.pb"), b"pb").unwrap();
        fs::write(artifact.join("variables/data"), b"w").unwrap();

        let out = dir.path().join("final.savedmodel");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("leftover"), b"old").unwrap();

        publish(&[result(true, &artifact)], &out).unwrap();
        assert_eq!(fs::read(out.join("variables/data")).unwrap(), b"w");
        assert!(!out.join("leftover").exists());
    }

    #[test]
    fn test_publish_onto_itself_keeps_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("model.onnx");
        fs::write(&artifact, b"onnx").unwrap();
        fs::write(dir.path().join("model.yaml"), b"shapes").unwrap();

        let alias = dir.path().join(".").join("model.onnx");
        let outcome = publish(&[result(true, &artifact)], &alias).unwrap();

        assert!(matches!(outcome, PublishOutcome::Published { .. }));
        assert_eq!(fs::read(&artifact).unwrap(), b"onnx");
        assert_eq!(fs::read(dir.path().join("model.yaml")).unwrap(), b"shapes");
    }

    #[test]
    fn test_publish_file_over_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("trt/model.plan");
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, b"plan").unwrap();
        let out = dir.path().join("model.plan");
        fs::write(&out, b"stale").unwrap();

        publish(&[result(true, &artifact)], &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"plan");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 2);
    }

    #[test]
    fn test_publish_nothing_when_all_failed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.onnx");
        let p = dir.path().join("missing.onnx");
        let outcome = publish(&[result(false, &p), result(false, &p)], &out).unwrap();
        assert_eq!(outcome, PublishOutcome::NoUsableArtifact);
        assert!(!out.exists());
    }
}
