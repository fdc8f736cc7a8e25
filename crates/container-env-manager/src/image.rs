//! Image naming and build requests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Repository used for locally built converter images.
pub const CONVERTER_IMAGE_REPO: &str = "modelconv-converter";

/// Split an image reference into `(repository, tag)`.
///
/// Handles registry ports (`host:5000/img`) and digests (`img@sha256:..`),
/// which carry no tag.
pub fn parse_repository_tag(image: &str) -> (String, Option<String>) {
    if let Some((repo, _digest)) = image.split_once('@') {
        return (repo.to_string(), None);
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), Some(tag.to_string())),
        _ => (image.to_string(), None),
    }
}

/// Deterministic converter image tag for a framework base image.
///
/// `nvcr.io/nvidia/pytorch:21.12-py3` → `modelconv-converter:21.12-py3`
pub fn converter_image_tag(base_image: &str) -> String {
    let (_, tag) = parse_repository_tag(base_image);
    format!(
        "{}:{}",
        CONVERTER_IMAGE_REPO,
        tag.as_deref().unwrap_or("latest")
    )
}

/// Everything needed to build one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Recipe (Dockerfile) path.
    pub recipe: PathBuf,
    /// Build context directory.
    pub context: PathBuf,
    /// Resulting image tag.
    pub image: String,
    /// Build arguments passed to the recipe.
    pub build_args: BTreeMap<String, String>,
}

impl BuildRequest {
    pub fn new(recipe: impl Into<PathBuf>, context: impl Into<PathBuf>, image: impl Into<String>) -> Self {
        Self {
            recipe: recipe.into(),
            context: context.into(),
            image: image.into(),
            build_args: BTreeMap::new(),
        }
    }

    pub fn with_build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_tag() {
        assert_eq!(
            parse_repository_tag("nvcr.io/nvidia/pytorch:21.12-py3"),
            ("nvcr.io/nvidia/pytorch".to_string(), Some("21.12-py3".to_string()))
        );
    }

    #[test]
    fn test_parse_registry_port_without_tag() {
        assert_eq!(
            parse_repository_tag("localhost:5000/converter"),
            ("localhost:5000/converter".to_string(), None)
        );
    }

    #[test]
    fn test_parse_registry_port_with_tag() {
        assert_eq!(
            parse_repository_tag("localhost:5000/converter:v2"),
            ("localhost:5000/converter".to_string(), Some("v2".to_string()))
        );
    }

    #[test]
    fn test_parse_digest() {
        let (repo, tag) = parse_repository_tag("ubuntu@sha256:abcdef");
        assert_eq!(repo, "ubuntu");
        assert!(tag.is_none());
    }

    #[test]
    fn test_converter_tag_is_deterministic() {
        let a = converter_image_tag("nvcr.io/nvidia/tensorflow:21.12-tf2-py3");
        let b = converter_image_tag("nvcr.io/nvidia/tensorflow:21.12-tf2-py3");
        assert_eq!(a, b);
        assert_eq!(a, "modelconv-converter:21.12-tf2-py3");
        assert_eq!(converter_image_tag("ubuntu"), "modelconv-converter:latest");
    }

    #[test]
    fn test_build_args_accumulate() {
        let req = BuildRequest::new("/src/Dockerfile", "/src", "modelconv-converter:1")
            .with_build_arg("FROM_IMAGE_NAME", "base:1")
            .with_build_arg("FROM_IMAGE_NAME", "base:2")
            .with_build_arg("INSTALL_URL", "https://example.invalid/x.tar.gz");
        assert_eq!(req.build_args.len(), 2);
        assert_eq!(req.build_args["FROM_IMAGE_NAME"], "base:2");
    }
}
