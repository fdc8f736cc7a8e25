//! Container-Env-Manager: ephemeral sandboxes for modelconv
//!
//! This crate is the container boundary of the conversion engine. It knows
//! how to derive a converter image tag from a framework base image, build
//! that image from a recipe, start a throwaway container with the required
//! host paths mounted and a GPU granted, run a command inside it, and tear
//! it down again.
//!
//! The engine itself is reached through the [`ContainerEngine`] trait;
//! [`DockerEngine`] talks to the Docker Engine API through `bollard`.

pub mod container;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod image;
pub mod shell;

pub use container::{run_ephemeral, ContainerHandle, ContainerSpec};
pub use engine::{create_body, ContainerEngine, DockerEngine};
pub use error::ContainerError;
pub use gpu::{DeviceDiscovery, NvidiaSmi};
pub use image::{converter_image_tag, parse_repository_tag, BuildRequest, CONVERTER_IMAGE_REPO};

/// Result type for container operations
pub type Result<T> = std::result::Result<T, ContainerError>;
