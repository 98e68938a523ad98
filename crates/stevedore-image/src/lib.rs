//! # stevedore-image
//!
//! Image handling for Stevedore.
//!
//! This crate provides:
//! - A registry client (v2 API, bearer tokens, manifest lists, cached blobs)
//! - The local repository of images, shared layers and containers
//! - Layer materialization with whiteout handling
//! - Portable import/export and the multi-layer save/load format

#![warn(missing_docs)]

pub mod archive;
pub mod config;
pub mod container;
pub mod layer;
pub mod link;
pub mod platform;
pub mod portable;
pub mod reference;
/// Docker registry v2 client.
pub mod registry;
/// Local image and container repository.
pub mod repository;

pub use archive::{ArchiveInput, ArchiveOutput, Archiver, NativeTar};
pub use config::RegistryConfig;
pub use container::ContainerBuilder;
pub use layer::LayerMaterializer;
pub use platform::PlatformSelector;
pub use portable::PortableImages;
pub use reference::{ImageSpec, RemoteReference};
pub use registry::{PullPolicy, RegistryClient};
pub use repository::{LocalRepository, TagDir};
