//! # stevedore-oci
//!
//! Image format types for Stevedore.
//!
//! This crate provides Rust types for:
//! - Registry manifests (OCI, Docker v2 and legacy v1 signed manifests)
//! - Image indexes / manifest lists
//! - Image configuration
//! - The `manifest.json` index of the save/load tar format

#![warn(missing_docs)]

pub mod archive;
pub mod image;

pub use archive::ArchiveManifestEntry;
pub use image::{Descriptor, ImageConfig, ManifestKind, RegistryManifest};
