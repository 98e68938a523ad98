//! # stevedore-common
//!
//! Shared utilities and types for the Stevedore image manager.
//!
//! This crate provides common functionality used across all Stevedore crates:
//! - Container ID generation and container name validation
//! - Content digests and file verification
//! - The on-disk layout of a local repository
//! - Common error types

#![warn(missing_docs)]

pub mod digest;
pub mod error;
pub mod id;
pub mod paths;

pub use digest::Digest;
pub use error::{StevedoreError, StevedoreResult};
pub use id::{ContainerId, ContainerName};
pub use paths::StevedorePaths;
