//! Common error types for Stevedore.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StevedoreError`].
pub type StevedoreResult<T> = Result<T, StevedoreError>;

/// Errors shared by every Stevedore crate.
#[derive(Error, Diagnostic, Debug)]
pub enum StevedoreError {
    /// The registry answered with something we cannot use.
    #[error("Registry error: {message}")]
    #[diagnostic(code(stevedore::registry::protocol))]
    Registry {
        /// What went wrong.
        message: String,
    },

    /// Transport-level failure talking to a registry.
    #[error("Network error: {message}")]
    #[diagnostic(code(stevedore::registry::network))]
    Network {
        /// What went wrong.
        message: String,
    },

    /// A manifest is missing a section we rely on.
    #[error("Manifest error: {message}")]
    #[diagnostic(code(stevedore::manifest::invalid))]
    Manifest {
        /// What went wrong.
        message: String,
    },

    /// Blob content does not hash to its digest.
    #[error("Digest mismatch for {digest}")]
    #[diagnostic(
        code(stevedore::integrity::digest_mismatch),
        help("The partial file was removed; pull again to re-download it")
    )]
    DigestMismatch {
        /// Expected digest.
        digest: String,
    },

    /// A blob named by a manifest is not present.
    #[error("Missing blob: {digest}")]
    #[diagnostic(code(stevedore::integrity::missing_blob))]
    MissingBlob {
        /// Digest or relative path of the missing blob.
        digest: String,
    },

    /// A layer is not cached and the pull policy forbids downloading it.
    #[error("Layer {digest} is not cached and pull policy is never")]
    #[diagnostic(
        code(stevedore::integrity::not_cached),
        help("Use --pull=missing to allow downloads")
    )]
    NotCached {
        /// Layer digest.
        digest: String,
    },

    /// Image (repository and tag) not found.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(stevedore::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Tag already exists and would be overwritten.
    #[error("Tag already exists: {reference}")]
    #[diagnostic(code(stevedore::image::tag_exists))]
    TagExists {
        /// The existing `repo:tag`.
        reference: String,
    },

    /// Image is protected against removal.
    #[error("Image is protected: {reference}")]
    #[diagnostic(code(stevedore::image::protected))]
    ImageProtected {
        /// The protected `repo:tag`.
        reference: String,
    },

    /// Image reference failed validation.
    #[error("Invalid image reference: {reference}")]
    #[diagnostic(
        code(stevedore::image::invalid_reference),
        help("Use image:tag or repository/image:tag")
    )]
    InvalidReference {
        /// The rejected input.
        reference: String,
    },

    /// Unknown pull policy name.
    #[error("Invalid pull policy: {value}")]
    #[diagnostic(
        code(stevedore::image::invalid_pull_policy),
        help("Valid policies are missing, always and never")
    )]
    InvalidPullPolicy {
        /// The rejected input.
        value: String,
    },

    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(stevedore::container::not_found))]
    ContainerNotFound {
        /// The container id or name that was not found.
        id: String,
    },

    /// Container directory already exists.
    #[error("Container already exists: {id}")]
    #[diagnostic(code(stevedore::container::exists))]
    ContainerExists {
        /// The conflicting id.
        id: String,
    },

    /// Container is protected against removal.
    #[error("Container is protected: {id}")]
    #[diagnostic(code(stevedore::container::protected))]
    ContainerProtected {
        /// The protected container id.
        id: String,
    },

    /// Container id is not a single alphanumeric path component.
    #[error("Invalid container id: {id}")]
    #[diagnostic(
        code(stevedore::container::invalid_id),
        help("Container ids are up to 64 ASCII letters, digits or '-'")
    )]
    InvalidContainerId {
        /// The rejected id.
        id: String,
    },

    /// Container name has characters outside the allowed set.
    #[error("Invalid container name: {name}")]
    #[diagnostic(
        code(stevedore::container::invalid_name),
        help("Names start with a letter or digit followed by letters, digits, '_', '.' or '-'")
    )]
    InvalidContainerName {
        /// The invalid name.
        name: String,
    },

    /// Container name is already taken.
    #[error("Container name already in use: {name}")]
    #[diagnostic(code(stevedore::container::name_in_use))]
    NameInUse {
        /// The conflicting name.
        name: String,
    },

    /// Some layers could not be extracted into a root tree.
    #[error("Failed to extract {failed} of {total} layers")]
    #[diagnostic(code(stevedore::layer::extraction))]
    LayerExtraction {
        /// Number of layers that failed.
        failed: usize,
        /// Number of layers processed.
        total: usize,
    },

    /// Tar archive creation or extraction failed.
    #[error("Archive error: {message}")]
    #[diagnostic(code(stevedore::archive))]
    Archive {
        /// What went wrong.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(stevedore::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(stevedore::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(stevedore::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(stevedore::internal),
        help("This is a bug, please report it at https://github.com/stevedore-rs/stevedore/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for StevedoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
