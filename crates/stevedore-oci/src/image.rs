//! Registry manifest and image configuration types.
//!
//! Based on the OCI Image Specification v1.1.0
//! <https://github.com/opencontainers/image-spec> and the Docker
//! distribution manifest formats (schema 1 and schema 2).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A manifest document as served by a registry or stored in a tag.
///
/// One struct covers every schema: legacy v1 (`fsLayers` + `history`),
/// v2 / OCI image manifests (`config` + `layers`) and indexes
/// (`manifests`). Fields this crate does not model are kept in `extra`
/// so a stored manifest round-trips unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryManifest {
    /// Schema version (1 or 2).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    /// Media type of the manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Image configuration descriptor (v2 / OCI).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    /// Ordered layers, base layer first (v2 / OCI).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<Descriptor>>,
    /// Layers newest first (legacy v1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_layers: Option<Vec<FsLayer>>,
    /// Image metadata history, newest first (legacy v1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<V1History>>,
    /// Platform manifests (index / manifest list).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifests: Option<Vec<ManifestDescriptor>>,
    /// Everything else (name, tag, signatures, annotations...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The shape of a [`RegistryManifest`].
#[derive(Debug, Clone, Copy)]
pub enum ManifestKind<'a> {
    /// Docker schema 1 with v1-compatibility history.
    Legacy {
        /// Layers, newest first.
        fs_layers: &'a [FsLayer],
        /// History, newest first.
        history: &'a [V1History],
    },
    /// Docker schema 2 or OCI image manifest.
    Image {
        /// Config descriptor, if any.
        config: Option<&'a Descriptor>,
        /// Layers, base first.
        layers: &'a [Descriptor],
    },
    /// Manifest list or OCI index.
    Index(&'a [ManifestDescriptor]),
    /// No recognised layer or manifest section.
    Unknown,
}

impl RegistryManifest {
    /// Build a single-config OCI image manifest.
    #[must_use]
    pub fn oci(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: Some(2),
            media_type: Some(media_types::MANIFEST.to_string()),
            config: Some(config),
            layers: Some(layers),
            ..Self::default()
        }
    }

    /// Classify the manifest by the sections it carries.
    #[must_use]
    pub fn kind(&self) -> ManifestKind<'_> {
        if let Some(fs_layers) = &self.fs_layers {
            return ManifestKind::Legacy {
                fs_layers,
                history: self.history.as_deref().unwrap_or_default(),
            };
        }
        if let Some(layers) = &self.layers {
            return ManifestKind::Image {
                config: self.config.as_ref(),
                layers,
            };
        }
        if let Some(manifests) = &self.manifests {
            return ManifestKind::Index(manifests);
        }
        ManifestKind::Unknown
    }
}

/// A legacy schema 1 layer reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    /// Layer digest.
    pub blob_sum: String,
}

/// A legacy schema 1 history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V1History {
    /// Image metadata encoded as a JSON string.
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(default)]
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size in bytes.
    #[serde(default)]
    pub size: u64,
    /// URLs for downloading.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// Descriptor with no URLs or annotations.
    #[must_use]
    pub fn new(media_type: &str, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest.into(),
            size,
            urls: Vec::new(),
            annotations: HashMap::new(),
        }
    }
}

/// Manifest descriptor with platform information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    /// Base descriptor.
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Platform information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// OS version.
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// OCI Image Configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Execution parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ExecutionConfig>,
    /// Rootfs information.
    #[serde(default)]
    pub rootfs: RootFs,
}

/// Execution configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionConfig {
    /// User.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Entrypoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Root filesystem information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    /// Type (must be "layers").
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Layer diff IDs (uncompressed digests).
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// Common media types.
pub mod media_types {
    /// OCI image manifest media type.
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index media type.
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI image config media type.
    pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    /// OCI layer media type (uncompressed tar).
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

    /// Docker manifest v2 schema 2 media type.
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker manifest v2 schema 1 (signed) media type.
    pub const DOCKER_MANIFEST_V1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
    /// Docker manifest list media type.
    pub const DOCKER_INDEX: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Plain JSON, served by some registries for schema 1.
    pub const JSON: &str = "application/json";

    /// Every manifest and index type a pull can negotiate.
    pub const MANIFEST_ACCEPT: &[&str] = &[
        DOCKER_MANIFEST,
        DOCKER_MANIFEST_V1_SIGNED,
        JSON,
        DOCKER_INDEX,
        MANIFEST,
        INDEX,
    ];

    /// Whether a `Content-Type` value denotes a manifest list or index.
    #[must_use]
    pub fn is_index(content_type: &str) -> bool {
        content_type.contains("manifest.list.v2") || content_type.contains("oci.image.index")
    }
}
