//! Index types of the multi-layer save/load tar format.
//!
//! A saved image archive holds a top-level `manifest.json` (a list of
//! [`ArchiveManifestEntry`]), a legacy `repositories` map and one directory
//! per layer with `layer.tar`, `VERSION` and `json`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Name of the top-level index file.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Name of the legacy repositories map.
pub const REPOSITORIES_FILE: &str = "repositories";
/// Layer tarball name inside each layer directory.
pub const LAYER_FILE: &str = "layer.tar";
/// Layer format version file name.
pub const VERSION_FILE: &str = "VERSION";
/// Layer metadata placeholder file name.
pub const JSON_FILE: &str = "json";
/// Content written to [`VERSION_FILE`].
pub const LAYER_VERSION: &str = "1.0";

/// One image in `manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveManifestEntry {
    /// Path of the config JSON, relative to the archive root.
    #[serde(default)]
    pub config: String,
    /// `repo:tag` names of the image. Untagged images carry `null`.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub repo_tags: Vec<String>,
    /// Layer tarball paths, base layer first.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub layers: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// `repositories` map: repository -> tag -> top layer id.
pub type Repositories = BTreeMap<String, BTreeMap<String, String>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_save_index() {
        let raw = r#"[{
            "Config": "abc.json",
            "RepoTags": ["alpine:3.19"],
            "Layers": ["l1/layer.tar", "l2/layer.tar"]
        }]"#;
        let entries: Vec<ArchiveManifestEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries[0].config, "abc.json");
        assert_eq!(entries[0].repo_tags, vec!["alpine:3.19"]);
        assert_eq!(entries[0].layers.len(), 2);
    }

    #[test]
    fn missing_repo_tags_default_to_empty() {
        let raw = r#"[{"Config": "c.json", "RepoTags": null, "Layers": []}]"#;
        let entries: Vec<ArchiveManifestEntry> = serde_json::from_str(raw).unwrap();
        assert!(entries[0].repo_tags.is_empty());

        let raw = r#"[{"Config": "c.json", "Layers": []}]"#;
        let entries: Vec<ArchiveManifestEntry> = serde_json::from_str(raw).unwrap();
        assert!(entries[0].repo_tags.is_empty());
    }
}
