//! Local repository.
//!
//! Layout under the root:
//!
//! ```text
//! repos/<repo-path>/<tag>/TAG          sentinel, "<repo-dir>:<tag>"
//! repos/<repo-path>/<tag>/v1|v2        manifest version marker
//! repos/<repo-path>/<tag>/manifest     stored manifest
//! repos/<repo-path>/<tag>/<digest>     link into layers/
//! repos/<repo-path>/<tag>/PROTECT      optional
//! layers/<digest>                      shared blobs
//! containers/<id>/ROOT/                merged filesystem
//! containers/<id>/imagerepo.name       "repo:tag"
//! containers/<id>/container.json       image config copy
//! containers/<id>/PROTECT              optional
//! containers/<name>                    link to containers/<id>
//! ```
//!
//! Blobs carry no reference count; a blob is removed when a scan of
//! `repos/` finds no link to it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use stevedore_common::{ContainerId, ContainerName, StevedoreError, StevedorePaths, StevedoreResult};
use stevedore_oci::{ManifestKind, RegistryManifest};
use walkdir::WalkDir;

use crate::link;

const TAG_FILE: &str = "TAG";
const MANIFEST_FILE: &str = "manifest";
const PROTECT_FILE: &str = "PROTECT";
const ROOT_DIR: &str = "ROOT";
const IMAGE_NAME_FILE: &str = "imagerepo.name";
const CONTAINER_JSON: &str = "container.json";

/// Manifest format of a stored tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestVersion {
    /// Registry API v1 image; kept for listing only.
    V1,
    /// Registry API v2 (schema 1, schema 2 or OCI manifest).
    V2,
}

impl ManifestVersion {
    const fn marker(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

/// Image config plus its layer files in application order.
#[derive(Debug, Clone)]
pub struct ImageAttributes {
    /// Image config (or v1-compatibility metadata), when readable.
    pub config: Option<Value>,
    /// Layer files, base first.
    pub layers: Vec<PathBuf>,
}

/// A layer link and the size of its blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// Link path inside the tag directory.
    pub path: PathBuf,
    /// Blob size in bytes.
    pub size: u64,
}

/// One row of [`LocalRepository::list_containers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// `repo:tag` the container was created from.
    pub image: String,
    /// Name aliases.
    pub names: Vec<String>,
}

/// Whether a container's root can be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writability {
    /// ROOT is writable.
    Writable,
    /// ROOT exists but is read-only.
    ReadOnly,
    /// ROOT does not exist.
    Missing,
}

/// A selected tag directory.
#[derive(Debug, Clone)]
pub struct TagDir {
    /// Repository name.
    pub repository: String,
    /// Tag.
    pub tag: String,
    path: PathBuf,
}

impl TagDir {
    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `repo:tag`.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Write the manifest version marker.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker cannot be written.
    pub fn set_version(&self, version: ManifestVersion) -> StevedoreResult<()> {
        fs::write(self.path.join(version.marker()), b"")?;
        Ok(())
    }

    /// The manifest version marker present, if any.
    #[must_use]
    pub fn version(&self) -> Option<ManifestVersion> {
        [ManifestVersion::V1, ManifestVersion::V2]
            .into_iter()
            .find(|v| self.path.join(v.marker()).is_file())
    }

    /// Store the manifest document.
    ///
    /// # Errors
    ///
    /// Fails if the manifest cannot be serialized or written.
    pub fn save_manifest(&self, manifest: &RegistryManifest) -> StevedoreResult<()> {
        fs::write(self.path.join(MANIFEST_FILE), serde_json::to_vec(manifest)?)?;
        Ok(())
    }

    /// Read the stored manifest.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Manifest`] if the manifest is missing or
    /// unparseable.
    pub fn load_manifest(&self) -> StevedoreResult<RegistryManifest> {
        let raw = fs::read(self.path.join(MANIFEST_FILE)).map_err(|e| StevedoreError::Manifest {
            message: format!("manifest of {} is missing: {e}", self.reference()),
        })?;
        serde_json::from_slice(&raw).map_err(|e| StevedoreError::Manifest {
            message: format!("manifest of {} is invalid: {e}", self.reference()),
        })
    }

    /// Link a blob into this tag, replacing a link of the same name.
    ///
    /// The link is named `link_name`, or the blob's file name.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::MissingBlob`] when `blob` is not a file.
    pub fn add_layer_link(&self, blob: &Path, link_name: Option<&str>) -> StevedoreResult<PathBuf> {
        if !blob.is_file() {
            return Err(StevedoreError::MissingBlob {
                digest: blob.display().to_string(),
            });
        }
        let name = match link_name {
            Some(name) => Path::new(name).file_name(),
            None => blob.file_name(),
        }
        .ok_or_else(|| StevedoreError::Internal {
            message: format!("blob path has no file name: {}", blob.display()),
        })?;

        let link_path = self.path.join(name);
        if fs::symlink_metadata(&link_path).is_ok() {
            fs::remove_file(&link_path)?;
        }
        link::create(blob, &link_path)?;
        Ok(link_path)
    }

    /// Write an image config as a plain file named by its digest.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn save_config(&self, data: &[u8], digest: &str) -> StevedoreResult<PathBuf> {
        let path = self.path.join(digest);
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Layer links with blob sizes. Broken links are skipped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read.
    pub fn layers(&self) -> StevedoreResult<Vec<LayerEntry>> {
        let mut layers = Vec::new();
        for path in link::list(&self.path)? {
            let Ok(meta) = link::resolve(&path).and_then(fs::metadata) else {
                continue;
            };
            layers.push(LayerEntry {
                path,
                size: meta.len(),
            });
        }
        Ok(layers)
    }

    /// Path of a blob named by a manifest digest, following a link record
    /// on platforms without symlinks.
    #[must_use]
    pub fn blob_file(&self, digest: &str) -> PathBuf {
        let path = self.path.join(digest);
        if link::is_link(&path) {
            link::resolve(&path).unwrap_or(path)
        } else {
            path
        }
    }

    /// Config and layer files of a v2 tag.
    ///
    /// Returns `None` for v1 tags, tags without a version marker, manifests
    /// without layers, and whenever a layer file is absent.
    ///
    /// # Errors
    ///
    /// Fails only if the manifest itself cannot be read.
    pub fn image_attributes(&self) -> StevedoreResult<Option<ImageAttributes>> {
        if self.version() != Some(ManifestVersion::V2) {
            return Ok(None);
        }
        let manifest = self.load_manifest()?;

        let (digests, config): (Vec<&str>, Option<Value>) = match manifest.kind() {
            ManifestKind::Legacy { fs_layers, history } => {
                let digests = fs_layers.iter().rev().map(|l| l.blob_sum.as_str()).collect();
                let config = history
                    .first()
                    .and_then(|h| serde_json::from_str(h.v1_compatibility.trim()).ok());
                (digests, config)
            }
            ManifestKind::Image { config, layers } => {
                let digests = layers.iter().map(|l| l.digest.as_str()).collect();
                let config = config.and_then(|c| {
                    let raw = fs::read(self.blob_file(&c.digest)).ok()?;
                    serde_json::from_slice(&raw).ok()
                });
                (digests, config)
            }
            ManifestKind::Index(_) | ManifestKind::Unknown => return Ok(None),
        };

        let mut layers = Vec::with_capacity(digests.len());
        for digest in digests {
            let file = self.blob_file(digest);
            if !file.is_file() {
                tracing::warn!(digest, image = %self.reference(), "Layer file missing");
                return Ok(None);
            }
            layers.push(file);
        }

        Ok(Some(ImageAttributes { config, layers }))
    }

    /// Check that every layer and the config named by the manifest exist.
    ///
    /// Content is not re-hashed.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::MissingBlob`] for the first absent file, or
    /// [`StevedoreError::Manifest`] for an unreadable manifest.
    pub fn verify(&self) -> StevedoreResult<()> {
        let manifest = self.load_manifest()?;
        let mut required: Vec<&str> = Vec::new();
        match manifest.kind() {
            ManifestKind::Legacy { fs_layers, .. } => {
                required.extend(fs_layers.iter().map(|l| l.blob_sum.as_str()));
            }
            ManifestKind::Image { config, layers } => {
                required.extend(layers.iter().map(|l| l.digest.as_str()));
                required.extend(config.map(|c| c.digest.as_str()));
            }
            ManifestKind::Index(_) | ManifestKind::Unknown => {
                return Err(StevedoreError::Manifest {
                    message: format!("{} has no layer list", self.reference()),
                });
            }
        }

        for digest in required {
            if digest.is_empty() {
                return Err(StevedoreError::Manifest {
                    message: "layer digest missing in manifest".to_string(),
                });
            }
            if !self.blob_file(digest).is_file() {
                return Err(StevedoreError::MissingBlob {
                    digest: digest.to_string(),
                });
            }
        }
        Ok(())
    }

    /// `os/arch[/variant]` from the image config, `unknown/unknown` when
    /// there is none.
    #[must_use]
    pub fn platform_label(&self) -> String {
        let config = self
            .image_attributes()
            .ok()
            .flatten()
            .and_then(|attrs| attrs.config);
        let Some(config) = config else {
            return "unknown/unknown".to_string();
        };
        let field = |key: &str| {
            config
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let os = field("os").unwrap_or_else(|| "unknown".to_string());
        let arch = field("architecture").unwrap_or_else(|| "unknown".to_string());
        match field("variant") {
            Some(variant) => format!("{os}/{arch}/{variant}"),
            None => format!("{os}/{arch}"),
        }
    }

    /// Whether the tag carries the protection marker.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.path.join(PROTECT_FILE).is_file()
    }

    /// Mark the tag as protected.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker cannot be written.
    pub fn protect(&self) -> StevedoreResult<()> {
        fs::write(self.path.join(PROTECT_FILE), b"")?;
        Ok(())
    }

    /// Remove the protection marker.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the marker exists but cannot be removed.
    pub fn unprotect(&self) -> StevedoreResult<()> {
        remove_if_exists(&self.path.join(PROTECT_FILE))
    }
}

/// On-disk image, layer and container storage.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    paths: StevedorePaths,
}

impl LocalRepository {
    /// Repository over the given paths. Nothing is created on disk.
    #[must_use]
    pub const fn new(paths: StevedorePaths) -> Self {
        Self { paths }
    }

    /// The repository paths.
    #[must_use]
    pub const fn paths(&self) -> &StevedorePaths {
        &self.paths
    }

    /// Create the top-level directories. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be created.
    pub fn ensure_layout(&self) -> StevedoreResult<()> {
        for dir in self.paths.layout() {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Whether the top-level directories exist.
    #[must_use]
    pub fn is_repo(&self) -> bool {
        self.paths.layout().iter().all(|d| d.is_dir())
    }

    // ---- images ----

    /// Select an existing tag. A directory without the sentinel is not a tag.
    #[must_use]
    pub fn select_tag(&self, repository: &str, tag: &str) -> Option<TagDir> {
        let path = self.paths.tag(repository, tag).ok()?;
        path.join(TAG_FILE).is_file().then(|| TagDir {
            repository: repository.to_string(),
            tag: tag.to_string(),
            path,
        })
    }

    /// Select an existing tag or fail with [`StevedoreError::ImageNotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::ImageNotFound`] if the tag does not exist,
    /// or [`StevedoreError::InvalidReference`] for a name that cannot be a
    /// tag directory.
    pub fn require_tag(&self, repository: &str, tag: &str) -> StevedoreResult<TagDir> {
        self.paths.tag(repository, tag)?;
        self.select_tag(repository, tag)
            .ok_or_else(|| StevedoreError::ImageNotFound {
                reference: format!("{repository}:{tag}"),
            })
    }

    /// Create the repository directory.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidReference`] for an empty name or one
    /// with `.`/`..` segments, or an I/O error when the directory cannot be
    /// created.
    pub fn create_image_repo(&self, repository: &str) -> StevedoreResult<PathBuf> {
        let dir = self.paths.repository(repository)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Create (or reuse) a tag directory and write its sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidReference`] when the tag would land
    /// outside its repository, or an I/O error if the directory or sentinel
    /// cannot be written.
    pub fn create_tag(&self, repository: &str, tag: &str) -> StevedoreResult<TagDir> {
        let path = self.paths.tag(repository, tag)?;
        let repo_dir = self.create_image_repo(repository)?;
        fs::create_dir_all(&path)?;
        fs::write(
            path.join(TAG_FILE),
            format!("{}:{tag}", repo_dir.display()),
        )?;
        tracing::debug!(repository, tag, "Created tag");
        Ok(TagDir {
            repository: repository.to_string(),
            tag: tag.to_string(),
            path,
        })
    }

    /// Every `(repository, tag)` pair, sorted.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `repos/` cannot be walked.
    pub fn list_image_repos(&self) -> StevedoreResult<Vec<(String, String)>> {
        let repos = self.paths.repos();
        let mut found = Vec::new();
        if !repos.is_dir() {
            return Ok(found);
        }
        let mut walker = WalkDir::new(&repos).min_depth(1).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if entry.path().join(TAG_FILE).is_file() {
                let Ok(relative) = entry.path().strip_prefix(&repos) else {
                    continue;
                };
                if let (Some(parent), Some(tag)) = (relative.parent(), relative.file_name()) {
                    found.push((
                        path_to_name(parent),
                        tag.to_string_lossy().into_owned(),
                    ));
                }
                walker.skip_current_dir();
            }
        }
        found.sort();
        Ok(found)
    }

    /// Layer links of a tag.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::ImageNotFound`] for an unknown tag.
    pub fn list_layers(&self, repository: &str, tag: &str) -> StevedoreResult<Vec<LayerEntry>> {
        self.require_tag(repository, tag)?.layers()
    }

    /// Shared blob path for a digest.
    #[must_use]
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.paths.layer(digest)
    }

    /// Copy a file into the blob store under `digest`, keeping an existing
    /// blob.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the copy fails.
    pub fn store_blob(&self, src: &Path, digest: &str) -> StevedoreResult<PathBuf> {
        let dest = self.blob_path(digest);
        if dest.is_file() {
            tracing::debug!(digest, "Blob already stored");
            return Ok(dest);
        }
        fs::create_dir_all(self.paths.layers())?;
        fs::copy(src, &dest)?;
        Ok(dest)
    }

    /// Write bytes into the blob store under `digest`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub fn store_blob_bytes(&self, data: &[u8], digest: &str) -> StevedoreResult<PathBuf> {
        fs::create_dir_all(self.paths.layers())?;
        let dest = self.blob_path(digest);
        fs::write(&dest, data)?;
        Ok(dest)
    }

    /// Remove a tag and every blob no other tag links to.
    ///
    /// Not atomic: an aborted removal may leave some links removed already.
    /// Re-running it finishes the job. With `force`, individual failures
    /// and the protection marker are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::ImageNotFound`], [`StevedoreError::ImageProtected`]
    /// or the first I/O failure when `force` is unset.
    pub fn remove_image(&self, repository: &str, tag: &str, force: bool) -> StevedoreResult<()> {
        let tag_dir = self.require_tag(repository, tag)?;
        if tag_dir.is_protected() && !force {
            return Err(StevedoreError::ImageProtected {
                reference: tag_dir.reference(),
            });
        }

        for link_path in link::list(tag_dir.path())? {
            let target = link::read_target(&link_path).ok();
            tolerate(fs::remove_file(&link_path), force, &link_path)?;

            let Some(target) = target else { continue };
            let Some(blob_name) = target.file_name() else {
                continue;
            };
            if self.links_to(blob_name)?.is_empty() {
                let blob = tag_dir.path().join(&target);
                tracing::info!(blob = %blob_name.to_string_lossy(), "Removing unreferenced layer");
                tolerate(remove_if_exists(&blob).map_err(into_io), force, &blob)?;
            }
        }

        tolerate(fs::remove_dir_all(tag_dir.path()), force, tag_dir.path())?;
        self.prune_repo_dirs(repository);
        tracing::info!(image = %tag_dir.reference(), "Removed image");
        Ok(())
    }

    /// Links anywhere under `repos/` whose target has the basename `name`.
    fn links_to(&self, name: &std::ffi::OsStr) -> StevedoreResult<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in WalkDir::new(self.paths.repos()).follow_links(false) {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_dir() || !link::is_link(entry.path()) {
                continue;
            }
            let matches = link::read_target(entry.path())
                .is_ok_and(|t| t.file_name() == Some(name));
            if matches {
                found.push(entry.into_path());
            }
        }
        Ok(found)
    }

    /// Remove empty repository directories from the leaf upwards.
    fn prune_repo_dirs(&self, repository: &str) {
        let mut current = Some(Path::new(repository));
        while let Some(repo) = current.filter(|r| !r.as_os_str().is_empty()) {
            if fs::remove_dir(self.paths.repos().join(repo)).is_err() {
                break;
            }
            current = repo.parent();
        }
    }

    // ---- containers ----

    /// Allocate `containers/<id>/` with an empty ROOT and origin record.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::ContainerExists`] if the id is taken.
    pub fn create_container(
        &self,
        repository: &str,
        tag: &str,
        id: &ContainerId,
    ) -> StevedoreResult<PathBuf> {
        let dir = self.paths.container(id.as_str());
        if fs::symlink_metadata(&dir).is_ok() {
            return Err(StevedoreError::ContainerExists {
                id: id.to_string(),
            });
        }
        fs::create_dir_all(dir.join(ROOT_DIR))?;
        fs::write(dir.join(IMAGE_NAME_FILE), format!("{repository}:{tag}"))?;
        Ok(dir)
    }

    /// Store the image config next to a container.
    ///
    /// # Errors
    ///
    /// Returns an I/O or serialization error.
    pub fn save_container_json(&self, id: &ContainerId, config: &Value) -> StevedoreResult<()> {
        let path = self.paths.container(id.as_str()).join(CONTAINER_JSON);
        fs::write(path, serde_json::to_vec_pretty(config)?)?;
        Ok(())
    }

    /// The stored image config of a container, if any.
    ///
    /// # Errors
    ///
    /// Returns an I/O error other than not-found, or a parse error.
    pub fn container_json(&self, id: &str) -> StevedoreResult<Option<Value>> {
        let path = self.paths.container(id).join(CONTAINER_JSON);
        match fs::read(&path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a container name or id to an id.
    #[must_use]
    pub fn container_id(&self, name_or_id: &str) -> Option<String> {
        if name_or_id.is_empty() || name_or_id.contains('/') || name_or_id.starts_with('.') {
            return None;
        }
        let path = self.paths.container(name_or_id);
        if link::is_link(&path) {
            return link::read_target(&path)
                .ok()
                .and_then(|t| t.file_name().map(|n| n.to_string_lossy().into_owned()));
        }
        path.is_dir().then(|| name_or_id.to_string())
    }

    /// Container directory for an existing id.
    #[must_use]
    pub fn container_dir(&self, id: &str) -> Option<PathBuf> {
        ContainerId::new(id).ok()?;
        let path = self.paths.container(id);
        (!link::is_link(&path) && path.is_dir()).then_some(path)
    }

    /// Names pointing at a container.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `containers/` cannot be read.
    pub fn container_names(&self, id: &str) -> StevedoreResult<Vec<String>> {
        let dir = self.paths.containers();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for path in link::list(&dir)? {
            let target = link::read_target(&path)?;
            if target.file_name().is_some_and(|n| n == id) {
                if let Some(name) = path.file_name() {
                    names.push(name.to_string_lossy().into_owned());
                }
            }
        }
        Ok(names)
    }

    /// Add a name alias to a container.
    ///
    /// # Errors
    ///
    /// Fails for invalid names, unknown containers and names in use.
    pub fn set_container_name(&self, id: &str, name: &str) -> StevedoreResult<()> {
        let name = ContainerName::new(name)?;
        let dir = self
            .container_dir(id)
            .ok_or_else(|| StevedoreError::ContainerNotFound { id: id.to_string() })?;
        let link_path = self.paths.container(name.as_str());
        if fs::symlink_metadata(&link_path).is_ok() {
            return Err(StevedoreError::NameInUse {
                name: name.to_string(),
            });
        }
        link::create(&dir, &link_path)?;
        Ok(())
    }

    /// Remove a name alias. The container itself is untouched.
    ///
    /// # Errors
    ///
    /// Fails for invalid names and names that are not aliases.
    pub fn delete_container_name(&self, name: &str) -> StevedoreResult<()> {
        let name = ContainerName::new(name)?;
        let link_path = self.paths.container(name.as_str());
        if !link::is_link(&link_path) {
            return Err(StevedoreError::ContainerNotFound {
                id: name.to_string(),
            });
        }
        fs::remove_file(link_path)?;
        Ok(())
    }

    /// Whether a container carries the protection marker.
    #[must_use]
    pub fn is_container_protected(&self, id: &str) -> bool {
        self.container_dir(id)
            .is_some_and(|dir| dir.join(PROTECT_FILE).is_file())
    }

    /// Set or clear a container's protection marker.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::ContainerNotFound`] or an I/O error.
    pub fn set_container_protected(&self, id: &str, protected: bool) -> StevedoreResult<()> {
        let dir = self
            .container_dir(id)
            .ok_or_else(|| StevedoreError::ContainerNotFound { id: id.to_string() })?;
        let marker = dir.join(PROTECT_FILE);
        if protected {
            fs::write(marker, b"")?;
            Ok(())
        } else {
            remove_if_exists(&marker)
        }
    }

    /// Remove a container's aliases and, unless it is protected, its tree.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidContainerId`],
    /// [`StevedoreError::ContainerNotFound`],
    /// [`StevedoreError::ContainerProtected`] or an I/O error.
    pub fn remove_container(&self, id: &str, force: bool) -> StevedoreResult<()> {
        ContainerId::new(id)?;
        let dir = self
            .container_dir(id)
            .ok_or_else(|| StevedoreError::ContainerNotFound { id: id.to_string() })?;
        for name in self.container_names(id)? {
            if let Err(e) = self.delete_container_name(&name) {
                tracing::warn!(name, error = %e, "Failed to remove container name");
            }
        }
        if !force && self.is_container_protected(id) {
            return Err(StevedoreError::ContainerProtected { id: id.to_string() });
        }
        make_tree_removable(&dir)?;
        fs::remove_dir_all(&dir)?;
        tracing::info!(id, "Removed container");
        Ok(())
    }

    /// Every container with its origin image and names.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `containers/` cannot be read.
    pub fn list_containers(&self) -> StevedoreResult<Vec<ContainerSummary>> {
        let dir = self.paths.containers();
        let mut containers = Vec::new();
        if !dir.is_dir() {
            return Ok(containers);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if link::is_link(&path) || !path.is_dir() {
                continue;
            }
            let Some(id) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let image = fs::read_to_string(path.join(IMAGE_NAME_FILE))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let names = self.container_names(&id)?;
            containers.push(ContainerSummary { id, image, names });
        }
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    /// Total size in bytes of the files under a container's ROOT.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::ContainerNotFound`] for an unknown id.
    pub fn container_size(&self, id: &str) -> StevedoreResult<u64> {
        let dir = self
            .container_dir(id)
            .ok_or_else(|| StevedoreError::ContainerNotFound { id: id.to_string() })?;
        Ok(WalkDir::new(dir.join(ROOT_DIR))
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum())
    }

    /// Whether a container's ROOT can be written to.
    #[must_use]
    pub fn is_writable_container(&self, id: &str) -> Writability {
        let root = self.paths.container_root(id);
        match fs::metadata(&root) {
            Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Writability::Writable,
            Ok(meta) if meta.is_dir() => Writability::ReadOnly,
            _ => Writability::Missing,
        }
    }
}

fn path_to_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn remove_if_exists(path: &Path) -> StevedoreResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn into_io(err: StevedoreError) -> io::Error {
    match err {
        StevedoreError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

fn tolerate(result: io::Result<()>, force: bool, path: &Path) -> StevedoreResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if force => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring removal failure");
            Ok(())
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Removal failed");
            Err(e.into())
        }
    }
}

#[cfg(unix)]
fn make_tree_removable(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            let mode = entry.metadata().map_err(io::Error::other)?.permissions().mode();
            if mode & 0o700 != 0o700 {
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))?;
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_tree_removable(_dir: &Path) -> io::Result<()> {
    Ok(())
}
