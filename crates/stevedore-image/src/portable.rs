//! Portable image interchange: filesystem tar import, container export,
//! and the multi-layer save/load format.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};
use stevedore_common::{Digest, StevedoreError, StevedoreResult};
use stevedore_oci::archive::{
    JSON_FILE, LAYER_FILE, LAYER_VERSION, MANIFEST_FILE, REPOSITORIES_FILE, Repositories,
    VERSION_FILE,
};
use stevedore_oci::image::{ExecutionConfig, RootFs, media_types};
use stevedore_oci::{ArchiveManifestEntry, Descriptor, ImageConfig, RegistryManifest};

use crate::archive::{ArchiveInput, ArchiveOutput, Archiver, ExtractFilter, NativeTar};
use crate::platform::PlatformSelector;
use crate::reference::{ImageSpec, split_repo_tag};
use crate::repository::{LocalRepository, ManifestVersion, TagDir};

/// Repository name used when a loaded archive carries no tags.
pub const IMPORTED_REPOSITORY: &str = "IMPORTED";

/// Import, export, save and load against a [`LocalRepository`].
#[derive(Debug)]
pub struct PortableImages<'a, A = NativeTar> {
    repo: &'a LocalRepository,
    archiver: A,
}

impl<'a> PortableImages<'a, NativeTar> {
    /// Codec using the built-in tar implementation.
    #[must_use]
    pub const fn new(repo: &'a LocalRepository) -> Self {
        Self::with_archiver(repo, NativeTar)
    }
}

impl<'a, A: Archiver> PortableImages<'a, A> {
    /// Codec using a custom [`Archiver`].
    pub const fn with_archiver(repo: &'a LocalRepository, archiver: A) -> Self {
        Self { repo, archiver }
    }

    /// Store a filesystem tarball as a single-layer image.
    ///
    /// The config gets the current time, the given platform (host platform
    /// by default) and one diff id.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::TagExists`] if the tag is present, or an
    /// I/O error reading the tarball.
    pub fn import_tar(
        &self,
        input: &ArchiveInput,
        image: &ImageSpec,
        platform: Option<&PlatformSelector>,
    ) -> StevedoreResult<TagDir> {
        if self.repo.select_tag(&image.repository, &image.tag).is_some() {
            return Err(StevedoreError::TagExists {
                reference: image.to_string(),
            });
        }

        // Standard input is spooled so it can be hashed and copied.
        let spool;
        let tar_path = match input {
            ArchiveInput::File(path) => {
                if !path.is_file() {
                    return Err(StevedoreError::Archive {
                        message: format!("tar file does not exist: {}", path.display()),
                    });
                }
                path.as_path()
            }
            ArchiveInput::Stdin => {
                spool = tempfile::NamedTempFile::new()?;
                io::copy(&mut io::stdin().lock(), &mut spool.as_file())?;
                spool.path()
            }
        };

        let layer_digest = Digest::of_file(tar_path)?.to_string();
        let tag = self.repo.create_tag(&image.repository, &image.tag)?;
        tag.set_version(ManifestVersion::V2)?;
        let blob = self.repo.store_blob(tar_path, &layer_digest)?;
        tag.add_layer_link(&blob, None)?;
        let layer_size = fs::metadata(&blob)?.len();

        let platform = platform.cloned().unwrap_or_else(PlatformSelector::host);
        let or_unknown = |s: &str| {
            if s.is_empty() {
                "unknown".to_string()
            } else {
                s.to_string()
            }
        };
        let config = ImageConfig {
            created: Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            architecture: or_unknown(&platform.architecture),
            os: or_unknown(&platform.os),
            variant: (!platform.variant.is_empty()).then(|| platform.variant.clone()),
            config: Some(ExecutionConfig::default()),
            rootfs: RootFs {
                diff_ids: vec![layer_digest.clone()],
                ..RootFs::default()
            },
        };
        let config_json = serde_json::to_vec(&config)?;
        let config_digest = Digest::of_bytes(&config_json).to_string();
        tag.save_config(&config_json, &config_digest)?;

        let manifest = RegistryManifest::oci(
            Descriptor::new(media_types::CONFIG, config_digest, config_json.len() as u64),
            vec![Descriptor::new(media_types::LAYER_TAR, layer_digest, layer_size)],
        );
        tag.save_manifest(&manifest)?;

        tracing::info!(image = %image, "Imported image");
        Ok(tag)
    }

    /// Archive a container's ROOT tree.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::ContainerNotFound`] or an archive error.
    pub fn export_container(&self, name_or_id: &str, output: &ArchiveOutput) -> StevedoreResult<()> {
        let dir = self
            .repo
            .container_id(name_or_id)
            .and_then(|id| self.repo.container_dir(&id))
            .ok_or_else(|| StevedoreError::ContainerNotFound {
                id: name_or_id.to_string(),
            })?;
        tracing::info!(container = name_or_id, "Exporting container");
        self.archiver.create(&dir.join("ROOT"), output)
    }

    /// Load a save-format archive. Returns the `repo:tag` names created.
    ///
    /// With `repo_override`, every image is stored under that repository
    /// keeping its original tags. Existing tags and entries with missing
    /// layer files are skipped.
    ///
    /// # Errors
    ///
    /// Fails when the archive cannot be extracted or has no valid
    /// `manifest.json`.
    pub fn load(
        &self,
        input: &ArchiveInput,
        repo_override: Option<&str>,
    ) -> StevedoreResult<Vec<String>> {
        if let ArchiveInput::File(path) = input {
            if !path.is_file() {
                return Err(StevedoreError::Archive {
                    message: format!("image file does not exist: {}", path.display()),
                });
            }
        }

        let scratch = tempfile::Builder::new().prefix("stevedore-load-").tempdir()?;
        self.archiver
            .extract(input, scratch.path(), &ExtractFilter::none())?;

        let entries: Vec<ArchiveManifestEntry> = fs::read(scratch.path().join(MANIFEST_FILE))
            .map_err(StevedoreError::from)
            .and_then(|raw| Ok(serde_json::from_slice(&raw)?))
            .map_err(|e| StevedoreError::Manifest {
                message: format!("{MANIFEST_FILE} missing or invalid: {e}"),
            })?;

        let mut loaded = Vec::new();
        for entry in &entries {
            let Some(layers) = hash_layers(scratch.path(), entry) else {
                continue;
            };
            let config_json = read_config(scratch.path(), &entry.config);

            for (repository, tag) in destination_tags(&entry.repo_tags, repo_override) {
                match self.store_loaded(&repository, &tag, &layers, &config_json) {
                    Ok(reference) => loaded.push(reference),
                    Err(e) => tracing::error!(image = %format!("{repository}:{tag}"), error = %e, "Skipping image"),
                }
            }
        }
        Ok(loaded)
    }

    fn store_loaded(
        &self,
        repository: &str,
        tag: &str,
        layers: &[(PathBuf, String)],
        config_json: &[u8],
    ) -> StevedoreResult<String> {
        let image = ImageSpec::parse(&format!("{repository}:{tag}"))?;
        if self.repo.select_tag(&image.repository, &image.tag).is_some() {
            return Err(StevedoreError::TagExists {
                reference: image.to_string(),
            });
        }
        let tag_dir = self.repo.create_tag(&image.repository, &image.tag)?;
        tag_dir.set_version(ManifestVersion::V2)?;

        let mut descriptors = Vec::with_capacity(layers.len());
        for (path, digest) in layers {
            let blob = self.repo.store_blob(path, digest)?;
            tag_dir.add_layer_link(&blob, None)?;
            let size = fs::metadata(&blob)?.len();
            descriptors.push(Descriptor::new(media_types::LAYER_TAR, digest.clone(), size));
        }

        let config_digest = Digest::of_bytes(config_json).to_string();
        tag_dir.save_config(config_json, &config_digest)?;
        let manifest = RegistryManifest::oci(
            Descriptor::new(media_types::CONFIG, config_digest, config_json.len() as u64),
            descriptors,
        );
        tag_dir.save_manifest(&manifest)?;

        tracing::info!(image = %image, "Loaded image");
        Ok(image.to_string())
    }

    /// Write images in the save format. Returns the `repo:tag` names saved.
    ///
    /// Images that are missing or lack a v2 layer list are skipped.
    ///
    /// # Errors
    ///
    /// Refuses an existing output file, and fails when no image could be
    /// saved or the archive cannot be written.
    pub fn save(&self, images: &[ImageSpec], output: &ArchiveOutput) -> StevedoreResult<Vec<String>> {
        if let ArchiveOutput::File(path) = output {
            if fs::symlink_metadata(path).is_ok() {
                return Err(StevedoreError::Archive {
                    message: format!("output file already exists: {}", path.display()),
                });
            }
        }

        let scratch = tempfile::Builder::new().prefix("stevedore-save-").tempdir()?;
        let mut entries = Vec::new();
        let mut repositories = Repositories::new();

        for image in images {
            match self.stage_image(scratch.path(), image) {
                Ok(entry) => {
                    if let Some(top) = entry.layers.last().and_then(|l| l.split('/').next()) {
                        repositories
                            .entry(image.repository.clone())
                            .or_default()
                            .insert(image.tag.clone(), top.to_string());
                    }
                    entries.push(entry);
                }
                Err(e) => tracing::error!(image = %image, error = %e, "Skipping image"),
            }
        }

        if entries.is_empty() {
            return Err(StevedoreError::Archive {
                message: "no image could be saved".to_string(),
            });
        }

        fs::write(
            scratch.path().join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&entries)?,
        )?;
        fs::write(
            scratch.path().join(REPOSITORIES_FILE),
            serde_json::to_vec_pretty(&repositories)?,
        )?;
        self.archiver.create(scratch.path(), output)?;

        Ok(entries.iter().flat_map(|e| e.repo_tags.clone()).collect())
    }

    /// Copy one image's layers and config into the scratch directory.
    fn stage_image(&self, scratch: &Path, image: &ImageSpec) -> StevedoreResult<ArchiveManifestEntry> {
        let tag = self.repo.require_tag(&image.repository, &image.tag)?;
        let manifest = tag.load_manifest()?;
        let layers = manifest
            .layers
            .as_deref()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| StevedoreError::Manifest {
                message: format!("{image}: manifest has no v2 layer list"),
            })?;

        let mut layer_paths = Vec::with_capacity(layers.len());
        for layer in layers {
            let source = tag.blob_file(&layer.digest);
            if !source.is_file() {
                return Err(StevedoreError::MissingBlob {
                    digest: layer.digest.clone(),
                });
            }
            let id = layer
                .digest
                .strip_prefix(stevedore_common::digest::SHA256_PREFIX)
                .unwrap_or(&layer.digest);
            if id.is_empty() || id.contains(['/', '\\', ':']) || id.starts_with('.') {
                return Err(StevedoreError::Manifest {
                    message: format!("{image}: unusable layer digest {}", layer.digest),
                });
            }

            let layer_dir = scratch.join(id);
            fs::create_dir_all(&layer_dir)?;
            let dest = layer_dir.join(LAYER_FILE);
            if !dest.is_file() {
                fs::copy(&source, &dest)?;
            }
            fs::write(layer_dir.join(VERSION_FILE), LAYER_VERSION)?;
            fs::write(layer_dir.join(JSON_FILE), "{}")?;
            layer_paths.push(format!("{id}/{LAYER_FILE}"));
        }

        let config_json = manifest
            .config
            .as_ref()
            .and_then(|c| fs::read(tag.blob_file(&c.digest)).ok())
            .map_or_else(empty_object, |raw| normalize_config(&raw));
        let config_name = format!("{}.json", Digest::of_bytes(&config_json).hex());
        fs::write(scratch.join(&config_name), &config_json)?;

        Ok(ArchiveManifestEntry {
            config: config_name,
            repo_tags: vec![image.to_string()],
            layers: layer_paths,
        })
    }
}

/// Destination `(repository, tag)` pairs for a loaded entry.
///
/// - No override: the entry's own tags, or `IMPORTED:latest` without any.
/// - Override: each original tag moved to the override repository, or
///   `<override>:latest` without any.
#[must_use]
pub fn destination_tags(repo_tags: &[String], repo_override: Option<&str>) -> Vec<(String, String)> {
    let repo_override = repo_override.filter(|r| !r.is_empty());
    match (repo_override, repo_tags.is_empty()) {
        (Some(repo), true) => vec![(repo.to_string(), ImageSpec::DEFAULT_TAG.to_string())],
        (Some(repo), false) => repo_tags
            .iter()
            .map(|t| (repo.to_string(), split_repo_tag(t).1))
            .collect(),
        (None, true) => vec![(
            IMPORTED_REPOSITORY.to_string(),
            ImageSpec::DEFAULT_TAG.to_string(),
        )],
        (None, false) => repo_tags.iter().map(|t| split_repo_tag(t)).collect(),
    }
}

/// Layer files of an entry with their digests. `None` when any layer is
/// missing or the list is empty.
fn hash_layers(scratch: &Path, entry: &ArchiveManifestEntry) -> Option<Vec<(PathBuf, String)>> {
    if entry.layers.is_empty() {
        tracing::warn!(config = %entry.config, "Entry has no layers, skipping");
        return None;
    }
    let mut layers = Vec::with_capacity(entry.layers.len());
    for relative in &entry.layers {
        let Some(path) = contained(scratch, relative).filter(|p| p.is_file()) else {
            tracing::error!(layer = %relative, "Layer file missing, skipping entry");
            return None;
        };
        match Digest::of_file(&path) {
            Ok(digest) => layers.push((path, digest.to_string())),
            Err(e) => {
                tracing::error!(layer = %relative, error = %e, "Cannot read layer, skipping entry");
                return None;
            }
        }
    }
    Some(layers)
}

/// Re-serialize a config file, `{}` when it is absent or not JSON.
fn read_config(scratch: &Path, relative: &str) -> Vec<u8> {
    if relative.is_empty() {
        return empty_object();
    }
    contained(scratch, relative)
        .and_then(|path| fs::read(path).ok())
        .map_or_else(empty_object, |raw| normalize_config(&raw))
}

fn normalize_config(raw: &[u8]) -> Vec<u8> {
    serde_json::from_slice::<Value>(raw)
        .ok()
        .and_then(|v| serde_json::to_vec(&v).ok())
        .unwrap_or_else(empty_object)
}

fn empty_object() -> Vec<u8> {
    serde_json::to_vec(&Value::Object(Map::new())).unwrap_or_else(|_| b"{}".to_vec())
}

/// Join a relative archive path onto `base`, refusing escapes.
fn contained(base: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = base.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}
