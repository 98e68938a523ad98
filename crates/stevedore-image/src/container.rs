//! Container creation from stored images.

use stevedore_common::{ContainerId, StevedoreError, StevedoreResult};

use crate::archive::{Archiver, NativeTar};
use crate::layer::LayerMaterializer;
use crate::repository::LocalRepository;

/// Creates containers by materializing an image into `containers/<id>/ROOT`.
#[derive(Debug)]
pub struct ContainerBuilder<'a, A = NativeTar> {
    repo: &'a LocalRepository,
    materializer: LayerMaterializer<A>,
}

impl<'a> ContainerBuilder<'a, NativeTar> {
    /// Builder using the built-in tar implementation.
    #[must_use]
    pub fn new(repo: &'a LocalRepository) -> Self {
        Self::with_archiver(repo, NativeTar)
    }
}

impl<'a, A: Archiver> ContainerBuilder<'a, A> {
    /// Builder using a custom [`Archiver`].
    pub const fn with_archiver(repo: &'a LocalRepository, archiver: A) -> Self {
        Self {
            repo,
            materializer: LayerMaterializer::with_archiver(archiver),
        }
    }

    /// Create a container from `repository:tag`.
    ///
    /// A fresh id is generated unless one is given. The container directory
    /// is kept even when some layers fail to extract.
    ///
    /// # Errors
    ///
    /// - [`StevedoreError::ImageNotFound`] for an unknown tag.
    /// - [`StevedoreError::Manifest`] when the image has no usable layers or
    ///   config.
    /// - [`StevedoreError::ContainerExists`] for a taken id.
    /// - [`StevedoreError::LayerExtraction`] when a layer failed.
    pub fn create_from_image(
        &self,
        repository: &str,
        tag: &str,
        id: Option<ContainerId>,
    ) -> StevedoreResult<ContainerId> {
        let tag_dir = self.repo.require_tag(repository, tag)?;
        let attrs = tag_dir
            .image_attributes()?
            .ok_or_else(|| StevedoreError::Manifest {
                message: format!("{}: layers unavailable", tag_dir.reference()),
            })?;
        let config = attrs.config.ok_or_else(|| StevedoreError::Manifest {
            message: format!("{}: image config unavailable", tag_dir.reference()),
        })?;

        let id = id.unwrap_or_else(ContainerId::generate);
        let dir = self.repo.create_container(repository, tag, &id)?;
        self.repo.save_container_json(&id, &config)?;

        tracing::info!(id = %id, image = %tag_dir.reference(), "Creating container");
        if let Err(e) = self.materializer.materialize(&attrs.layers, &dir.join("ROOT")) {
            tracing::error!(id = %id, error = %e, "Container created with extraction errors");
            return Err(e);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portable::PortableImages;
    use crate::archive::ArchiveInput;
    use crate::reference::ImageSpec;
    use std::fs;
    use stevedore_common::StevedorePaths;

    fn layer_tar(path: &std::path::Path, name: &str, data: &[u8]) {
        let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data).unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn creates_container_from_imported_image() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(StevedorePaths::with_root(dir.path().join("st")));
        repo.ensure_layout().unwrap();

        let tar = dir.path().join("rootfs.tar");
        layer_tar(&tar, "etc/os-release", b"ID=test\n");
        let image = ImageSpec::parse("local/test:1").unwrap();
        PortableImages::new(&repo)
            .import_tar(&ArchiveInput::File(tar), &image, None)
            .unwrap();

        let id = ContainerBuilder::new(&repo)
            .create_from_image("local/test", "1", None)
            .unwrap();

        let root = repo.paths().container_root(id.as_str());
        assert_eq!(fs::read(root.join("etc/os-release")).unwrap(), b"ID=test\n");
        let config = repo.container_json(id.as_str()).unwrap().unwrap();
        assert_eq!(config["rootfs"]["type"], "layers");
        assert_eq!(repo.list_containers().unwrap()[0].image, "local/test:1");
    }

    #[test]
    fn unknown_image_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(StevedorePaths::with_root(dir.path()));
        repo.ensure_layout().unwrap();
        assert!(matches!(
            ContainerBuilder::new(&repo).create_from_image("nope", "latest", None),
            Err(StevedoreError::ImageNotFound { .. })
        ));
    }
}
