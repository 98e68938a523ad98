//! Import, export, save and load through the public API.

use std::fs;
use std::path::Path;

use stevedore_common::{StevedoreError, StevedorePaths};
use stevedore_image::archive::{ArchiveInput, ArchiveOutput, Archiver, NativeTar};
use stevedore_image::{ContainerBuilder, ImageSpec, LocalRepository, PlatformSelector, PortableImages};
use stevedore_oci::ArchiveManifestEntry;

fn repository(root: &Path) -> LocalRepository {
    let repo = LocalRepository::new(StevedorePaths::with_root(root));
    repo.ensure_layout().unwrap();
    repo
}

fn rootfs_tar(path: &Path, files: &[(&str, &str)]) {
    let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data.as_bytes()).unwrap();
    }
    builder.finish().unwrap();
}

fn image(spec: &str) -> ImageSpec {
    ImageSpec::parse(spec).unwrap()
}

#[test_log::test]
fn import_records_platform_and_single_layer() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir.path().join("store"));
    let tar = dir.path().join("fs.tar");
    rootfs_tar(&tar, &[("hello", "world")]);

    let tag = PortableImages::new(&repo)
        .import_tar(
            &ArchiveInput::File(tar.clone()),
            &image("imported/fs:v1"),
            Some(&PlatformSelector::parse("linux/arm/v7")),
        )
        .unwrap();

    assert_eq!(tag.platform_label(), "linux/arm/v7");
    let attrs = tag.image_attributes().unwrap().unwrap();
    assert_eq!(attrs.layers.len(), 1);
    let config = attrs.config.unwrap();
    assert_eq!(config["rootfs"]["diff_ids"].as_array().unwrap().len(), 1);
    assert!(config["created"].as_str().unwrap().ends_with('Z'));

    let again = PortableImages::new(&repo).import_tar(
        &ArchiveInput::File(tar),
        &image("imported/fs:v1"),
        None,
    );
    assert!(matches!(again, Err(StevedoreError::TagExists { .. })));
}

#[test_log::test]
fn import_of_missing_file_fails_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(dir.path());

    let result = PortableImages::new(&repo).import_tar(
        &ArchiveInput::File(dir.path().join("absent.tar")),
        &image("x:y"),
        None,
    );
    assert!(result.is_err());
    assert!(repo.select_tag("x", "y").is_none());
}

#[test_log::test]
fn save_then_load_preserves_layers() {
    let dir = tempfile::tempdir().unwrap();
    let source = repository(&dir.path().join("a"));
    let target = repository(&dir.path().join("b"));

    let tar = dir.path().join("fs.tar");
    rootfs_tar(&tar, &[("etc/motd", "hi"), ("bin/tool", "#!/bin/sh\n")]);
    PortableImages::new(&source)
        .import_tar(&ArchiveInput::File(tar), &image("app:1.0"), None)
        .unwrap();

    let archive = dir.path().join("saved.tar");
    let saved = PortableImages::new(&source)
        .save(&[image("app:1.0"), image("missing:1")], &ArchiveOutput::File(archive.clone()))
        .unwrap();
    assert_eq!(saved, vec!["app:1.0".to_string()]);

    let listing = NativeTar.list(&ArchiveInput::File(archive.clone())).unwrap();
    assert!(listing.iter().any(|p| p == Path::new("manifest.json")));
    assert!(listing.iter().any(|p| p == Path::new("repositories")));

    let loaded = PortableImages::new(&target)
        .load(&ArchiveInput::File(archive.clone()), None)
        .unwrap();
    assert_eq!(loaded, vec!["app:1.0".to_string()]);

    let before = source.require_tag("app", "1.0").unwrap().image_attributes().unwrap().unwrap();
    let after = target.require_tag("app", "1.0").unwrap().image_attributes().unwrap().unwrap();
    assert_eq!(before.layers.len(), after.layers.len());
    for (a, b) in before.layers.iter().zip(&after.layers) {
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }
    assert_eq!(before.config, after.config);

    // Loading again skips the existing tag.
    let reloaded = PortableImages::new(&target)
        .load(&ArchiveInput::File(archive.clone()), None)
        .unwrap();
    assert!(reloaded.is_empty());

    // An override keeps the tag under a new repository.
    let renamed = PortableImages::new(&target)
        .load(&ArchiveInput::File(archive), Some("mirror/app"))
        .unwrap();
    assert_eq!(renamed, vec!["mirror/app:1.0".to_string()]);
}

#[test_log::test]
fn import_rejects_tags_that_escape_the_repository() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir.path().join("store"));
    let tar = dir.path().join("fs.tar");
    rootfs_tar(&tar, &[("hello", "world")]);
    PortableImages::new(&repo)
        .import_tar(&ArchiveInput::File(tar.clone()), &image("keep/me:1"), None)
        .unwrap();

    assert!(matches!(
        ImageSpec::parse("alpine:.."),
        Err(StevedoreError::InvalidReference { .. })
    ));
    let forged = ImageSpec {
        repository: "alpine".to_string(),
        tag: "..".to_string(),
    };
    let result = PortableImages::new(&repo).import_tar(&ArchiveInput::File(tar), &forged, None);
    assert!(matches!(result, Err(StevedoreError::InvalidReference { .. })));
    assert!(!repo.paths().repos().join("TAG").exists());

    assert!(repo.remove_image("alpine", "..", true).is_err());
    assert!(repo.select_tag("keep/me", "1").is_some());
}

#[test_log::test]
fn save_refuses_existing_output_and_empty_selection() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir.path().join("store"));
    let out = dir.path().join("out.tar");

    let none = PortableImages::new(&repo).save(&[image("ghost:1")], &ArchiveOutput::File(out.clone()));
    assert!(none.is_err());

    fs::write(&out, b"keep").unwrap();
    let exists = PortableImages::new(&repo).save(&[image("ghost:1")], &ArchiveOutput::File(out.clone()));
    assert!(exists.is_err());
    assert_eq!(fs::read(&out).unwrap(), b"keep");
}

#[test_log::test]
fn load_skips_entries_with_missing_layers() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir.path().join("store"));

    let staging = dir.path().join("staging");
    fs::create_dir_all(staging.join("abc")).unwrap();
    rootfs_tar(&staging.join("abc/layer.tar"), &[("f", "1")]);
    let entries = vec![
        ArchiveManifestEntry {
            config: String::new(),
            repo_tags: vec!["good:1".to_string()],
            layers: vec!["abc/layer.tar".to_string()],
        },
        ArchiveManifestEntry {
            config: String::new(),
            repo_tags: vec!["bad:1".to_string()],
            layers: vec!["nope/layer.tar".to_string()],
        },
        ArchiveManifestEntry {
            config: String::new(),
            repo_tags: Vec::new(),
            layers: vec!["abc/layer.tar".to_string()],
        },
        ArchiveManifestEntry {
            config: String::new(),
            repo_tags: vec!["escape:..".to_string(), "a/../../x:1".to_string()],
            layers: vec!["abc/layer.tar".to_string()],
        },
    ];
    fs::write(staging.join("manifest.json"), serde_json::to_vec(&entries).unwrap()).unwrap();

    let archive = dir.path().join("in.tar");
    NativeTar
        .create(&staging, &ArchiveOutput::File(archive.clone()))
        .unwrap();

    let mut loaded = PortableImages::new(&repo)
        .load(&ArchiveInput::File(archive), None)
        .unwrap();
    loaded.sort();
    assert_eq!(loaded, vec!["IMPORTED:latest".to_string(), "good:1".to_string()]);
    assert!(repo.select_tag("bad", "1").is_none());
    assert!(!repo.paths().repos().join("TAG").exists());
    assert!(!repo.paths().root.join("x").exists());

    // Both images share one stored blob.
    assert_eq!(fs::read_dir(repo.paths().layers()).unwrap().count(), 1);
}

#[test_log::test]
fn export_archives_container_root() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir.path().join("store"));
    let tar = dir.path().join("fs.tar");
    rootfs_tar(&tar, &[("srv/index.html", "<h1>hi</h1>")]);
    PortableImages::new(&repo)
        .import_tar(&ArchiveInput::File(tar), &image("web:1"), None)
        .unwrap();
    let id = ContainerBuilder::new(&repo)
        .create_from_image("web", "1", None)
        .unwrap();
    repo.set_container_name(id.as_str(), "web1").unwrap();

    let out = dir.path().join("export.tar");
    PortableImages::new(&repo)
        .export_container("web1", &ArchiveOutput::File(out.clone()))
        .unwrap();

    let listing = NativeTar.list(&ArchiveInput::File(out)).unwrap();
    assert!(listing.iter().any(|p| p == Path::new("srv/index.html")));

    let missing = PortableImages::new(&repo)
        .export_container("nobody", &ArchiveOutput::File(dir.path().join("x.tar")));
    assert!(matches!(missing, Err(StevedoreError::ContainerNotFound { .. })));
}
