//! Layer materialization.
//!
//! Layers are applied bottom-up onto one directory. Before a layer's
//! content is extracted, its whiteout markers are applied to what the lower
//! layers left behind:
//!
//! - `.wh..wh..opq` empties the directory holding it.
//! - `.wh.<name>` deletes the sibling `<name>`.
//!
//! Markers only act on directories reached without following a symlink.
//!
//! After extraction the tree is made user-accessible and any leftover
//! whiteout files are removed.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use stevedore_common::{StevedoreError, StevedoreResult};
use walkdir::WalkDir;

use crate::archive::{
    ArchiveInput, Archiver, ExtractFilter, NativeTar, OPAQUE_MARKER, WHITEOUT_PREFIX, is_whiteout,
};

/// Merges layer tarballs into a root tree.
#[derive(Debug, Clone, Default)]
pub struct LayerMaterializer<A = NativeTar> {
    archiver: A,
}

impl LayerMaterializer<NativeTar> {
    /// Materializer using the built-in tar implementation.
    #[must_use]
    pub fn new() -> Self {
        Self::with_archiver(NativeTar)
    }
}

impl<A: Archiver> LayerMaterializer<A> {
    /// Materializer using a custom [`Archiver`].
    pub const fn with_archiver(archiver: A) -> Self {
        Self { archiver }
    }

    /// Apply `layers` (base first) onto `dest`.
    ///
    /// Every layer is attempted even after a failure; the tree keeps
    /// whatever the successful layers produced.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::LayerExtraction`] when any layer failed.
    pub fn materialize(&self, layers: &[PathBuf], dest: &Path) -> StevedoreResult<()> {
        fs::create_dir_all(dest)?;

        let mut failed = 0;
        for layer in layers {
            tracing::info!(layer = %display_name(layer), "Extracting layer");
            if let Err(e) = self.apply_layer(layer, dest) {
                tracing::error!(layer = %layer.display(), error = %e, "Failed to extract layer");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(StevedoreError::LayerExtraction {
                failed,
                total: layers.len(),
            });
        }
        Ok(())
    }

    fn apply_layer(&self, layer: &Path, dest: &Path) -> StevedoreResult<()> {
        let input = ArchiveInput::File(layer.to_path_buf());
        let entries = self.archiver.list(&input)?;

        for entry in &entries {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let parent = entry.parent().unwrap_or_else(|| Path::new(""));
            let target = if name == OPAQUE_MARKER {
                None
            } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                if target.is_empty() {
                    tracing::warn!(entry = %entry.display(), "Ignoring whiteout without a name");
                    continue;
                }
                Some(target)
            } else {
                continue;
            };

            let Some(dir) = resolve_in_tree(dest, parent)? else {
                continue;
            };
            match target {
                None => {
                    tracing::debug!(dir = %parent.display(), "Opaque directory");
                    clear_dir(&dir)?;
                }
                Some(target) => {
                    tracing::debug!(path = %parent.join(target).display(), "Whiteout");
                    remove_path(&dir.join(target))?;
                }
            }
        }

        let extracted = self.archiver.extract(&input, dest, &ExtractFilter::layer());
        normalize_tree(dest)?;
        extracted
    }
}

/// Resolve `relative` under `root` one component at a time.
///
/// Yields `None` when a component is missing, is not a plain directory, or
/// would leave `root`.
fn resolve_in_tree(root: &Path, relative: &Path) -> io::Result<Option<PathBuf>> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::CurDir => continue,
            Component::Normal(part) => current.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                tracing::warn!(path = %relative.display(), "Ignoring whiteout outside the tree");
                return Ok(None);
            }
        }
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                tracing::warn!(path = %current.display(), "Ignoring whiteout below a non-directory");
                return Ok(None);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(current))
}

/// Empty a directory, keeping the directory itself.
fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

/// Remove a file, symlink or directory tree; a missing path is fine.
fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        make_user_writable(path, true)?;
        for entry in WalkDir::new(path).min_depth(1).contents_first(false) {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_dir() {
                make_user_writable(entry.path(), true)?;
            }
        }
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Give the owner access to every directory and file under `root` and drop
/// stray whiteout files.
fn normalize_tree(root: &Path) -> io::Result<()> {
    let mut stray = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            make_user_writable(entry.path(), true)?;
        } else {
            if is_whiteout(entry.path()) {
                stray.push(entry.path().to_path_buf());
                continue;
            }
            make_user_writable(entry.path(), false)?;
        }
    }
    for path in stray {
        tracing::debug!(path = %path.display(), "Removing stray whiteout");
        fs::remove_file(&path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_user_writable(path: &Path, is_dir: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let wanted = if is_dir { 0o700 } else { 0o600 };
    let mode = fs::symlink_metadata(path)?.permissions().mode();
    if mode & wanted != wanted {
        fs::set_permissions(path, fs::Permissions::from_mode((mode | wanted) & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_user_writable(path: &Path, _is_dir: bool) -> io::Result<()> {
    let mut perms = fs::symlink_metadata(path)?.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn display_name(layer: &Path) -> String {
    layer
        .file_name()
        .map_or_else(|| layer.display().to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tar::EntryType;

    fn layer(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (entry, data) in files {
            let mut header = tar::Header::new_gnu();
            if entry.ends_with('/') {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(0o755);
            } else {
                header.set_mode(0o644);
            }
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, entry, *data).unwrap();
        }
        builder.finish().unwrap();
        path
    }

    #[test]
    fn opaque_marker_resets_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(
            dir.path(),
            "base.tar",
            &[("dir/", b""), ("dir/file1", b"one"), ("dir/sub/deep", b"d")],
        );
        let top = layer(
            dir.path(),
            "top.tar",
            &[("dir/.wh..wh..opq", b""), ("dir/file2", b"two")],
        );

        let root = dir.path().join("ROOT");
        LayerMaterializer::new().materialize(&[base, top], &root).unwrap();

        assert!(!root.join("dir/file1").exists());
        assert!(!root.join("dir/sub").exists());
        assert_eq!(fs::read(root.join("dir/file2")).unwrap(), b"two");
        assert!(!root.join("dir/.wh..wh..opq").exists());
    }

    #[test]
    fn whiteout_removes_only_named_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(
            dir.path(),
            "base.tar",
            &[("dir/file1", b"one"), ("dir/keep", b"k")],
        );
        let top = layer(dir.path(), "top.tar", &[("dir/.wh.file1", b"")]);

        let root = dir.path().join("ROOT");
        LayerMaterializer::new().materialize(&[base, top], &root).unwrap();

        assert!(!root.join("dir/file1").exists());
        assert_eq!(fs::read(root.join("dir/keep")).unwrap(), b"k");
        assert!(!root.join("dir/.wh.file1").exists());
    }

    #[test]
    fn upper_layer_overwrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base.tar", &[("etc/motd", b"old")]);
        let top = layer(dir.path(), "top.tar", &[("etc/motd", b"new")]);

        let root = dir.path().join("ROOT");
        LayerMaterializer::new().materialize(&[base, top], &root).unwrap();
        assert_eq!(fs::read(root.join("etc/motd")).unwrap(), b"new");
    }

    #[test]
    fn failed_layer_does_not_stop_later_layers() {
        let dir = tempfile::tempdir().unwrap();
        let good = layer(dir.path(), "good.tar", &[("a", b"a")]);
        let missing = dir.path().join("missing.tar");
        let later = layer(dir.path(), "later.tar", &[("b", b"b")]);

        let root = dir.path().join("ROOT");
        let err = LayerMaterializer::new()
            .materialize(&[good, missing, later], &root)
            .unwrap_err();

        assert!(matches!(
            err,
            StevedoreError::LayerExtraction {
                failed: 1,
                total: 3
            }
        ));
        assert!(root.join("a").exists());
        assert!(root.join("b").exists());
    }

    #[test]
    fn nameless_whiteout_keeps_parent() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base.tar", &[("dir/file1", b"one")]);
        let top = layer(dir.path(), "top.tar", &[("dir/.wh.", b"")]);

        let root = dir.path().join("ROOT");
        LayerMaterializer::new().materialize(&[base, top], &root).unwrap();

        assert_eq!(fs::read(root.join("dir/file1")).unwrap(), b"one");
        assert!(!root.join("dir/.wh.").exists());
    }

    #[cfg(unix)]
    fn symlink_layer(dir: &Path, name: &str, link: &str, target: &Path) -> PathBuf {
        let path = dir.join(name);
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        builder.append_link(&mut header, link, target).unwrap();
        builder.finish().unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn whiteouts_do_not_follow_symlinked_directories() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("victim"), b"v").unwrap();
        fs::write(host.join("other"), b"o").unwrap();

        let base = symlink_layer(dir.path(), "base.tar", "dir", &host);
        let single = layer(dir.path(), "single.tar", &[("dir/.wh.victim", b"")]);
        let opaque = layer(dir.path(), "opaque.tar", &[("dir/.wh..wh..opq", b"")]);

        let root = dir.path().join("ROOT");
        LayerMaterializer::new()
            .materialize(&[base, single, opaque], &root)
            .unwrap();

        assert!(fs::symlink_metadata(root.join("dir")).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(host.join("victim")).unwrap(), b"v");
        assert_eq!(fs::read(host.join("other")).unwrap(), b"o");
    }

    #[cfg(unix)]
    #[test]
    fn whiteout_of_symlink_removes_only_the_link() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host");
        fs::create_dir_all(&host).unwrap();
        fs::write(host.join("kept"), b"k").unwrap();

        let base = symlink_layer(dir.path(), "base.tar", "dir", &host);
        let top = layer(dir.path(), "top.tar", &[(".wh.dir", b"")]);

        let root = dir.path().join("ROOT");
        LayerMaterializer::new().materialize(&[base, top], &root).unwrap();

        assert!(fs::symlink_metadata(root.join("dir")).is_err());
        assert_eq!(fs::read(host.join("kept")).unwrap(), b"k");
    }

    #[cfg(unix)]
    #[test]
    fn read_only_entries_become_user_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o555);
        header.set_size(0);
        builder.append_data(&mut header, "locked/", &b""[..]).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o4444);
        header.set_size(1);
        builder.append_data(&mut header, "locked/file", &b"x"[..]).unwrap();
        builder.finish().unwrap();

        let root = dir.path().join("ROOT");
        LayerMaterializer::new().materialize(&[path], &root).unwrap();

        let dir_mode = fs::metadata(root.join("locked")).unwrap().permissions().mode();
        let file_mode = fs::metadata(root.join("locked/file")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o700, 0o700);
        assert_eq!(file_mode & 0o600, 0o600);
        assert_eq!(file_mode & 0o4000, 0);
    }
}
