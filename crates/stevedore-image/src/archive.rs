//! Tar listing, extraction and creation.
//!
//! Everything that reads or writes tar streams goes through [`Archiver`];
//! [`NativeTar`] is the implementation backed by the `tar` crate.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use stevedore_common::{StevedoreError, StevedoreResult};
use tar::EntryType;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Whiteout prefix of a layer entry's basename.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Basename of the opaque-directory marker.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Where a tar stream is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveInput {
    /// A file on disk.
    File(PathBuf),
    /// Standard input.
    Stdin,
}

impl ArchiveInput {
    /// `-` means standard input.
    #[must_use]
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Self::Stdin
        } else {
            Self::File(PathBuf::from(arg))
        }
    }
}

/// Where a tar stream is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutput {
    /// A file on disk, created or truncated.
    File(PathBuf),
    /// Standard output.
    Stdout,
}

impl ArchiveOutput {
    /// `-` means standard output.
    #[must_use]
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Self::Stdout
        } else {
            Self::File(PathBuf::from(arg))
        }
    }
}

/// Entries to leave out while extracting.
#[derive(Debug, Clone, Default)]
pub struct ExtractFilter {
    /// Relative directories whose contents are skipped.
    pub exclude_dirs: Vec<PathBuf>,
    /// Skip entries whose basename starts with `.wh.`.
    pub skip_whiteouts: bool,
    /// Skip block devices, character devices and fifos.
    pub skip_devices: bool,
}

impl ExtractFilter {
    /// Filter for image layers: no device nodes, no udev device files and
    /// no whiteout markers.
    #[must_use]
    pub fn layer() -> Self {
        Self {
            exclude_dirs: vec![PathBuf::from("dev"), PathBuf::from("etc/udev/devices")],
            skip_whiteouts: true,
            skip_devices: true,
        }
    }

    /// Extract everything.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    fn allows(&self, path: &Path, entry_type: EntryType) -> bool {
        if self.skip_devices
            && matches!(entry_type, EntryType::Block | EntryType::Char | EntryType::Fifo)
        {
            return false;
        }
        if self.skip_whiteouts && is_whiteout(path) {
            return false;
        }
        !self
            .exclude_dirs
            .iter()
            .any(|dir| path.starts_with(dir) && path != dir.as_path())
    }
}

/// Whether the basename of `path` carries the whiteout prefix.
#[must_use]
pub fn is_whiteout(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(WHITEOUT_PREFIX))
}

/// Tar capability used by the materializer and the portable codec.
pub trait Archiver {
    /// Entry paths of an archive, normalized to relative form.
    ///
    /// # Errors
    ///
    /// Fails when the stream is not a readable tar.
    fn list(&self, input: &ArchiveInput) -> StevedoreResult<Vec<PathBuf>>;

    /// Extract an archive into `dest` honoring `filter`.
    ///
    /// # Errors
    ///
    /// Fails on the first entry that cannot be written.
    fn extract(
        &self,
        input: &ArchiveInput,
        dest: &Path,
        filter: &ExtractFilter,
    ) -> StevedoreResult<()>;

    /// Archive the contents of `src` (not `src` itself).
    ///
    /// # Errors
    ///
    /// Fails when `src` cannot be read or the output cannot be written.
    fn create(&self, src: &Path, output: &ArchiveOutput) -> StevedoreResult<()>;
}

/// [`Archiver`] backed by the `tar` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTar;

impl NativeTar {
    fn open(input: &ArchiveInput) -> StevedoreResult<tar::Archive<Box<dyn Read>>> {
        let reader: Box<dyn BufRead> = match input {
            ArchiveInput::File(path) => Box::new(BufReader::new(File::open(path).map_err(
                |e| archive_error(format!("Failed to open {}", path.display()), &e),
            )?)),
            ArchiveInput::Stdin => Box::new(BufReader::new(io::stdin())),
        };
        Ok(tar::Archive::new(decompress(reader)?))
    }
}

impl Archiver for NativeTar {
    fn list(&self, input: &ArchiveInput) -> StevedoreResult<Vec<PathBuf>> {
        let mut archive = Self::open(input)?;
        let mut paths = Vec::new();
        let entries = archive
            .entries()
            .map_err(|e| archive_error("Failed to read archive", &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| archive_error("Corrupt archive entry", &e))?;
            let path = entry
                .path()
                .map_err(|e| archive_error("Invalid entry path", &e))?;
            if let Some(path) = normalize_entry_path(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn extract(
        &self,
        input: &ArchiveInput,
        dest: &Path,
        filter: &ExtractFilter,
    ) -> StevedoreResult<()> {
        fs::create_dir_all(dest)?;
        let mut archive = Self::open(input)?;
        archive.set_preserve_permissions(false);
        archive.set_preserve_ownerships(false);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(false);
        archive.set_overwrite(true);

        let mut directories = Vec::new();
        let entries = archive
            .entries()
            .map_err(|e| archive_error("Failed to read archive", &e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| archive_error("Corrupt archive entry", &e))?;
            let raw = entry
                .path()
                .map_err(|e| archive_error("Invalid entry path", &e))?
                .into_owned();
            let Some(path) = normalize_entry_path(&raw) else {
                continue;
            };
            let entry_type = entry.header().entry_type();
            if !filter.allows(&path, entry_type) {
                tracing::trace!(path = %path.display(), "Skipping filtered entry");
                continue;
            }
            if entry_type == EntryType::Directory {
                directories.push(entry);
                continue;
            }
            entry
                .unpack_in(dest)
                .map_err(|e| archive_error(format!("Failed to unpack {}", path.display()), &e))?;
        }

        // Deepest first, so a read-only parent does not block its children.
        directories.sort_by(|a, b| b.path_bytes().cmp(&a.path_bytes()));
        for mut dir in directories {
            dir.unpack_in(dest)
                .map_err(|e| archive_error("Failed to unpack directory", &e))?;
        }
        Ok(())
    }

    fn create(&self, src: &Path, output: &ArchiveOutput) -> StevedoreResult<()> {
        let writer: Box<dyn Write> = match output {
            ArchiveOutput::File(path) => Box::new(BufWriter::new(File::create(path).map_err(
                |e| archive_error(format!("Failed to create {}", path.display()), &e),
            )?)),
            ArchiveOutput::Stdout => Box::new(BufWriter::new(io::stdout().lock())),
        };

        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);

        let mut children: Vec<_> = fs::read_dir(src)?.collect::<Result<_, _>>()?;
        children.sort_by_key(fs::DirEntry::file_name);
        for child in children {
            let name = child.file_name();
            let path = child.path();
            let result = if child.file_type()?.is_dir() {
                builder.append_dir_all(&name, &path)
            } else {
                builder.append_path_with_name(&path, &name)
            };
            result.map_err(|e| archive_error(format!("Failed to add {}", path.display()), &e))?;
        }

        let mut writer = builder
            .into_inner()
            .map_err(|e| archive_error("Failed to finish archive", &e))?;
        writer.flush()?;
        Ok(())
    }
}

/// Wrap a reader in a gzip or zstd decoder when its first bytes say so.
fn decompress<'a>(mut reader: Box<dyn BufRead + 'a>) -> StevedoreResult<Box<dyn Read + 'a>> {
    let head = reader
        .fill_buf()
        .map_err(|e| archive_error("Failed to read archive", &e))?;
    if head.starts_with(GZIP_MAGIC) {
        tracing::trace!("Detected gzip layer");
        Ok(Box::new(GzDecoder::new(reader)))
    } else if head.starts_with(ZSTD_MAGIC) {
        tracing::trace!("Detected zstd layer");
        Ok(Box::new(
            zstd::stream::read::Decoder::with_buffer(reader)
                .map_err(|e| archive_error("Failed to open zstd stream", &e))?,
        ))
    } else {
        Ok(Box::new(reader))
    }
}

/// Keep only the normal components of an entry path.
///
/// Returns `None` for entries that name the archive root itself
/// (`./`, `/`) or try to escape it.
fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn archive_error(context: impl std::fmt::Display, err: &io::Error) -> StevedoreError {
    StevedoreError::Archive {
        message: format!("{context}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tar(path: &Path, entries: &[(&str, EntryType, &[u8])]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, kind, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*kind);
            header.set_size(data.len() as u64);
            header.set_mode(if *kind == EntryType::Directory { 0o755 } else { 0o644 });
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(
            normalize_entry_path(Path::new("./etc/passwd")),
            Some(PathBuf::from("etc/passwd"))
        );
        assert_eq!(normalize_entry_path(Path::new("./")), None);
        assert_eq!(normalize_entry_path(Path::new("../escape")), None);
    }

    #[test]
    fn layer_filter() {
        let filter = ExtractFilter::layer();
        assert!(!filter.allows(Path::new("dev/null"), EntryType::Regular));
        assert!(filter.allows(Path::new("dev"), EntryType::Directory));
        assert!(!filter.allows(Path::new("etc/udev/devices/x"), EntryType::Regular));
        assert!(!filter.allows(Path::new("a/.wh.b"), EntryType::Regular));
        assert!(!filter.allows(Path::new("pipe"), EntryType::Fifo));
        assert!(filter.allows(Path::new("devel/file"), EntryType::Regular));
        assert!(ExtractFilter::none().allows(Path::new("dev/null"), EntryType::Regular));
    }

    #[test]
    fn list_and_extract() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("layer.tar");
        build_tar(
            &tar_path,
            &[
                ("etc", EntryType::Directory, b""),
                ("etc/hostname", EntryType::Regular, b"box\n"),
                ("dev/console", EntryType::Regular, b"x"),
                ("etc/.wh.old", EntryType::Regular, b""),
            ],
        );

        let input = ArchiveInput::File(tar_path);
        let listed = NativeTar.list(&input).unwrap();
        assert_eq!(listed.len(), 4);
        assert!(listed.contains(&PathBuf::from("etc/.wh.old")));

        let dest = dir.path().join("root");
        NativeTar
            .extract(&input, &dest, &ExtractFilter::layer())
            .unwrap();
        assert_eq!(fs::read(dest.join("etc/hostname")).unwrap(), b"box\n");
        assert!(!dest.join("dev/console").exists());
        assert!(!dest.join("etc/.wh.old").exists());
    }

    #[test]
    fn extracts_gzip_layers() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("layer.tar.gz");
        let encoder = flate2::write::GzEncoder::new(
            File::create(&gz_path).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        builder.append_data(&mut header, "hi", &b"hi"[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = dir.path().join("out");
        NativeTar
            .extract(&ArchiveInput::File(gz_path), &dest, &ExtractFilter::none())
            .unwrap();
        assert_eq!(fs::read(dest.join("hi")).unwrap(), b"hi");
    }

    #[test]
    fn create_has_no_dot_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("manifest.json"), b"[]").unwrap();
        fs::write(src.join("sub/file"), b"x").unwrap();

        let out = dir.path().join("out.tar");
        NativeTar
            .create(&src, &ArchiveOutput::File(out.clone()))
            .unwrap();

        let listed = NativeTar.list(&ArchiveInput::File(out)).unwrap();
        assert!(listed.contains(&PathBuf::from("manifest.json")));
        assert!(listed.contains(&PathBuf::from("sub/file")));
    }

    #[test]
    fn arg_parsing() {
        assert_eq!(ArchiveInput::from_arg("-"), ArchiveInput::Stdin);
        assert_eq!(
            ArchiveOutput::from_arg("x.tar"),
            ArchiveOutput::File(PathBuf::from("x.tar"))
        );
    }
}
