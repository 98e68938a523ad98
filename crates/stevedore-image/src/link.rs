//! Links from tags to shared blobs and from names to containers.
//!
//! On unix a link is a relative symbolic link. Elsewhere it is a small
//! record file whose first line is [`RECORD_MAGIC`] and whose second line
//! is the relative target. Both forms support create, resolve and
//! enumerate through this module only.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// First line of a link record file.
pub const RECORD_MAGIC: &str = "stevedore-link";

/// Create `link` pointing at `target`, stored as a path relative to the
/// link's directory.
///
/// # Errors
///
/// Fails if `link` already exists or cannot be written.
pub fn create(target: &Path, link: &Path) -> io::Result<()> {
    let base = link.parent().unwrap_or_else(|| Path::new("."));
    let relative = relative_path(target, base);
    create_raw(&relative, link)
}

#[cfg(unix)]
fn create_raw(relative: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(relative, link)
}

#[cfg(not(unix))]
fn create_raw(relative: &Path, link: &Path) -> io::Result<()> {
    use std::io::Write;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(link)?;
    writeln!(file, "{RECORD_MAGIC}")?;
    writeln!(file, "{}", relative.display())
}

/// Whether `path` is a link (symlink or record file).
#[must_use]
pub fn is_link(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => true,
        Ok(meta) if meta.is_file() => read_record(path).is_some(),
        _ => false,
    }
}

/// The stored target of a link, as written (relative).
///
/// # Errors
///
/// Fails if `path` is not a link.
pub fn read_target(path: &Path) -> io::Result<PathBuf> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return fs::read_link(path);
    }
    read_record(path).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a link: {}", path.display()),
        )
    })
}

/// The target of a link joined onto the link's directory.
///
/// # Errors
///
/// Fails if `path` is not a link.
pub fn resolve(path: &Path) -> io::Result<PathBuf> {
    let target = read_target(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(base.join(target))
}

/// Links directly inside `dir`, sorted by name.
///
/// # Errors
///
/// Returns any error reading the directory.
pub fn list(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut links = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_link(&path) {
            links.push(path);
        }
    }
    links.sort();
    Ok(links)
}

fn read_record(path: &Path) -> Option<PathBuf> {
    let meta = fs::metadata(path).ok()?;
    // Record files are tiny; anything bigger is a real blob.
    if meta.len() > 4096 {
        return None;
    }
    let content = fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    if lines.next()? != RECORD_MAGIC {
        return None;
    }
    lines.next().map(PathBuf::from)
}

/// Path of `target` relative to the directory `base`.
///
/// Both paths are compared component-wise; they must share the same kind
/// of prefix (both absolute or both relative to the same directory).
#[must_use]
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<Component<'_>> = normalize(target);
    let base: Vec<Component<'_>> = normalize(base);

    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

fn normalize(path: &Path) -> Vec<Component<'_>> {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
