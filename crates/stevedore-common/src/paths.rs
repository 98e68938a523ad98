//! On-disk layout of a local Stevedore repository.

use std::path::PathBuf;

use crate::error::{StevedoreError, StevedoreResult};

/// Environment variable overriding the repository root.
pub const ROOT_ENV: &str = "STEVEDORE_DIR";

/// Directory name used under the home directory when no root is given.
pub const DEFAULT_DIR_NAME: &str = ".stevedore";

/// Paths of a local repository.
///
/// Built once at process start and handed to the repository; nothing in
/// the library reads the environment on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StevedorePaths {
    /// Top directory of the repository.
    pub root: PathBuf,
}

impl StevedorePaths {
    /// Paths rooted at `~/.stevedore` (or `./.stevedore` without a home).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths rooted at a custom directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Image repositories: `repos/<repo-path>/<tag>/`.
    #[must_use]
    pub fn repos(&self) -> PathBuf {
        self.root.join("repos")
    }

    /// Shared blob store: `layers/<digest>`.
    #[must_use]
    pub fn layers(&self) -> PathBuf {
        self.root.join("layers")
    }

    /// Blob file by digest.
    #[must_use]
    pub fn layer(&self, digest: &str) -> PathBuf {
        self.layers().join(digest)
    }

    /// Containers and their name aliases.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Merged filesystem of a container.
    #[must_use]
    pub fn container_root(&self, id: &str) -> PathBuf {
        self.container(id).join("ROOT")
    }

    /// Directory of an image repository.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidReference`] unless every `/`-separated
    /// segment of `repository` is a plain name.
    pub fn repository(&self, repository: &str) -> StevedoreResult<PathBuf> {
        if !repository.split('/').all(is_plain_segment) {
            return Err(StevedoreError::InvalidReference {
                reference: repository.to_string(),
            });
        }
        Ok(self.repos().join(repository))
    }

    /// Tag directory of an image.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidReference`] when either part would
    /// resolve outside `repos/`.
    pub fn tag(&self, repository: &str, tag: &str) -> StevedoreResult<PathBuf> {
        if !is_plain_segment(tag) {
            return Err(StevedoreError::InvalidReference {
                reference: format!("{repository}:{tag}"),
            });
        }
        Ok(self.repository(repository)?.join(tag))
    }

    /// All top-level directories, in creation order.
    #[must_use]
    pub fn layout(&self) -> [PathBuf; 4] {
        [
            self.root.clone(),
            self.repos(),
            self.layers(),
            self.containers(),
        ]
    }
}

impl Default for StevedorePaths {
    fn default() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_DIR_NAME);
        Self { root }
    }
}

/// A single non-empty path component other than `.` and `..`.
fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = StevedorePaths::with_root("/tmp/stevedore-test");
        assert_eq!(paths.repos(), PathBuf::from("/tmp/stevedore-test/repos"));
        assert_eq!(
            paths.container_root("abc"),
            PathBuf::from("/tmp/stevedore-test/containers/abc/ROOT")
        );
    }

    #[test]
    fn layer_path_keeps_algorithm_prefix() {
        let paths = StevedorePaths::with_root("/srv/st");
        assert_eq!(
            paths.layer("sha256:abc123"),
            PathBuf::from("/srv/st/layers/sha256:abc123")
        );
    }

    #[test]
    fn tag_path_nests_repository() {
        let paths = StevedorePaths::with_root("/srv/st");
        assert_eq!(
            paths.tag("library/alpine", "3.19").unwrap(),
            PathBuf::from("/srv/st/repos/library/alpine/3.19")
        );
    }

    #[test]
    fn tag_path_stays_under_repos() {
        let paths = StevedorePaths::with_root("/srv/st");
        assert!(paths.tag("alpine", "..").is_err());
        assert!(paths.tag("alpine", ".").is_err());
        assert!(paths.tag("alpine", "").is_err());
        assert!(paths.tag("a/../../x", "1").is_err());
        assert!(paths.tag("/etc", "1").is_err());
        assert!(paths.repository("team//app").is_err());
        assert!(paths.tag("localhost:5000/app", "sha256:abc").is_ok());
    }

    #[test]
    fn default_root_ends_with_dir_name() {
        assert!(StevedorePaths::new().root.ends_with(DEFAULT_DIR_NAME));
    }
}
