//! Container ID generation and container name validation.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{StevedoreError, StevedoreResult};

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]+$").expect("valid name pattern"));

/// A container ID.
///
/// Generated IDs are hyphenated UUID v4 strings. Any ID read back from disk
/// must still be a single path component of alphanumerics and hyphens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidContainerId`] if the ID is empty,
    /// too long or has characters other than ASCII alphanumerics and `-`.
    pub fn new(id: impl Into<String>) -> StevedoreResult<Self> {
        let id = id.into();
        if id.is_empty()
            || id.len() > Self::MAX_LENGTH
            || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(StevedoreError::InvalidContainerId { id });
        }
        Ok(Self(id))
    }

    /// Generate a new random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated container name alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    /// Validate and wrap a container name.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidContainerName`] when the name is
    /// shorter than two characters or leaves the allowed character set.
    pub fn new(name: impl Into<String>) -> StevedoreResult<Self> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(StevedoreError::InvalidContainerName { name })
        }
    }

    /// Whether `name` may be used as a container alias.
    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        NAME_RE.is_match(name)
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerName {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_uuids() {
        let id1 = ContainerId::generate();
        let id2 = ContainerId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 36);
        assert!(ContainerId::new(id1.as_str()).is_ok());
    }

    #[test]
    fn invalid_container_ids() {
        assert!(matches!(
            ContainerId::new("../etc"),
            Err(StevedoreError::InvalidContainerId { .. })
        ));
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("a/b").is_err());
        assert!(ContainerId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn valid_names() {
        assert!(ContainerName::new("myapp").is_ok());
        assert!(ContainerName::new("my_app.v1-2").is_ok());
        assert!(ContainerName::new("9lives").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(ContainerName::new("").is_err());
        assert!(ContainerName::new("a").is_err());
        assert!(ContainerName::new("-app").is_err());
        assert!(ContainerName::new("my app").is_err());
        assert!(ContainerName::new("my/app").is_err());
    }
}
