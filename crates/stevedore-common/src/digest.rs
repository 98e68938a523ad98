//! Content digests and file integrity checks.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::StevedoreError;

/// Algorithm prefix of every digest Stevedore produces.
pub const SHA256_PREFIX: &str = "sha256:";

/// A SHA-256 content digest (`sha256:<64 hex>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hash: String,
}

impl Digest {
    /// Parse a `sha256:<hex>` string.
    ///
    /// Returns `None` for anything that does not have exactly that shape,
    /// including other algorithms and truncated hashes.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let hash = value.strip_prefix(SHA256_PREFIX)?;
        if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self {
                hash: hash.to_ascii_lowercase(),
            })
        } else {
            None
        }
    }

    /// Digest of an in-memory buffer.
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            hash: hex::encode(Sha256::digest(data)),
        }
    }

    /// Digest of a reader, consumed to the end.
    ///
    /// # Errors
    ///
    /// Returns any read error.
    pub fn of_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self {
            hash: hex::encode(hasher.finalize()),
        })
    }

    /// Digest of a file's contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn of_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::of_reader(BufReader::new(File::open(path)?))
    }

    /// The hex-encoded hash without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256_PREFIX}{}", self.hash)
    }
}

impl FromStr for Digest {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| StevedoreError::InvalidReference {
            reference: s.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = StevedoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// Check that the file at `path` hashes to `digest`.
///
/// A path that is not a regular file never verifies. A `digest` that is not
/// of the `sha256:<hex>` shape cannot be checked and is accepted as is.
#[must_use]
pub fn verify_file(path: &Path, digest: &str) -> bool {
    if !path.is_file() {
        return false;
    }
    let Some(expected) = Digest::parse(digest) else {
        tracing::debug!(digest, "Digest not verifiable, accepting");
        return true;
    };
    match Digest::of_file(path) {
        Ok(actual) => actual == expected,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to hash file");
            false
        }
    }
}
