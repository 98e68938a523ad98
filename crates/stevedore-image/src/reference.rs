//! Image reference parsing.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use stevedore_common::{StevedoreError, StevedoreResult};

use crate::config::RegistryConfig;

static REPO_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_./:-]+$").expect("valid repo pattern"));
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid tag pattern"));
static DIGEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+:[a-z0-9]+$").expect("valid digest pattern"));
static LAYER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]+@[a-z0-9]+:[a-z0-9]+$").expect("valid layer pattern"));

/// A local image spec: repository name as typed plus a tag or digest.
///
/// The repository is kept verbatim (`alpine`, `quay.io/org/app`); it names
/// the directory in the local repository. [`RemoteReference`] derives the
/// registry-side name from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub tag: String,
}

impl ImageSpec {
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse `repo[:tag]` or `repo@digest`.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::InvalidReference`] for empty parts,
    /// characters outside the allowed set, a tag that is not a plain tag
    /// name, or a repository with `.`/`..` segments.
    ///
    /// Examples:
    /// - `alpine` -> `alpine`, `latest`
    /// - `alpine:3.19` -> `alpine`, `3.19`
    /// - `localhost:5000/app` -> `localhost:5000/app`, `latest`
    /// - `busybox@sha256:abc` -> `busybox`, `sha256:abc`
    pub fn parse(spec: &str) -> StevedoreResult<Self> {
        let spec = spec.trim();
        let invalid = || StevedoreError::InvalidReference {
            reference: spec.to_string(),
        };

        if !(is_repo_name(spec) || is_layer_name(spec)) {
            return Err(invalid());
        }

        let (repository, tag, tag_ok) = match spec.split_once('@') {
            Some((repo, digest)) => (
                repo.to_string(),
                digest.to_string(),
                DIGEST_RE.is_match(digest),
            ),
            None => {
                let (repo, tag) = split_repo_tag(spec);
                let tag_ok = TAG_RE.is_match(&tag);
                (repo, tag, tag_ok)
            }
        };
        if !tag_ok || !repository.split('/').all(is_plain_segment) {
            return Err(invalid());
        }

        Ok(Self { repository, tag })
    }

    /// The `repo:tag` string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageSpec {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split `repo:tag`, defaulting the tag to `latest`.
///
/// A trailing `:suffix` only counts as a tag when it holds no `/`, so a
/// registry port (`host:5000/img`) stays part of the repository.
#[must_use]
pub fn split_repo_tag(reference: &str) -> (String, String) {
    if let Some((repo, tag)) = reference.rsplit_once(':') {
        if !tag.contains('/') {
            return (repo.to_string(), tag.to_string());
        }
    }
    (reference.to_string(), ImageSpec::DEFAULT_TAG.to_string())
}

/// Whether `name` is a syntactically valid repository spec.
#[must_use]
pub fn is_repo_name(name: &str) -> bool {
    REPO_NAME_RE.is_match(name)
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".."
}

/// Whether `name` is a `repo@algo:hex` spec.
#[must_use]
pub fn is_layer_name(name: &str) -> bool {
    LAYER_NAME_RE.is_match(name)
}

/// Where a repository lives on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReference {
    /// Registry host, when the name started with one.
    pub registry: Option<String>,
    /// Repository path on that registry.
    pub repository: String,
}

impl RemoteReference {
    /// Split a possibly host-prefixed repository into host and remote path.
    ///
    /// The first segment is a host when it contains a dot and more segments
    /// follow. A lone remaining segment gets the `library/` prefix when no
    /// host was given or the host is a Docker Hub alias.
    #[must_use]
    pub fn parse(repository: &str) -> Self {
        let mut components: Vec<&str> = repository.split('/').collect();
        let mut registry = None;
        if components.len() >= 2 && components[0].contains('.') {
            registry = Some(components.remove(0).to_string());
        }

        let mut remote = components.join("/");
        if components.len() == 1 && components[0] != "library" {
            let hub = registry.as_deref().is_none_or(is_docker_hub);
            if hub {
                remote = format!("library/{remote}");
            }
        }

        Self {
            registry,
            repository: remote,
        }
    }

    /// `(registry URL, index URL)` for the named host, if any.
    #[must_use]
    pub fn endpoints(&self, config: &RegistryConfig) -> Option<(String, String)> {
        self.registry
            .as_deref()
            .map(|host| config.endpoints_for(host))
    }
}

fn is_docker_hub(host: &str) -> bool {
    host.contains("docker.io") || host.contains("docker.com")
}
