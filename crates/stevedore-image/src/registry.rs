//! Docker/OCI v2 registry client.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use stevedore_common::digest::verify_file;
use stevedore_common::{StevedoreError, StevedoreResult};
use stevedore_oci::image::media_types;
use stevedore_oci::{ManifestKind, RegistryManifest};
use tokio::io::AsyncWriteExt;

use crate::config::RegistryConfig;
use crate::platform::PlatformSelector;
use crate::reference::{ImageSpec, RemoteReference};
use crate::repository::{LocalRepository, ManifestVersion, TagDir};

static CHALLENGE_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_]+)\s*=\s*(?:"([^"]*)"|([^,\s]+))"#).expect("valid challenge pattern")
});

/// Cache-versus-network choice for layer blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullPolicy {
    /// Use a valid cached blob, download otherwise.
    #[default]
    Missing,
    /// Always download.
    Always,
    /// Never download; fail when the blob is not cached and valid.
    Never,
}

impl FromStr for PullPolicy {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "missing" | "reuse" => Ok(Self::Missing),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            _ => Err(StevedoreError::InvalidPullPolicy {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Missing => "missing",
            Self::Always => "always",
            Self::Never => "never",
        })
    }
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Token endpoint.
    pub realm: String,
    /// Service name, if given.
    pub service: Option<String>,
    /// Requested scope, if given.
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse a challenge header. Returns `None` for non-bearer schemes and
    /// challenges without a realm.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut challenge = Self::default();
        for caps in CHALLENGE_PARAM_RE.captures_iter(params) {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map_or("", |m| m.as_str())
                .to_string();
            match caps[1].to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }
        (!challenge.realm.is_empty()).then_some(challenge)
    }

    /// The token request URL.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Registry`] when the realm is not a URL.
    pub fn token_url(&self) -> StevedoreResult<Url> {
        let mut params = Vec::new();
        if let Some(service) = &self.service {
            params.push(("service", service.as_str()));
        }
        if let Some(scope) = &self.scope {
            params.push(("scope", scope.as_str()));
        }
        Url::parse_with_params(&self.realm, &params).map_err(|e| StevedoreError::Registry {
            message: format!("invalid token realm {}: {e}", self.realm),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

/// Outcome of a manifest request.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    /// HTTP status of the final request.
    pub status: StatusCode,
    /// Parsed manifest; `None` when the body was unusable or no index
    /// entry matched the platform.
    pub manifest: Option<RegistryManifest>,
}

/// Registry client for pulling images into a [`LocalRepository`].
///
/// Bearer tokens are cached per token URL for the life of the client.
pub struct RegistryClient {
    http: Client,
    config: RegistryConfig,
    registry_url: String,
    index_url: String,
    repo: LocalRepository,
    tokens: HashMap<String, String>,
}

impl RegistryClient {
    /// Create a client writing into `repo`.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Config`] when an endpoint is not an HTTP(S)
    /// URL, or [`StevedoreError::Network`] if the HTTP client cannot be
    /// built.
    pub fn new(repo: LocalRepository, config: RegistryConfig) -> StevedoreResult<Self> {
        for endpoint in [&config.registry_url, &config.index_url] {
            let valid = Url::parse(endpoint).is_ok_and(|u| matches!(u.scheme(), "http" | "https"));
            if !valid {
                return Err(StevedoreError::Config {
                    message: format!("invalid registry endpoint {endpoint:?}"),
                });
            }
        }
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StevedoreError::Network {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            registry_url: config.registry_url.clone(),
            index_url: config.index_url.clone(),
            config,
            repo,
            tokens: HashMap::new(),
        })
    }

    /// Registry base URL in use.
    #[must_use]
    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    /// Point the client at the registry a reference names, if it names one.
    /// Returns the repository path to use on that registry.
    pub fn resolve(&mut self, repository: &str) -> RemoteReference {
        let remote = RemoteReference::parse(repository);
        if let Some((registry, index)) = remote.endpoints(&self.config) {
            tracing::debug!(registry = %registry, "Using registry from reference");
            self.registry_url = registry;
            self.index_url = index;
        }
        remote
    }

    /// GET `url`, following up to `max_redirects` redirects. The bearer
    /// token is only sent to the first hop.
    async fn send(&self, url: &str, accept: Option<&str>, token: Option<&str>) -> StevedoreResult<Response> {
        let mut url = Url::parse(url).map_err(|e| StevedoreError::Registry {
            message: format!("invalid URL {url}: {e}"),
        })?;
        let mut token = token;
        let mut hops = 0;
        loop {
            tracing::debug!(url = %url, "GET");
            let mut request = self.http.get(url.clone());
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await.map_err(|e| StevedoreError::Network {
                message: format!("Request to {url} failed: {e}"),
            })?;

            if response.status().is_redirection() && hops < self.config.max_redirects {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| url.join(loc).ok());
                if let Some(next) = location {
                    tracing::debug!(from = %url, to = %next, "Following redirect");
                    url = next;
                    token = None;
                    hops += 1;
                    continue;
                }
            }
            return Ok(response);
        }
    }

    /// GET with bearer authentication on a 401 challenge.
    ///
    /// When no token can be obtained, or the retry is refused too, the
    /// unauthorized response itself is returned.
    async fn request_with_auth(&mut self, url: &str, accept: Option<&str>) -> StevedoreResult<Response> {
        let response = self.send(url, accept, None).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
        else {
            return Ok(response);
        };
        let Some((cache_key, token)) = self.token_for(&challenge).await else {
            return Ok(response);
        };

        let retried = self.send(url, accept, Some(&token)).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!("Token refused, dropping it from cache");
            self.tokens.remove(&cache_key);
        }
        Ok(retried)
    }

    /// Fetch (or reuse) a token for a challenge. Returns the cache key and
    /// token.
    async fn token_for(&mut self, challenge: &BearerChallenge) -> Option<(String, String)> {
        let url = match challenge.token_url() {
            Ok(url) => url.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot request token");
                return None;
            }
        };
        if let Some(token) = self.tokens.get(&url) {
            return Some((url, token.clone()));
        }

        tracing::debug!(url = %url, "Requesting token");
        let response = self.send(&url, Some(media_types::JSON), None).await.ok()?;
        if response.status() != StatusCode::OK {
            tracing::warn!(status = %response.status(), "Token request refused");
            return None;
        }
        let body: TokenResponse = response.json().await.ok()?;
        let token = body
            .token
            .filter(|t| !t.is_empty())
            .or(body.access_token.filter(|t| !t.is_empty()))?;
        self.tokens.insert(url.clone(), token.clone());
        Some((url, token))
    }

    /// Whether the registry speaks the v2 API. A 401 counts as yes.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Network`] when the registry is unreachable.
    pub async fn is_v2(&mut self) -> StevedoreResult<bool> {
        let url = format!("{}/v2/", self.registry_url);
        let response = self.request_with_auth(&url, Some(media_types::JSON)).await?;
        Ok(matches!(
            response.status(),
            StatusCode::OK | StatusCode::UNAUTHORIZED
        ))
    }

    /// Fetch a manifest by tag or digest.
    ///
    /// An index is resolved through `platform` by fetching the first
    /// matching entry; without a platform the index itself is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Network`] on transport failures only; HTTP
    /// failures are reported through [`ManifestResponse::status`].
    pub async fn fetch_manifest(
        &mut self,
        repository: &str,
        reference: &str,
        platform: Option<&PlatformSelector>,
    ) -> StevedoreResult<ManifestResponse> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.registry_url);
        let accept = media_types::MANIFEST_ACCEPT.join(", ");
        let response = self.request_with_auth(&url, Some(&accept)).await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.map_err(|e| StevedoreError::Network {
            message: format!("Failed to read manifest body: {e}"),
        })?;
        let manifest: Option<RegistryManifest> = serde_json::from_slice(&body).ok();

        if !media_types::is_index(&content_type) {
            return Ok(ManifestResponse { status, manifest });
        }
        let Some(platform) = platform else {
            return Ok(ManifestResponse { status, manifest });
        };

        let selected = manifest.as_ref().and_then(|m| match m.kind() {
            ManifestKind::Index(entries) => entries
                .iter()
                .find(|e| {
                    platform.matches(&e.platform.clone().unwrap_or_default())
                })
                .map(|e| e.descriptor.digest.clone()),
            _ => None,
        });
        let Some(digest) = selected else {
            tracing::warn!(%platform, repository, reference, "No manifest matches platform");
            return Ok(ManifestResponse {
                status,
                manifest: None,
            });
        };

        tracing::debug!(%platform, digest, "Selected platform manifest");
        Box::pin(self.fetch_manifest(repository, &digest, Some(platform))).await
    }

    /// Make one blob available in the blob store and link it into `tag`.
    ///
    /// # Errors
    ///
    /// - [`StevedoreError::NotCached`] when `policy` is never and no valid
    ///   copy is cached.
    /// - [`StevedoreError::DigestMismatch`] when a download does not hash to
    ///   `digest`; the file is removed.
    /// - [`StevedoreError::Registry`] for a non-200 blob response.
    pub async fn fetch_layer(
        &mut self,
        repository: &str,
        digest: &str,
        policy: PullPolicy,
        tag: &TagDir,
    ) -> StevedoreResult<PathBuf> {
        check_blob_name(digest)?;
        let blob = self.repo.blob_path(digest);

        if blob.is_file() {
            if verify_blob(&blob, digest).await? {
                if policy != PullPolicy::Always {
                    tracing::info!(digest, "Using cached layer");
                    tag.add_layer_link(&blob, None)?;
                    return Ok(blob);
                }
                tracing::info!(digest, "Re-downloading layer (policy=always)");
            } else {
                tracing::warn!(digest, "Cached layer invalid, removing");
            }
            tokio::fs::remove_file(&blob).await?;
            if policy == PullPolicy::Never {
                return Err(StevedoreError::NotCached {
                    digest: digest.to_string(),
                });
            }
        } else if policy == PullPolicy::Never {
            tracing::error!(digest, "Layer missing and pull policy is never");
            return Err(StevedoreError::NotCached {
                digest: digest.to_string(),
            });
        }

        tracing::info!(digest, "Downloading layer");
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.registry_url);
        let response = self.request_with_auth(&url, None).await?;
        if response.status() != StatusCode::OK {
            return Err(StevedoreError::Registry {
                message: format!("Failed to download {digest}: HTTP {}", response.status()),
            });
        }

        if let Err(e) = download(response, &blob).await {
            let _ = tokio::fs::remove_file(&blob).await;
            return Err(e);
        }
        if !verify_blob(&blob, digest).await? {
            tracing::error!(digest, "Downloaded layer failed digest verification");
            tokio::fs::remove_file(&blob).await?;
            return Err(StevedoreError::DigestMismatch {
                digest: digest.to_string(),
            });
        }

        tag.add_layer_link(&blob, None)?;
        Ok(blob)
    }

    /// Fetch blobs in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`Self::fetch_layer`] error.
    pub async fn fetch_all_layers(
        &mut self,
        repository: &str,
        digests: &[String],
        policy: PullPolicy,
        tag: &TagDir,
    ) -> StevedoreResult<Vec<PathBuf>> {
        let mut files = Vec::with_capacity(digests.len());
        for digest in digests {
            files.push(self.fetch_layer(repository, digest, policy, tag).await?);
        }
        Ok(files)
    }

    /// Pull an image: resolve, store the manifest, fetch every blob.
    ///
    /// Without a platform the host platform is used. Nothing is rolled back
    /// on failure; pulling again resumes from the cached blobs.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Registry`] when the manifest cannot be
    /// obtained, [`StevedoreError::Manifest`] when it lists no layers, or the
    /// first layer failure.
    pub async fn pull(
        &mut self,
        image: &ImageSpec,
        platform: Option<&PlatformSelector>,
        policy: PullPolicy,
    ) -> StevedoreResult<Vec<PathBuf>> {
        let remote = self.resolve(&image.repository);
        let platform = platform.cloned().unwrap_or_else(PlatformSelector::host);
        tracing::info!(
            image = %image,
            remote = %remote.repository,
            registry = %self.registry_url,
            index = %self.index_url,
            %platform,
            %policy,
            "Pulling image"
        );

        if self.repo.select_tag(&image.repository, &image.tag).is_none() {
            self.repo.create_image_repo(&image.repository)?;
        }

        let response = self
            .fetch_manifest(&remote.repository, &image.tag, Some(&platform))
            .await?;
        if response.status == StatusCode::UNAUTHORIZED {
            return Err(StevedoreError::Registry {
                message: format!("manifest for {image} not found or not authorized"),
            });
        }
        let manifest = match response.manifest {
            Some(manifest) if response.status == StatusCode::OK => manifest,
            None if response.status == StatusCode::OK => {
                return Err(StevedoreError::Registry {
                    message: format!("no manifest for {image} matches platform {platform}"),
                });
            }
            _ => {
                return Err(StevedoreError::Registry {
                    message: format!("failed to pull manifest for {image}: HTTP {}", response.status),
                });
            }
        };

        let digests: Vec<String> = match manifest.kind() {
            ManifestKind::Legacy { fs_layers, .. } => {
                fs_layers.iter().rev().map(|l| l.blob_sum.clone()).collect()
            }
            ManifestKind::Image { config, layers } => layers
                .iter()
                .chain(config)
                .map(|d| d.digest.clone())
                .collect(),
            ManifestKind::Index(_) | ManifestKind::Unknown => {
                return Err(StevedoreError::Manifest {
                    message: "layers section missing in manifest".to_string(),
                });
            }
        };

        let tag = self.repo.create_tag(&image.repository, &image.tag)?;
        tag.set_version(ManifestVersion::V2)?;
        tag.save_manifest(&manifest)?;

        self.fetch_all_layers(&remote.repository, &digests, policy, &tag)
            .await
    }
}

impl fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryClient")
            .field("registry_url", &self.registry_url)
            .field("index_url", &self.index_url)
            .field("cached_tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

/// Blob names become file names; refuse anything that is not one path
/// component.
fn check_blob_name(digest: &str) -> StevedoreResult<()> {
    if digest.is_empty() || digest.contains(['/', '\\']) || digest == "." || digest == ".." {
        return Err(StevedoreError::Manifest {
            message: format!("invalid blob digest {digest:?}"),
        });
    }
    Ok(())
}

async fn verify_blob(path: &Path, digest: &str) -> StevedoreResult<bool> {
    let path = path.to_path_buf();
    let digest = digest.to_string();
    tokio::task::spawn_blocking(move || verify_file(&path, &digest))
        .await
        .map_err(|e| StevedoreError::Internal {
            message: format!("digest task failed: {e}"),
        })
}

async fn download(response: Response, dest: &Path) -> StevedoreResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| StevedoreError::Network {
            message: format!("Failed to read blob body: {e}"),
        })?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_policy_parsing() {
        assert_eq!("missing".parse::<PullPolicy>().unwrap(), PullPolicy::Missing);
        assert_eq!("REUSE".parse::<PullPolicy>().unwrap(), PullPolicy::Missing);
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("Never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert!(matches!(
            "sometimes".parse::<PullPolicy>(),
            Err(StevedoreError::InvalidPullPolicy { .. })
        ));
        assert_eq!(PullPolicy::default(), PullPolicy::Missing);
    }

    #[test]
    fn rejects_non_http_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(stevedore_common::StevedorePaths::with_root(dir.path()));

        for (registry_url, index_url) in [
            ("ftp://mirror.example", "https://hub.example"),
            ("https://registry.example", "not a url"),
        ] {
            let config = RegistryConfig {
                registry_url: registry_url.to_string(),
                index_url: index_url.to_string(),
                ..RegistryConfig::default()
            };
            assert!(matches!(
                RegistryClient::new(repo.clone(), config),
                Err(StevedoreError::Config { .. })
            ));
        }
        assert!(RegistryClient::new(repo, RegistryConfig::default()).is_ok());
    }

    #[test]
    fn parses_docker_hub_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:library/alpine:pull"));

        insta::assert_snapshot!(
            challenge.token_url().unwrap().as_str(),
            @"https://auth.docker.io/token?service=registry.docker.io&scope=repository%3Alibrary%2Falpine%3Apull"
        );
    }

    #[test]
    fn scope_with_commas_survives() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://r/token", scope="repository:a:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scope.as_deref(), Some("repository:a:pull,push"));
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn non_bearer_challenges_are_ignored() {
        assert!(BearerChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(BearerChallenge::parse("Bearer service=\"x\"").is_none());
        assert!(BearerChallenge::parse("").is_none());
    }

    #[test]
    fn blob_names_are_single_components() {
        assert!(check_blob_name("sha256:abc").is_ok());
        assert!(check_blob_name("../etc/passwd").is_err());
        assert!(check_blob_name("..").is_err());
        assert!(check_blob_name("").is_err());
    }
}
