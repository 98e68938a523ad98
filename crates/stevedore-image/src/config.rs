//! Registry endpoint configuration.

use std::collections::BTreeMap;

/// Docker Hub registry API endpoint.
pub const DOCKER_HUB_REGISTRY: &str = "https://registry-1.docker.io";
/// Docker Hub index endpoint.
pub const DOCKER_HUB_INDEX: &str = "https://hub.docker.com";

/// Registry endpoints and transport limits for one client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry API base URL used when a reference names no host.
    pub registry_url: String,
    /// Index URL paired with [`Self::registry_url`].
    pub index_url: String,
    /// Known hosts mapped to their `(registry URL, index URL)`.
    pub aliases: BTreeMap<String, (String, String)>,
    /// Maximum number of redirects followed per request.
    pub max_redirects: usize,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl RegistryConfig {
    /// Endpoints for a registry host named in a reference.
    ///
    /// Aliases map to their configured pair; other hosts are used as an
    /// HTTPS origin unless they already carry a scheme.
    #[must_use]
    pub fn endpoints_for(&self, host: &str) -> (String, String) {
        if let Some((registry, index)) = self.aliases.get(host) {
            return (registry.clone(), index.clone());
        }
        let url = with_scheme(host);
        (url.clone(), url)
    }

    /// Replace the default registry URL.
    pub fn set_registry(&mut self, url: &str) {
        self.registry_url = with_scheme(url);
    }

    /// Replace the default index URL.
    pub fn set_index(&mut self, url: &str) {
        self.index_url = with_scheme(url);
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert(
            "docker.io".to_string(),
            (DOCKER_HUB_REGISTRY.to_string(), DOCKER_HUB_INDEX.to_string()),
        );
        Self {
            registry_url: DOCKER_HUB_REGISTRY.to_string(),
            index_url: DOCKER_HUB_INDEX.to_string(),
            aliases,
            max_redirects: 3,
            user_agent: concat!("stevedore/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Prefix `https://` unless a scheme is already present.
#[must_use]
pub fn with_scheme(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolves_to_hub() {
        let config = RegistryConfig::default();
        let (registry, index) = config.endpoints_for("docker.io");
        assert_eq!(registry, DOCKER_HUB_REGISTRY);
        assert_eq!(index, DOCKER_HUB_INDEX);
    }

    #[test]
    fn unknown_host_is_https_origin() {
        let config = RegistryConfig::default();
        let (registry, index) = config.endpoints_for("quay.io");
        assert_eq!(registry, "https://quay.io");
        assert_eq!(index, "https://quay.io");
        assert_eq!(config.endpoints_for("http://localhost:5000").0, "http://localhost:5000");
    }
}
