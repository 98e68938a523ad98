//! Platform selectors for manifest lists.

use std::fmt;
use std::str::FromStr;

use stevedore_common::StevedoreError;
use stevedore_oci::image::Platform;

/// An `os[/architecture[/variant]]` selector.
///
/// Fields are stored lowercase; `android` is folded into `linux`. An empty
/// field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSelector {
    /// Operating system.
    pub os: String,
    /// Architecture.
    pub architecture: String,
    /// Architecture variant.
    pub variant: String,
}

impl PlatformSelector {
    /// Parse `os[/arch[/variant]]`. Never fails; missing parts are empty.
    #[must_use]
    pub fn parse(selector: &str) -> Self {
        let mut parts = selector.trim().splitn(3, '/');
        let mut next = || parts.next().unwrap_or_default().trim().to_lowercase();
        let os = normalize_os(&next());
        let architecture = next();
        let variant = next();
        Self {
            os,
            architecture,
            variant,
        }
    }

    /// The platform of the running host.
    #[must_use]
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => ppc64_name(cfg!(target_endian = "little")),
            other => other,
        };
        Self {
            os: normalize_os(std::env::consts::OS),
            architecture: architecture.to_string(),
            variant: String::new(),
        }
    }

    /// Whether a manifest-list platform satisfies this selector.
    #[must_use]
    pub fn matches(&self, platform: &Platform) -> bool {
        field_matches(&self.os, &normalize_os(&platform.os.to_lowercase()))
            && field_matches(&self.architecture, &platform.architecture)
            && field_matches(&self.variant, platform.variant.as_deref().unwrap_or_default())
    }
}

fn field_matches(wanted: &str, actual: &str) -> bool {
    wanted.is_empty() || wanted.eq_ignore_ascii_case(actual)
}

const fn ppc64_name(little_endian: bool) -> &'static str {
    if little_endian { "ppc64le" } else { "ppc64" }
}

fn normalize_os(os: &str) -> String {
    if os == "android" {
        "linux".to_string()
    } else {
        os.to_string()
    }
}

impl FromStr for PlatformSelector {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for PlatformSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.os)?;
        if !self.architecture.is_empty() {
            write!(f, "/{}", self.architecture)?;
            if !self.variant.is_empty() {
                write!(f, "/{}", self.variant)?;
            }
        }
        Ok(())
    }
}
