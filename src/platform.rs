//! OCI platform descriptors.
//!
//! Used by the snapshot engine to decide which entries of a multi-platform
//! image index have their content available locally, and by the containerd
//! commit path to pick the base manifest matching the node.

use std::collections::BTreeSet;

/// OCI platform (`os/architecture[/variant]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlatformSpec {
    /// Operating system (e.g. `linux`).
    pub os: String,
    /// CPU architecture in GOARCH spelling (e.g. `amd64`).
    pub architecture: String,
    /// Architecture variant (e.g. `v8`).
    pub variant: Option<String>,
}

/// Set of platforms, ordered for stable log output.
pub type PlatformSet = BTreeSet<PlatformSpec>;

impl PlatformSpec {
    /// Creates a platform without variant.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// Detects the platform this process runs on.
    pub fn host() -> Self {
        Self::new(Self::detect_os(), Self::detect_arch())
    }

    fn detect_os() -> &'static str {
        #[cfg(target_os = "linux")]
        return "linux";

        #[cfg(target_os = "macos")]
        return "darwin";

        #[cfg(target_os = "windows")]
        return "windows";

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return "linux";
    }

    fn detect_arch() -> &'static str {
        #[cfg(target_arch = "x86_64")]
        return "amd64";

        #[cfg(target_arch = "aarch64")]
        return "arm64";

        #[cfg(target_arch = "arm")]
        return "arm";

        #[cfg(target_arch = "s390x")]
        return "s390x";

        #[cfg(target_arch = "powerpc64")]
        return "ppc64le";

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "arm",
            target_arch = "s390x",
            target_arch = "powerpc64"
        )))]
        return "amd64";
    }

    /// Converts an index entry's platform.
    pub fn from_oci(platform: &oci_distribution::manifest::Platform) -> Self {
        Self {
            os: platform.os.clone(),
            architecture: platform.architecture.clone(),
            variant: platform.variant.clone().filter(|v| !v.is_empty()),
        }
    }

    /// Parses `os/arch[/variant]`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('/');
        let os = parts.next().filter(|p| !p.is_empty())?;
        let arch = parts.next().filter(|p| !p.is_empty())?;
        let variant = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            os: os.to_string(),
            architecture: arch.to_string(),
            variant,
        })
    }

    /// Returns true if an image built for `self` runs on `target`.
    ///
    /// A missing variant matches any variant.
    pub fn matches(&self, target: &PlatformSpec) -> bool {
        self.os == target.os
            && self.architecture == target.architecture
            && match (&self.variant, &target.variant) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl std::fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// Formats a platform set as `linux/amd64, linux/arm64`.
pub fn describe(platforms: &PlatformSet) -> String {
    platforms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
