//! Registry reference parsing.
//!
//! Parses references like `ghcr.io/org/bundle:v0.1.0` into structured components
//! and validates them against the distribution naming grammar.

use std::net::{Ipv4Addr, Ipv6Addr};

use cnab_push_core::error::{PushError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Maximum tag length accepted by registries.
const MAX_TAG_LEN: usize = 128;

/// Parsed registry reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/bundle")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    /// - `localhost:5000/org/image` → localhost:5000/org/image:latest
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PushError::InvalidReference(
                "Empty reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                validate_digest(reference, digest_part)?;
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // Split tag: only a colon after the last slash separates a tag. A
        // registry port colon is always followed by a repository path.
        let last_segment_start = name_tag.rfind('/').map_or(0, |p| p + 1);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon_pos) => {
                let split = last_segment_start + colon_pos;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(ref tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = Self::split_registry_repository(name)?;
        validate_repository(reference, &repository)?;

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry hostname if it contains a dot or
        // colon, or is "localhost"
        let (registry, repository) = match name.split_once('/') {
            Some((first, repo))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                if repo.is_empty() {
                    return Err(PushError::InvalidReference(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                validate_registry(name, first)?;
                (first.to_lowercase(), repo)
            }
            _ => (DEFAULT_REGISTRY.to_string(), name),
        };

        // Single name like "nginx" → "library/nginx" for Docker Hub
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository.to_string()
        };

        Ok((registry, repository))
    }

    /// `registry/repository`, without tag or digest.
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The same repository, addressed only by `digest`.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.into()),
        }
    }

    /// Whether `other` lives in the same registry repository.
    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }

    /// Tag or digest used to address a manifest: the digest wins.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repository_name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Validate `algorithm:hex` digests. sha256 digests must be 64 hex characters.
fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
        PushError::InvalidReference(format!(
            "Invalid digest format in reference '{}': expected algorithm:hex",
            reference
        ))
    })?;
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
    let encoded_ok = !encoded.is_empty() && encoded.chars().all(|c| c.is_ascii_hexdigit());
    let length_ok = algorithm != "sha256" || encoded.len() == 64;
    if algorithm_ok && encoded_ok && length_ok {
        Ok(())
    } else {
        Err(PushError::InvalidReference(format!(
            "Invalid digest '{}' in reference '{}'",
            digest, reference
        )))
    }
}

/// `host[:port]`, where host is a DNS name, an IPv4 address or a bracketed
/// IPv6 address and port is numeric.
fn validate_registry(reference: &str, registry: &str) -> Result<()> {
    let invalid = || {
        PushError::InvalidReference(format!(
            "Invalid registry host '{}' in reference '{}'",
            registry, reference
        ))
    };

    let (host, port) = match registry.strip_prefix('[') {
        Some(rest) => {
            let (address, after) = rest.split_once(']').ok_or_else(invalid)?;
            address.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            match after {
                "" => (None, None),
                _ => (None, Some(after.strip_prefix(':').ok_or_else(invalid)?)),
            }
        }
        None => match registry.split_once(':') {
            Some((host, port)) => (Some(host), Some(port)),
            None => (Some(registry), None),
        },
    };

    if let Some(port) = port {
        let numeric = !port.is_empty() && port.chars().all(|c| c.is_ascii_digit());
        if !numeric || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
    }

    if let Some(host) = host {
        let label_ok = |label: &str| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        };
        if host.parse::<Ipv4Addr>().is_err() && !host.split('.').all(label_ok) {
            return Err(invalid());
        }
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));
    if first_ok && rest_ok && tag.len() <= MAX_TAG_LEN {
        Ok(())
    } else {
        Err(PushError::InvalidReference(format!(
            "Invalid tag '{}' in reference '{}'",
            tag, reference
        )))
    }
}

/// Each path component is lowercase alphanumerics joined by `.`, `_`, `__` or `-`.
fn validate_repository(reference: &str, repository: &str) -> Result<()> {
    let component_ok = |component: &str| {
        let bytes = component.as_bytes();
        let ends_ok = matches!(bytes.first(), Some(b) if b.is_ascii_lowercase() || b.is_ascii_digit())
            && matches!(bytes.last(), Some(b) if b.is_ascii_lowercase() || b.is_ascii_digit());
        let chars_ok = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c));
        let separators_ok = !component.contains("..")
            && !component.contains("___")
            && !component.contains("._")
            && !component.contains("_.");
        ends_ok && chars_ok && separators_ok
    };

    if repository.split('/').all(component_ok) {
        Ok(())
    } else {
        Err(PushError::InvalidReference(format!(
            "Invalid repository name '{}' in reference '{}'",
            repository, reference
        )))
    }
}
