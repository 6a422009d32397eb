//! OCI image reference parsing.
//!
//! Parses image references like `ghcr.io/org/app:v1` into structured components.
//! The tag is left unset when the reference does not name one; `latest` is
//! only substituted when the manifest is addressed, so callers can warn.

use hoist_core::error::{HoistError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Host that serves the Docker Hub v2 API.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "v1"), `None` when not given
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty image reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                if !digest_part.contains(':') {
                    return Err(invalid(reference, "expected digest as algorithm:hex"));
                }
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // Split tag on the last colon after the last slash
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => match name_tag[slash_pos + 1..].rfind(':') {
                Some(colon_pos) => {
                    let split = slash_pos + 1 + colon_pos;
                    (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
                }
                None => (name_tag, None),
            },
            None => match name_tag.rfind(':') {
                // registry:port with no repository is not a tag
                Some(colon_pos)
                    if !name_tag[colon_pos + 1..]
                        .chars()
                        .all(|c| c.is_ascii_digit()) =>
                {
                    (
                        &name_tag[..colon_pos],
                        Some(name_tag[colon_pos + 1..].to_string()),
                    )
                }
                _ => (name_tag, None),
            },
        };

        if matches!(tag.as_deref(), Some("")) {
            return Err(invalid(reference, "empty tag"));
        }

        let (registry, repository) = Self::split_registry_repository(reference, name)?;

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
        // The first component is a registry when it looks like a hostname
        // (contains a dot or colon, or is "localhost")
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let repo = &name[slash_pos + 1..];
                if repo.is_empty() {
                    return Err(invalid(reference, "empty repository"));
                }
                return Ok((first.to_string(), repo.to_string()));
            }
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Host that serves the `/v2/` API for this reference.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY || self.registry == "index.docker.io" {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Reference used to address the manifest: digest, tag, or `latest`.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Whether the reference names neither a tag nor a digest.
    pub fn is_untagged(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
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

fn invalid(reference: &str, message: &str) -> HoistError {
    HoistError::InvalidReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}
