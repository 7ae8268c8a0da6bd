//! Registry access used by the fix-up and push pipeline.
//!
//! The pipeline only needs a handful of content-addressed operations, so it
//! talks to a [`Registry`] trait object:
//!
//! ```text
//!   fixup / push ──► Retrying ──► OciRegistry     (oci-distribution client)
//!                              └► MemoryRegistry  (in-process, tests/dry runs)
//! ```

mod memory;
mod oci;

use std::collections::BTreeMap;

use async_trait::async_trait;
use cnab_push_core::error::{PushError, Result};
use serde::{Deserialize, Serialize};

use crate::digest::sha256_digest;
use crate::reference::ImageReference;

pub use memory::MemoryRegistry;
pub use oci::OciRegistry;

/// Well-known manifest and config media types.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const CNAB_CONFIG: &str = "application/vnd.cnab.config.v1+json";
    pub const CNAB_MANIFEST: &str = "application/vnd.cnab.manifest.v1";

    /// Manifest types accepted when resolving source images.
    pub const ACCEPTED_MANIFESTS: &[&str] =
        &[OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST];

    /// Whether `media_type` is a multi-manifest index.
    pub fn is_index(media_type: &str) -> bool {
        media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
    }
}

/// Target platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Content descriptor, as found in manifests and indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    /// Foreign (non-distributable) content is fetched from these URLs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Descriptor of `data` with the given media type.
    pub fn of(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: sha256_digest(data),
            size: data.len() as u64,
            urls: Vec::new(),
            platform: None,
            annotations: None,
        }
    }

    /// Attach annotations.
    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations = if annotations.is_empty() {
            None
        } else {
            Some(annotations)
        };
        self
    }
}

/// The parts of an image manifest or index the copier needs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestContent {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ManifestContent {
    /// Parse raw manifest bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            PushError::Serialization(format!("Failed to parse manifest: {}", e))
        })
    }

    /// Blobs referenced by an image manifest: config first, then layers.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        self.config.iter().chain(self.layers.iter())
    }
}

/// A manifest fetched from a registry, byte-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedManifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub digest: String,
}

impl ResolvedManifest {
    /// Wrap raw bytes, computing the digest and sniffing the media type
    /// when the registry did not report one.
    pub fn new(bytes: Vec<u8>, media_type: Option<String>) -> Result<Self> {
        let media_type = match media_type {
            Some(mt) if !mt.is_empty() => mt,
            _ => sniff_media_type(&bytes)?,
        };
        let digest = sha256_digest(&bytes);
        Ok(Self {
            bytes,
            media_type,
            digest,
        })
    }

    /// Manifest size in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Whether this manifest is an index of platform manifests.
    pub fn is_index(&self) -> bool {
        media_types::is_index(&self.media_type)
    }

    /// Parse the manifest body.
    pub fn content(&self) -> Result<ManifestContent> {
        ManifestContent::parse(&self.bytes)
    }
}

/// Media type of a manifest body: its `mediaType` field, else inferred from shape.
fn sniff_media_type(bytes: &[u8]) -> Result<String> {
    let content = ManifestContent::parse(bytes)?;
    Ok(match content.media_type {
        Some(mt) => mt,
        None if !content.manifests.is_empty() => media_types::OCI_INDEX.to_string(),
        None => media_types::OCI_MANIFEST.to_string(),
    })
}

/// Content-addressed registry operations.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch a manifest by tag or digest.
    async fn resolve_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest>;

    /// Whether the manifest addressed by `reference` exists.
    async fn manifest_exists(&self, reference: &ImageReference) -> Result<bool>;

    /// Download a blob from the repository of `reference`.
    async fn pull_blob(&self, reference: &ImageReference, descriptor: &Descriptor)
        -> Result<Vec<u8>>;

    /// Upload a blob into the repository of `reference`.
    async fn push_blob(&self, reference: &ImageReference, data: &[u8], digest: &str)
        -> Result<()>;

    /// Upload a manifest under the tag or digest of `reference`.
    /// Returns the manifest digest.
    async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<String>;
}
