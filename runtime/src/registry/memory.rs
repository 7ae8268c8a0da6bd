//! In-process registry.
//!
//! Content-addressed like a real registry: blobs and manifests are stored per
//! repository and keyed by digest, and manifest uploads are refused while any
//! content they reference is missing from the same repository. Supports
//! failure injection and media-type rejection for exercising the pipeline.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use cnab_push_core::error::{PushError, RegistryErrorKind, Result};
use parking_lot::Mutex;

use super::{media_types, Descriptor, ManifestContent, Registry, ResolvedManifest};
use crate::digest::sha256_digest;
use crate::reference::ImageReference;

#[derive(Default)]
struct Repository {
    blobs: HashMap<String, Vec<u8>>,
    manifests: HashMap<String, (Vec<u8>, String)>,
    tags: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    repositories: HashMap<String, Repository>,
    /// registry host → media types refused on manifest upload
    rejected_media_types: HashMap<String, HashSet<String>>,
    /// repository name → failure returned by every call touching it
    broken_repositories: HashMap<String, RegistryErrorKind>,
    /// calls left to fail with a transient error
    transient_failures: usize,
    blob_uploads: usize,
    manifest_uploads: usize,
    rejected_uploads: usize,
}

/// Registry held entirely in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a single-platform OCI image under `reference` and return its
    /// manifest digest. Each layer is stored as a blob.
    pub fn insert_image(&self, reference: &str, layers: &[&[u8]]) -> Result<String> {
        let reference = ImageReference::parse(reference)?;
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []},
            "repo": reference.repository_name(),
        }))?;
        let config_desc = Descriptor::of(media_types::OCI_CONFIG, &config);
        let layer_descs: Vec<Descriptor> = layers
            .iter()
            .map(|l| Descriptor::of("application/vnd.oci.image.layer.v1.tar+gzip", l))
            .collect();
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": config_desc,
            "layers": layer_descs,
        }))?;

        let mut state = self.state.lock();
        let repo = state
            .repositories
            .entry(reference.repository_name())
            .or_default();
        repo.blobs.insert(config_desc.digest.clone(), config);
        for (layer, desc) in layers.iter().zip(&layer_descs) {
            repo.blobs.insert(desc.digest.clone(), layer.to_vec());
        }
        Ok(store_manifest(repo, &reference, manifest, media_types::OCI_MANIFEST))
    }

    /// Store an index over images already inserted in the same repository.
    /// `platforms` pairs each child manifest digest with `os/arch`.
    pub fn insert_index(&self, reference: &str, platforms: &[(&str, &str)]) -> Result<String> {
        let reference = ImageReference::parse(reference)?;
        let mut state = self.state.lock();
        let repo = state
            .repositories
            .entry(reference.repository_name())
            .or_default();

        let mut entries = Vec::new();
        for (digest, platform) in platforms {
            let (bytes, media_type) = repo.manifests.get(*digest).ok_or_else(|| {
                PushError::registry(
                    reference.registry.clone(),
                    RegistryErrorKind::NotFound,
                    format!("manifest unknown: {}", digest),
                )
            })?;
            let (os, arch) = platform.split_once('/').unwrap_or(("linux", *platform));
            let mut desc = Descriptor::of(media_type.clone(), bytes);
            desc.platform = Some(super::Platform {
                architecture: arch.to_string(),
                os: os.to_string(),
                variant: None,
            });
            entries.push(desc);
        }
        let index = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_INDEX,
            "manifests": entries,
        }))?;
        Ok(store_manifest(repo, &reference, index, media_types::OCI_INDEX))
    }

    /// Refuse manifest uploads of `media_type` on `registry`.
    pub fn reject_media_type(&self, registry: &str, media_type: &str) {
        self.state
            .lock()
            .rejected_media_types
            .entry(registry.to_lowercase())
            .or_default()
            .insert(media_type.to_string());
    }

    /// Fail every operation on the repository of `reference` with `kind`.
    pub fn break_repository(&self, reference: &str, kind: RegistryErrorKind) -> Result<()> {
        let reference = ImageReference::parse(reference)?;
        self.state
            .lock()
            .broken_repositories
            .insert(reference.repository_name(), kind);
        Ok(())
    }

    /// Delete a blob, leaving manifests that reference it dangling.
    pub fn remove_blob(&self, reference: &str, digest: &str) -> Result<bool> {
        let reference = ImageReference::parse(reference)?;
        let mut state = self.state.lock();
        Ok(state
            .repositories
            .get_mut(&reference.repository_name())
            .map_or(false, |repo| repo.blobs.remove(digest).is_some()))
    }

    /// Fail the next `count` operations with a transient error.
    pub fn fail_transiently(&self, count: usize) {
        self.state.lock().transient_failures = count;
    }

    /// Number of blobs uploaded so far.
    pub fn blob_uploads(&self) -> usize {
        self.state.lock().blob_uploads
    }

    /// Number of manifests accepted so far.
    pub fn manifest_uploads(&self) -> usize {
        self.state.lock().manifest_uploads
    }

    /// Number of manifest uploads refused for their media type.
    pub fn rejected_uploads(&self) -> usize {
        self.state.lock().rejected_uploads
    }

    /// Manifest bytes and media type stored under a tag or digest.
    pub fn manifest(&self, reference: &ImageReference) -> Option<(Vec<u8>, String)> {
        let state = self.state.lock();
        let repo = state.repositories.get(&reference.repository_name())?;
        let digest = lookup_digest(repo, reference)?;
        repo.manifests.get(&digest).cloned()
    }

    /// Digest a tag points to.
    pub fn tagged_digest(&self, reference: &ImageReference) -> Option<String> {
        let state = self.state.lock();
        let repo = state.repositories.get(&reference.repository_name())?;
        let tag = reference.tag.as_ref()?;
        repo.tags.get(tag).cloned()
    }

    /// Whether a blob exists in the repository of `reference`.
    pub fn has_blob(&self, reference: &ImageReference, digest: &str) -> bool {
        let state = self.state.lock();
        state
            .repositories
            .get(&reference.repository_name())
            .map_or(false, |repo| repo.blobs.contains_key(digest))
    }

    /// Apply injected failures for an operation on `reference`.
    fn check(&self, reference: &ImageReference, operation: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(PushError::registry(
                reference.registry.clone(),
                RegistryErrorKind::Transient,
                format!("{}: connection reset by peer", operation),
            ));
        }
        if let Some(kind) = state.broken_repositories.get(&reference.repository_name()) {
            return Err(PushError::registry(
                reference.registry.clone(),
                *kind,
                format!("{} {}: {}", operation, reference, kind),
            ));
        }
        Ok(())
    }
}

/// Store manifest bytes by digest and, when present, under the tag.
fn store_manifest(
    repo: &mut Repository,
    reference: &ImageReference,
    bytes: Vec<u8>,
    media_type: &str,
) -> String {
    let digest = sha256_digest(&bytes);
    repo.manifests
        .insert(digest.clone(), (bytes, media_type.to_string()));
    if let Some(ref tag) = reference.tag {
        repo.tags.insert(tag.clone(), digest.clone());
    }
    digest
}

fn lookup_digest(repo: &Repository, reference: &ImageReference) -> Option<String> {
    match (&reference.digest, &reference.tag) {
        (Some(digest), _) => Some(digest.clone()),
        (None, Some(tag)) => repo.tags.get(tag).cloned(),
        (None, None) => repo.tags.get("latest").cloned(),
    }
}

fn not_found(reference: &ImageReference, what: &str) -> PushError {
    PushError::registry(
        reference.registry.clone(),
        RegistryErrorKind::NotFound,
        format!("{} unknown: {}", what, reference),
    )
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn resolve_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest> {
        self.check(reference, "resolve")?;
        let (bytes, media_type) = self
            .manifest(reference)
            .ok_or_else(|| not_found(reference, "manifest"))?;
        ResolvedManifest::new(bytes, Some(media_type))
    }

    async fn manifest_exists(&self, reference: &ImageReference) -> Result<bool> {
        self.check(reference, "head")?;
        Ok(self.manifest(reference).is_some())
    }

    async fn pull_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        self.check(reference, "pull blob")?;
        let state = self.state.lock();
        state
            .repositories
            .get(&reference.repository_name())
            .and_then(|repo| repo.blobs.get(&descriptor.digest))
            .cloned()
            .ok_or_else(|| not_found(reference, "blob"))
    }

    async fn push_blob(&self, reference: &ImageReference, data: &[u8], digest: &str) -> Result<()> {
        self.check(reference, "push blob")?;
        if sha256_digest(data) != digest {
            return Err(PushError::registry(
                reference.registry.clone(),
                RegistryErrorKind::Rejected,
                format!("digest invalid: {}", digest),
            ));
        }
        let mut state = self.state.lock();
        state
            .repositories
            .entry(reference.repository_name())
            .or_default()
            .blobs
            .insert(digest.to_string(), data.to_vec());
        state.blob_uploads += 1;
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<String> {
        self.check(reference, "push manifest")?;
        let content = ManifestContent::parse(manifest)?;

        let mut state = self.state.lock();
        let refused = state
            .rejected_media_types
            .get(&reference.registry)
            .map_or(false, |types| {
                types.contains(media_type)
                    || content
                        .config
                        .as_ref()
                        .map_or(false, |c| types.contains(&c.media_type))
            });
        if refused {
            state.rejected_uploads += 1;
            return Err(PushError::registry(
                reference.registry.clone(),
                RegistryErrorKind::Rejected,
                format!("manifest invalid: unsupported media type {}", media_type),
            ));
        }

        let repo = state
            .repositories
            .entry(reference.repository_name())
            .or_default();
        let missing_blob = content
            .blobs()
            .filter(|d| d.urls.is_empty())
            .find(|d| !repo.blobs.contains_key(&d.digest));
        let missing_manifest = content
            .manifests
            .iter()
            .find(|d| !repo.manifests.contains_key(&d.digest));
        if let Some(missing) = missing_blob.or(missing_manifest) {
            return Err(PushError::registry(
                reference.registry.clone(),
                RegistryErrorKind::Rejected,
                format!("manifest blob unknown: {}", missing.digest),
            ));
        }

        let digest = sha256_digest(manifest);
        if let Some(ref expected) = reference.digest {
            if *expected != digest {
                return Err(PushError::registry(
                    reference.registry.clone(),
                    RegistryErrorKind::Rejected,
                    format!("digest invalid: expected {}, got {}", expected, digest),
                ));
            }
        }
        store_manifest(repo, reference, manifest.to_vec(), media_type);
        state.manifest_uploads += 1;
        Ok(digest)
    }
}
