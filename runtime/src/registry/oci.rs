//! OCI registry client for copying images and pushing bundles.
//!
//! Uses the `oci-distribution` crate to interact with container registries
//! (Docker Hub, GHCR, etc.).

use std::sync::Arc;

use async_trait::async_trait;
use cnab_push_core::error::{PushError, RegistryErrorKind, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciEnvelope, OciErrorCode};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use super::{media_types, Descriptor, Registry, ResolvedManifest};
use crate::digest::{sha256_digest, verify};
use crate::reference::ImageReference;
use crate::resolver::ResolverConfig;

/// Registry access over the distribution HTTP API.
pub struct OciRegistry {
    client: Client,
    resolver: Arc<ResolverConfig>,
}

impl OciRegistry {
    /// Create a client; registries flagged insecure are reached over plain HTTP.
    pub fn new(resolver: Arc<ResolverConfig>) -> Self {
        let insecure = resolver.insecure_registries();
        let protocol = if insecure.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(insecure)
        };
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        let client = Client::new(config);
        Self { client, resolver }
    }

    fn auth(&self, reference: &ImageReference) -> OciRegistryAuth {
        self.resolver.auth_for(&reference.registry).to_oci_auth()
    }

    /// Authenticate for `operation` on the repository of `reference`.
    async fn authenticate(
        &self,
        oci_ref: &Reference,
        reference: &ImageReference,
        operation: RegistryOperation,
    ) -> Result<()> {
        self.client
            .auth(oci_ref, &self.auth(reference), operation)
            .await
            .map(|_| ())
            .map_err(|e| registry_error(reference, "Failed to authenticate", e))
    }

    /// Convert an ImageReference to an oci-distribution Reference.
    fn to_oci_reference(&self, reference: &ImageReference) -> Result<Reference> {
        let ref_str = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => format!("{}@{}", reference.repository_name(), digest),
            (None, Some(tag)) => format!("{}:{}", reference.repository_name(), tag),
            (None, None) => format!("{}:latest", reference.repository_name()),
        };

        ref_str.parse::<Reference>().map_err(|e| {
            PushError::InvalidReference(format!(
                "Invalid OCI reference '{}': {}",
                ref_str, e
            ))
        })
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn resolve_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest> {
        let oci_ref = self.to_oci_reference(reference)?;

        tracing::debug!(reference = %reference, "Resolving manifest");

        let (bytes, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &self.auth(reference), media_types::ACCEPTED_MANIFESTS)
            .await
            .map_err(|e| registry_error(reference, "Failed to pull manifest", e))?;

        let manifest = ResolvedManifest::new(bytes.to_vec(), None)?;
        if !digest.is_empty() && digest != manifest.digest {
            tracing::warn!(
                reference = %reference,
                reported = %digest,
                computed = %manifest.digest,
                "Registry reported a different manifest digest"
            );
        }
        Ok(manifest)
    }

    async fn manifest_exists(&self, reference: &ImageReference) -> Result<bool> {
        let oci_ref = self.to_oci_reference(reference)?;
        match self
            .client
            .fetch_manifest_digest(&oci_ref, &self.auth(reference))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match classify(&e) {
                RegistryErrorKind::NotFound => Ok(false),
                _ => Err(registry_error(reference, "Failed to check manifest", e)),
            },
        }
    }

    async fn pull_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let oci_ref = self.to_oci_reference(reference)?;
        self.authenticate(&oci_ref, reference, RegistryOperation::Pull)
            .await?;

        tracing::debug!(
            digest = %descriptor.digest,
            size = descriptor.size,
            "Pulling blob"
        );

        let layer = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: descriptor.size as i64,
            urls: None,
            annotations: None,
        };
        let mut data: Vec<u8> = Vec::with_capacity(descriptor.size as usize);
        self.client
            .pull_blob(&oci_ref, &layer, &mut data)
            .await
            .map_err(|e| {
                registry_error(
                    reference,
                    &format!("Failed to pull blob {}", descriptor.digest),
                    e,
                )
            })?;

        verify(&descriptor.digest, &data)?;
        Ok(data)
    }

    async fn push_blob(&self, reference: &ImageReference, data: &[u8], digest: &str) -> Result<()> {
        let oci_ref = self.to_oci_reference(reference)?;
        self.authenticate(&oci_ref, reference, RegistryOperation::Push)
            .await?;

        tracing::debug!(digest = %digest, size = data.len(), "Pushing blob");

        self.client
            .push_blob(&oci_ref, data, digest)
            .await
            .map(|_| ())
            .map_err(|e| registry_error(reference, &format!("Failed to push blob {}", digest), e))
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<String> {
        let oci_ref = self.to_oci_reference(reference)?;
        self.authenticate(&oci_ref, reference, RegistryOperation::Push)
            .await?;

        let content_type = media_type.parse().map_err(|_| {
            PushError::registry(
                reference.registry.clone(),
                RegistryErrorKind::Rejected,
                format!("Invalid media type '{}'", media_type),
            )
        })?;
        let manifest_url = self
            .client
            .push_manifest_raw(&oci_ref, manifest.to_vec(), content_type)
            .await
            .map_err(|e| registry_error(reference, "Failed to push manifest", e))?;

        tracing::debug!(
            reference = %reference,
            manifest_url = %manifest_url,
            "Manifest pushed"
        );

        Ok(sha256_digest(manifest))
    }
}

/// Wrap an oci-distribution error with its classification.
fn registry_error(reference: &ImageReference, context: &str, err: OciDistributionError) -> PushError {
    PushError::registry(
        reference.registry.clone(),
        classify(&err),
        format!("{} {}: {}", context, reference, err),
    )
}

/// Map an oci-distribution error onto the retry/fallback classification.
fn classify(err: &OciDistributionError) -> RegistryErrorKind {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => RegistryErrorKind::NotFound,
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => RegistryErrorKind::Unauthorized,
        OciDistributionError::UnsupportedMediaTypeError(_) => RegistryErrorKind::Rejected,
        OciDistributionError::ServerError { code, .. } => classify_status(*code),
        OciDistributionError::RequestError(_) => RegistryErrorKind::Transient,
        OciDistributionError::RegistryError { envelope, .. } => classify_envelope(envelope),
        _ => RegistryErrorKind::Other,
    }
}

fn classify_status(code: u16) -> RegistryErrorKind {
    match code {
        404 => RegistryErrorKind::NotFound,
        401 | 403 => RegistryErrorKind::Unauthorized,
        400 | 415 | 422 => RegistryErrorKind::Rejected,
        408 | 429 => RegistryErrorKind::Transient,
        c if c >= 500 => RegistryErrorKind::Transient,
        _ => RegistryErrorKind::Other,
    }
}

/// Classify a registry error envelope by its error codes. The first code
/// with a known classification wins.
fn classify_envelope(envelope: &OciEnvelope) -> RegistryErrorKind {
    envelope
        .errors
        .iter()
        .map(|error| classify_code(&error.code))
        .find(|kind| *kind != RegistryErrorKind::Other)
        .unwrap_or(RegistryErrorKind::Other)
}

fn classify_code(code: &OciErrorCode) -> RegistryErrorKind {
    match code {
        OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown | OciErrorCode::BlobUnknown => {
            RegistryErrorKind::NotFound
        }
        OciErrorCode::Unauthorized | OciErrorCode::Denied => RegistryErrorKind::Unauthorized,
        OciErrorCode::ManifestInvalid
        | OciErrorCode::ManifestBlobUnknown
        | OciErrorCode::Unsupported
        | OciErrorCode::NameInvalid
        | OciErrorCode::TagInvalid => RegistryErrorKind::Rejected,
        OciErrorCode::Toomanyrequests => RegistryErrorKind::Transient,
        _ => RegistryErrorKind::Other,
    }
}
