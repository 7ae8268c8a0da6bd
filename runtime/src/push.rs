//! Bundle push.
//!
//! Uploads a fixed-up bundle as a config blob, a config manifest and a
//! tagged index. The manifest encoding is negotiated per target registry:
//! formats are tried most specific first and the first one accepted is
//! remembered for later pushes to the same registry.

use std::collections::HashMap;

use cnab_push_core::config::RetryConfig;
use cnab_push_core::error::{PushError, Result};
use parking_lot::Mutex;

use crate::bundle::Bundle;
use crate::encoder::{EncodedBundle, ManifestFormat};
use crate::reference::ImageReference;
use crate::registry::Registry;
use crate::retry::Retrying;

/// Result of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    /// Digest of the bundle index
    pub digest: String,
    /// Encoding the registry accepted
    pub format: ManifestFormat,
    /// Tagged reference the bundle was pushed to
    pub reference: ImageReference,
}

/// Pushes bundles, caching the accepted manifest format per registry.
pub struct BundlePusher<'a> {
    registry: Retrying<'a>,
    formats: Mutex<HashMap<String, ManifestFormat>>,
}

impl<'a> BundlePusher<'a> {
    pub fn new(registry: &'a dyn Registry, retry: RetryConfig) -> Self {
        Self {
            registry: Retrying::new(registry, retry),
            formats: Mutex::new(HashMap::new()),
        }
    }

    /// Format last accepted by `registry`, if any.
    pub fn known_format(&self, registry: &str) -> Option<ManifestFormat> {
        self.formats.lock().get(registry).copied()
    }

    /// Push `bundle` to `target` and return the index digest.
    ///
    /// Every bundle image must already live in the target repository,
    /// addressed by its content digest.
    pub async fn push(
        &self,
        bundle: &Bundle,
        target: &ImageReference,
        allow_fallbacks: bool,
    ) -> Result<PushResult> {
        if target.digest.is_some() {
            return Err(PushError::InvalidReference(format!(
                "Push target {} must be a tag, not a digest",
                target
            )));
        }
        self.check_references(bundle, target).await?;

        let candidates = self.candidates(&target.registry, allow_fallbacks);
        let mut last_rejection = None;
        for format in candidates {
            let encoded = format.encode(bundle)?;
            match self.push_encoded(target, &encoded).await {
                Ok(digest) => {
                    self.formats.lock().insert(target.registry.clone(), format);
                    tracing::info!(
                        reference = %target,
                        digest = %digest,
                        format = %format,
                        "Bundle pushed"
                    );
                    return Ok(PushResult {
                        digest,
                        format,
                        reference: target.clone(),
                    });
                }
                Err(e) if e.is_rejected() && allow_fallbacks => {
                    tracing::warn!(
                        registry = %target.registry,
                        format = %format,
                        error = %e,
                        "Registry rejected manifest format, trying next"
                    );
                    last_rejection = Some(e);
                }
                Err(e) => return Err(push_error(target, e)),
            }
        }

        Err(push_error(
            target,
            last_rejection.unwrap_or_else(|| {
                PushError::Config("No manifest format available".to_string())
            }),
        ))
    }

    /// Formats to try: the cached one first, then the rest in order.
    fn candidates(&self, registry: &str, allow_fallbacks: bool) -> Vec<ManifestFormat> {
        let all = ManifestFormat::candidates(allow_fallbacks);
        match self.known_format(registry) {
            Some(known) if all.contains(&known) => std::iter::once(known)
                .chain(all.iter().copied().filter(|f| *f != known))
                .collect(),
            _ => all.to_vec(),
        }
    }

    /// Reject bundles whose images are not in the target repository.
    async fn check_references(&self, bundle: &Bundle, target: &ImageReference) -> Result<()> {
        for (slot, image) in bundle.registry_images() {
            let dangling = || PushError::DanglingReference {
                image: image.image.clone(),
                target: target.repository_name(),
            };
            let reference = ImageReference::parse(&image.image).map_err(|_| dangling())?;
            let fixed_up = reference.same_repository(target)
                && reference.digest.is_some()
                && reference.digest == image.content_digest;
            if !fixed_up {
                tracing::debug!(slot = %slot, image = %image.image, "Image not fixed up");
                return Err(dangling());
            }
            if !self.registry.manifest_exists(&reference).await? {
                tracing::debug!(slot = %slot, image = %image.image, "Image missing at target");
                return Err(dangling());
            }
        }
        Ok(())
    }

    async fn push_encoded(&self, target: &ImageReference, encoded: &EncodedBundle) -> Result<String> {
        let config_digest = encoded.config_digest();
        self.registry
            .push_blob(target, &encoded.config_blob, &config_digest)
            .await?;

        let config_manifest = target.with_digest(encoded.config_manifest_digest());
        self.registry
            .push_manifest(
                &config_manifest,
                &encoded.config_manifest,
                encoded.format.manifest_media_type(),
            )
            .await?;

        self.registry
            .push_manifest(target, &encoded.index, encoded.format.index_media_type())
            .await
    }
}

/// Push `bundle` to `target` with a one-off pusher.
pub async fn push_bundle(
    bundle: &Bundle,
    target: &ImageReference,
    registry: &dyn Registry,
    retry: RetryConfig,
    allow_fallbacks: bool,
) -> Result<PushResult> {
    BundlePusher::new(registry, retry)
        .push(bundle, target, allow_fallbacks)
        .await
}

fn push_error(target: &ImageReference, source: PushError) -> PushError {
    PushError::Push {
        target: target.to_string(),
        source: Box::new(source),
    }
}
