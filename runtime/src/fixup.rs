//! Bundle fix-up: copy every referenced image into the target repository
//! and rewrite the bundle to address them there by digest.
//!
//! ```text
//!   source image ──resolve──► digest ──present at target?──► yes: rewrite
//!                                                         └► no: copy, rewrite
//! ```
//!
//! Images are processed concurrently, bounded by a semaphore. Rewrites are
//! applied only once every image succeeded, so a failed fix-up leaves the
//! bundle untouched.
//!
//! Whether a target registry accepts image indexes is learned from the first
//! refused upload and remembered per registry. Once a registry is known to
//! refuse them, multi-platform sources are reduced to one platform manifest
//! before anything is checked or copied.

use std::collections::HashMap;

use cnab_push_core::config::PushConfig;
use cnab_push_core::error::{PushError, Result};
use cnab_push_core::event::{FixupEvent, FixupObserver};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::bundle::{Bundle, ImageSlot};
use crate::digest::verify;
use crate::reference::ImageReference;
use crate::registry::{Descriptor, Registry, ResolvedManifest};
use crate::retry::Retrying;

/// Outcome of a successful fix-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixupSummary {
    /// Images copied into the target repository
    pub copied: usize,
    /// Images already present at the target
    pub present: usize,
}

/// New values for one bundle image.
#[derive(Debug, Clone)]
struct ImageRewrite {
    image: String,
    digest: String,
    media_type: String,
    size: u64,
}

impl ImageRewrite {
    fn new(target: &ImageReference, manifest: &ResolvedManifest) -> Self {
        Self {
            image: target.with_digest(&manifest.digest).to_string(),
            digest: manifest.digest.clone(),
            media_type: manifest.media_type.clone(),
            size: manifest.size(),
        }
    }
}

struct ImageOutcome {
    rewrite: ImageRewrite,
    copied: bool,
}

/// A distinct source image and the bundle slots referring to it.
struct SourceImage {
    image: String,
    pinned: Option<String>,
    slots: Vec<ImageSlot>,
}

/// Copies bundle images into a target repository, remembering per registry
/// whether image indexes are accepted.
pub struct BundleFixer<'a> {
    registry: Retrying<'a>,
    config: PushConfig,
    index_support: Mutex<HashMap<String, bool>>,
}

impl<'a> BundleFixer<'a> {
    pub fn new(registry: &'a dyn Registry, config: PushConfig) -> Self {
        Self {
            registry: Retrying::new(registry, config.retry.clone()),
            config,
            index_support: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `registry` accepted (`true`) or refused (`false`) an image
    /// index, if that is known yet.
    pub fn accepts_indexes(&self, registry: &str) -> Option<bool> {
        self.index_support.lock().get(registry).copied()
    }

    fn record_index_support(&self, registry: &str, accepted: bool) {
        let previous = self
            .index_support
            .lock()
            .insert(registry.to_string(), accepted);
        if previous != Some(accepted) {
            tracing::debug!(registry, accepted, "Recorded image index support");
        }
    }

    /// Copy the images of `bundle` into the repository of `target` and point
    /// the bundle at the copies.
    ///
    /// On error the bundle is unchanged; content already copied stays at the
    /// target and is skipped by the next attempt.
    pub async fn fixup(
        &self,
        bundle: &mut Bundle,
        target: &ImageReference,
        observer: &dyn FixupObserver,
    ) -> Result<FixupSummary> {
        let sources = collect_sources(bundle);
        let semaphore = Semaphore::new(self.config.concurrency());

        tracing::info!(
            repository = %target.repository_name(),
            images = sources.len(),
            concurrency = self.config.concurrency(),
            "Fixing up bundle images"
        );

        let tasks = sources.iter().map(|source| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| PushError::Config(format!("Copy scheduler closed: {}", e)))?;
                self.fixup_image(target, &source.image, source.pinned.as_deref(), observer)
                    .await
            }
        });
        let all = futures::future::try_join_all(tasks);

        let outcomes = match self.config.timeout() {
            Some(limit) => tokio::time::timeout(limit, all).await.map_err(|_| {
                PushError::Timeout(format!(
                    "Fix-up did not finish within {}s",
                    limit.as_secs()
                ))
            })??,
            None => all.await?,
        };

        let mut summary = FixupSummary::default();
        for (source, outcome) in sources.iter().zip(outcomes) {
            if outcome.copied {
                summary.copied += 1;
            } else {
                summary.present += 1;
            }
            for slot in &source.slots {
                if let Some(image) = bundle.image_mut(slot) {
                    image.image = outcome.rewrite.image.clone();
                    image.content_digest = Some(outcome.rewrite.digest.clone());
                    image.media_type = Some(outcome.rewrite.media_type.clone());
                    image.size = Some(outcome.rewrite.size);
                }
            }
        }

        tracing::info!(
            copied = summary.copied,
            present = summary.present,
            "Bundle fix-up complete"
        );
        Ok(summary)
    }

    async fn fixup_image(
        &self,
        target: &ImageReference,
        image: &str,
        pinned: Option<&str>,
        observer: &dyn FixupObserver,
    ) -> Result<ImageOutcome> {
        let (source, manifest) = match self.resolve_source(target, image, pinned).await {
            Ok(resolved) => resolved,
            Err(e) => {
                observer.handle(&FixupEvent::copy_end(
                    image,
                    target.repository_name(),
                    pinned.map(str::to_string),
                    Some(e.to_string()),
                ));
                return Err(e);
            }
        };

        let destination = target.with_digest(&manifest.digest);
        let present = self
            .registry
            .manifest_exists(&destination)
            .await
            .map_err(|e| copy_error(image, e))?;
        if present {
            tracing::debug!(image, digest = %manifest.digest, "Image already present at target");
            return Ok(ImageOutcome {
                rewrite: ImageRewrite::new(target, &manifest),
                copied: false,
            });
        }

        let digest = Some(manifest.digest.clone());
        observer.handle(&FixupEvent::copy_start(
            image,
            destination.to_string(),
            digest.clone(),
        ));

        let result = self.copy_image(&source, target, manifest).await;

        let error = result.as_ref().err().map(|e| e.to_string());
        observer.handle(&FixupEvent::copy_end(
            image,
            destination.to_string(),
            digest,
            error,
        ));

        let copied = result.map_err(|e| copy_error(image, e))?;
        tracing::info!(image, destination = %target.with_digest(&copied.digest), "Image copied");
        Ok(ImageOutcome {
            rewrite: ImageRewrite::new(target, &copied),
            copied: true,
        })
    }

    /// Parse `image` and fetch its manifest, honoring a pinned digest. An
    /// index bound for a registry known to refuse indexes is replaced by its
    /// platform manifest.
    async fn resolve_source(
        &self,
        target: &ImageReference,
        image: &str,
        pinned: Option<&str>,
    ) -> Result<(ImageReference, ResolvedManifest)> {
        let source = ImageReference::parse(image).map_err(|e| resolution_error(image, e))?;
        let lookup = match pinned {
            Some(digest) => source.with_digest(digest),
            None => source.clone(),
        };
        let manifest = self
            .registry
            .resolve_manifest(&lookup)
            .await
            .map_err(|e| resolution_error(image, e))?;

        if let Some(expected) = pinned {
            if expected != manifest.digest {
                return Err(resolution_error(
                    image,
                    PushError::Bundle(format!(
                        "Content digest {} does not match resolved manifest {}",
                        expected, manifest.digest
                    )),
                ));
            }
        }

        let refuses_indexes = self.accepts_indexes(&target.registry) == Some(false);
        if manifest.is_index() && self.config.allow_fallbacks && refuses_indexes {
            let content = manifest.content().map_err(|e| resolution_error(image, e))?;
            if let Some(child) = select_platform(&content.manifests) {
                tracing::debug!(
                    image,
                    index = %manifest.digest,
                    platform_manifest = %child.digest,
                    "Target refuses image indexes, using platform manifest"
                );
                let child = self
                    .resolve_child(&source, child)
                    .await
                    .map_err(|e| resolution_error(image, e))?;
                return Ok((source, child));
            }
        }
        Ok((source, manifest))
    }

    /// Fetch the manifest an index entry points at, checking its digest.
    async fn resolve_child(
        &self,
        source: &ImageReference,
        child: &Descriptor,
    ) -> Result<ResolvedManifest> {
        let manifest = self
            .registry
            .resolve_manifest(&source.with_digest(&child.digest))
            .await?;
        verify(&child.digest, &manifest.bytes)?;
        Ok(manifest)
    }

    /// Copy an image, falling back to a single platform manifest when the
    /// target refuses indexes.
    async fn copy_image(
        &self,
        source: &ImageReference,
        target: &ImageReference,
        manifest: ResolvedManifest,
    ) -> Result<ResolvedManifest> {
        let index = manifest.is_index().then(|| manifest.clone());
        match copy_manifest(&self.registry, source, target, manifest).await {
            Ok(copied) => {
                if index.is_some() {
                    self.record_index_support(&target.registry, true);
                }
                Ok(copied)
            }
            Err(e) if e.is_rejected() && self.config.allow_fallbacks => match index {
                Some(index) => {
                    self.record_index_support(&target.registry, false);
                    self.copy_platform_manifest(source, target, &index, e).await
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn copy_platform_manifest(
        &self,
        source: &ImageReference,
        target: &ImageReference,
        index: &ResolvedManifest,
        rejection: PushError,
    ) -> Result<ResolvedManifest> {
        let content = index.content()?;
        let Some(child) = select_platform(&content.manifests) else {
            return Err(rejection);
        };
        tracing::warn!(
            source = %source,
            index = %index.digest,
            platform_manifest = %child.digest,
            error = %rejection,
            "Target refused image index, falling back to a single platform manifest"
        );

        let manifest = self.resolve_child(source, child).await?;
        if self
            .registry
            .manifest_exists(&target.with_digest(&manifest.digest))
            .await?
        {
            return Ok(manifest);
        }
        copy_manifest(&self.registry, source, target, manifest).await
    }
}

/// Copy the images of `bundle` into the repository of `target` with a
/// one-off [`BundleFixer`].
pub async fn fixup_bundle(
    bundle: &mut Bundle,
    target: &ImageReference,
    registry: &dyn Registry,
    config: &PushConfig,
    observer: &dyn FixupObserver,
) -> Result<FixupSummary> {
    BundleFixer::new(registry, config.clone())
        .fixup(bundle, target, observer)
        .await
}

/// Group bundle slots by source image, keeping first-seen order.
fn collect_sources(bundle: &Bundle) -> Vec<SourceImage> {
    let mut sources: Vec<SourceImage> = Vec::new();
    let mut seen: HashMap<(String, Option<String>), usize> = HashMap::new();
    for (slot, image) in bundle.registry_images() {
        let key = (image.image.clone(), image.content_digest.clone());
        match seen.get(&key) {
            Some(&i) => sources[i].slots.push(slot),
            None => {
                seen.insert(key, sources.len());
                sources.push(SourceImage {
                    image: image.image.clone(),
                    pinned: image.content_digest.clone(),
                    slots: vec![slot],
                });
            }
        }
    }
    sources
}

/// Manifest for `linux/<host arch>`, else the first entry.
fn select_platform(manifests: &[Descriptor]) -> Option<&Descriptor> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .or_else(|| manifests.first())
}

/// Copy a manifest and everything it references, children before parents,
/// then push the manifest bytes unchanged so its digest is preserved.
fn copy_manifest<'a>(
    registry: &'a dyn Registry,
    source: &'a ImageReference,
    target: &'a ImageReference,
    manifest: ResolvedManifest,
) -> BoxFuture<'a, Result<ResolvedManifest>> {
    async move {
        let content = manifest.content()?;
        if manifest.is_index() {
            for child in &content.manifests {
                if registry
                    .manifest_exists(&target.with_digest(&child.digest))
                    .await?
                {
                    continue;
                }
                let child_manifest = registry
                    .resolve_manifest(&source.with_digest(&child.digest))
                    .await?;
                verify(&child.digest, &child_manifest.bytes)?;
                copy_manifest(registry, source, target, child_manifest).await?;
            }
        } else {
            for blob in content.blobs() {
                if !blob.urls.is_empty() {
                    tracing::debug!(digest = %blob.digest, "Skipping foreign layer");
                    continue;
                }
                let data = registry.pull_blob(source, blob).await?;
                verify(&blob.digest, &data)?;
                registry.push_blob(target, &data, &blob.digest).await?;
            }
        }

        registry
            .push_manifest(
                &target.with_digest(&manifest.digest),
                &manifest.bytes,
                &manifest.media_type,
            )
            .await?;
        Ok(manifest)
    }
    .boxed()
}

fn resolution_error(image: &str, source: PushError) -> PushError {
    PushError::Resolution {
        image: image.to_string(),
        source: Box::new(source),
    }
}

fn copy_error(image: &str, source: PushError) -> PushError {
    PushError::Copy {
        image: image.to_string(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleImage;
    use crate::registry::{media_types, MemoryRegistry, Platform};
    use cnab_push_core::event::{ChannelObserver, FixupEventKind, NoopObserver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bundle_with(images: &[(&str, &str)]) -> Bundle {
        let mut bundle = Bundle::from_slice(
            br#"{"schemaVersion":"v1.0.0","name":"app","version":"1.0.0","invocationImages":[]}"#,
        )
        .unwrap();
        for (name, image) in images {
            if *name == "invocation" {
                let mut invocation = BundleImage::new(*image);
                invocation.image_type = Some("docker".to_string());
                bundle.invocation_images.push(invocation);
            } else {
                bundle
                    .images
                    .insert(name.to_string(), BundleImage::new(*image));
            }
        }
        bundle
    }

    fn target() -> ImageReference {
        ImageReference::parse("registry.example.com/org/app:1.0.0").unwrap()
    }

    fn fast_config() -> PushConfig {
        let mut config = PushConfig::default();
        config.retry.base_backoff_ms = 1;
        config
    }

    #[test]
    fn test_collect_sources_dedups() {
        let bundle = bundle_with(&[
            ("invocation", "ghcr.io/org/installer:v1"),
            ("web", "ghcr.io/org/web:v1"),
            ("web-copy", "ghcr.io/org/web:v1"),
        ]);
        let sources = collect_sources(&bundle);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].slots.len(), 2);
    }

    #[test]
    fn test_select_platform_falls_back_to_first() {
        let entry = |arch: &str| Descriptor {
            media_type: media_types::OCI_MANIFEST.to_string(),
            digest: format!("sha256:{}", arch),
            size: 1,
            urls: Vec::new(),
            platform: Some(Platform {
                architecture: arch.to_string(),
                os: "plan9".to_string(),
                variant: None,
            }),
            annotations: None,
        };
        let entries = vec![entry("mips"), entry("sparc")];
        assert_eq!(select_platform(&entries).unwrap().digest, "sha256:mips");
        assert!(select_platform(&[]).is_none());
    }

    #[tokio::test]
    async fn test_fixup_rewrites_and_dedups() {
        let registry = MemoryRegistry::new();
        let web = registry.insert_image("ghcr.io/org/web:v1", &[b"web"]).unwrap();
        registry
            .insert_image("ghcr.io/org/installer:v1", &[b"inst"])
            .unwrap();

        let mut bundle = bundle_with(&[
            ("invocation", "ghcr.io/org/installer:v1"),
            ("web", "ghcr.io/org/web:v1"),
            ("web-copy", "ghcr.io/org/web:v1"),
        ]);
        let summary = fixup_bundle(&mut bundle, &target(), &registry, &fast_config(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(summary, FixupSummary { copied: 2, present: 0 });

        let expected = format!("registry.example.com/org/app@{}", web);
        for name in ["web", "web-copy"] {
            let image = &bundle.images[name];
            assert_eq!(image.image, expected);
            assert_eq!(image.content_digest.as_deref(), Some(web.as_str()));
            assert_eq!(image.media_type.as_deref(), Some(media_types::OCI_MANIFEST));
            assert!(image.size.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_fixup_failure_leaves_bundle_untouched() {
        let registry = MemoryRegistry::new();
        registry.insert_image("ghcr.io/org/web:v1", &[b"web"]).unwrap();

        let mut bundle = bundle_with(&[
            ("web", "ghcr.io/org/web:v1"),
            ("db", "ghcr.io/org/db:v1"),
        ]);
        let original = bundle.clone();
        let (observer, mut events) = ChannelObserver::new();
        let err = fixup_bundle(&mut bundle, &target(), &registry, &fast_config(), &observer)
            .await
            .unwrap_err();

        assert!(matches!(err, PushError::Resolution { ref image, .. } if image == "ghcr.io/org/db:v1"));
        assert!(err.is_not_found());
        assert_eq!(bundle, original);

        drop(observer);
        let mut failures = 0;
        while let Some(event) = events.recv().await {
            if event.is_failure() {
                failures += 1;
                assert_eq!(event.source_image, "ghcr.io/org/db:v1");
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_missing_blob_is_copy_error() {
        let registry = MemoryRegistry::new();
        registry.insert_image("ghcr.io/org/web:v1", &[b"web"]).unwrap();
        let layer = crate::digest::sha256_digest(b"web");
        assert!(registry.remove_blob("ghcr.io/org/web", &layer).unwrap());

        let mut bundle = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        let (observer, mut events) = ChannelObserver::new();
        let err = fixup_bundle(&mut bundle, &target(), &registry, &fast_config(), &observer)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Copy { .. }));
        assert!(err.is_not_found());

        drop(observer);
        let start = events.recv().await.unwrap();
        assert_eq!(start.kind, FixupEventKind::CopyImageStart);
        let end = events.recv().await.unwrap();
        assert!(end.is_failure());
        assert_eq!(end.digest, start.digest);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pinned_digest_is_honored() {
        let registry = MemoryRegistry::new();
        registry.insert_image("ghcr.io/org/web:v1", &[b"web"]).unwrap();
        let other = registry.insert_image("ghcr.io/org/web:v2", &[b"v2"]).unwrap();

        let mut bundle = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        bundle.images.get_mut("web").unwrap().content_digest = Some(other.clone());
        let summary = fixup_bundle(&mut bundle, &target(), &registry, &fast_config(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(summary.copied, 1);
        assert_eq!(bundle.images["web"].content_digest.as_deref(), Some(other.as_str()));
    }

    #[tokio::test]
    async fn test_index_fallback_copies_platform_manifest() {
        let registry = MemoryRegistry::new();
        let amd64 = registry.insert_image("ghcr.io/org/web:amd64", &[b"a"]).unwrap();
        let arm64 = registry.insert_image("ghcr.io/org/web:arm64", &[b"b"]).unwrap();
        let index = registry
            .insert_index(
                "ghcr.io/org/web:v1",
                &[(amd64.as_str(), "linux/amd64"), (arm64.as_str(), "linux/arm64")],
            )
            .unwrap();
        registry.reject_media_type("registry.example.com", media_types::OCI_INDEX);

        let mut bundle = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        fixup_bundle(&mut bundle, &target(), &registry, &fast_config(), &NoopObserver)
            .await
            .unwrap();
        let digest = bundle.images["web"].content_digest.clone().unwrap();
        assert_ne!(digest, index);
        assert!(digest == amd64 || digest == arm64);
        assert_eq!(bundle.images["web"].media_type.as_deref(), Some(media_types::OCI_MANIFEST));

        let mut strict = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        let config = PushConfig {
            allow_fallbacks: false,
            ..fast_config()
        };
        let err = fixup_bundle(&mut strict, &target(), &registry, &config, &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Copy { .. }));
        assert!(err.is_rejected());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let registry = MemoryRegistry::new();
        registry.insert_image("ghcr.io/org/web:v1", &[b"web"]).unwrap();
        registry.fail_transiently(2);

        let mut bundle = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        let summary = fixup_bundle(&mut bundle, &target(), &registry, &fast_config(), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(summary.copied, 1);
    }

    #[tokio::test]
    async fn test_closure_observer_sees_start_before_end() {
        let registry = MemoryRegistry::new();
        registry.insert_image("ghcr.io/org/web:v1", &[b"web"]).unwrap();
        let kinds = parking_lot::Mutex::new(Vec::new());
        let observer = |event: &FixupEvent| kinds.lock().push(event.kind);

        let mut bundle = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        fixup_bundle(&mut bundle, &target(), &registry, &fast_config(), &observer)
            .await
            .unwrap();
        assert_eq!(
            *kinds.lock(),
            vec![FixupEventKind::CopyImageStart, FixupEventKind::CopyImageEnd]
        );
    }

    /// Registry wrapper that delays blob downloads and records how many
    /// are in flight at once.
    struct SlowRegistry {
        inner: MemoryRegistry,
        delay: std::time::Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SlowRegistry {
        fn new(inner: MemoryRegistry, delay: std::time::Duration) -> Self {
            Self {
                inner,
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Registry for SlowRegistry {
        async fn resolve_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest> {
            self.inner.resolve_manifest(reference).await
        }

        async fn manifest_exists(&self, reference: &ImageReference) -> Result<bool> {
            self.inner.manifest_exists(reference).await
        }

        async fn pull_blob(
            &self,
            reference: &ImageReference,
            descriptor: &Descriptor,
        ) -> Result<Vec<u8>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.pull_blob(reference, descriptor).await
        }

        async fn push_blob(
            &self,
            reference: &ImageReference,
            data: &[u8],
            digest: &str,
        ) -> Result<()> {
            self.inner.push_blob(reference, data, digest).await
        }

        async fn push_manifest(
            &self,
            reference: &ImageReference,
            manifest: &[u8],
            media_type: &str,
        ) -> Result<String> {
            self.inner.push_manifest(reference, manifest, media_type).await
        }
    }

    fn multi_platform_registry(repository: &str) -> (MemoryRegistry, String) {
        let registry = MemoryRegistry::new();
        let amd64 = registry
            .insert_image(&format!("{}:amd64", repository), &[b"amd64 layer"])
            .unwrap();
        let arm64 = registry
            .insert_image(&format!("{}:arm64", repository), &[b"arm64 layer"])
            .unwrap();
        let index = registry
            .insert_index(
                &format!("{}:v1", repository),
                &[(amd64.as_str(), "linux/amd64"), (arm64.as_str(), "linux/arm64")],
            )
            .unwrap();
        (registry, index)
    }

    #[tokio::test]
    async fn test_index_support_is_recorded() {
        let (registry, index) = multi_platform_registry("ghcr.io/org/web");
        let fixer = BundleFixer::new(&registry, fast_config());
        assert_eq!(fixer.accepts_indexes("registry.example.com"), None);

        let mut bundle = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        fixer.fixup(&mut bundle, &target(), &NoopObserver).await.unwrap();
        assert_eq!(fixer.accepts_indexes("registry.example.com"), Some(true));
        assert_eq!(bundle.images["web"].content_digest.as_deref(), Some(index.as_str()));
        assert_eq!(bundle.images["web"].media_type.as_deref(), Some(media_types::OCI_INDEX));
    }

    #[tokio::test]
    async fn test_known_index_refusal_copies_one_platform() {
        let (registry, _) = multi_platform_registry("ghcr.io/org/web");
        registry.reject_media_type("registry.example.com", media_types::OCI_INDEX);
        let fixer = BundleFixer::new(&registry, fast_config());

        let mut first = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        fixer.fixup(&mut first, &target(), &NoopObserver).await.unwrap();
        assert_eq!(fixer.accepts_indexes("registry.example.com"), Some(false));
        let rejected = registry.rejected_uploads();
        let uploads = registry.blob_uploads();

        // Same image again: nothing is attempted or copied.
        let (observer, mut events) = ChannelObserver::new();
        let mut second = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        let summary = fixer.fixup(&mut second, &target(), &observer).await.unwrap();
        drop(observer);
        assert_eq!(summary, FixupSummary { copied: 0, present: 1 });
        assert!(events.recv().await.is_none());
        assert_eq!(registry.rejected_uploads(), rejected);
        assert_eq!(registry.blob_uploads(), uploads);
        assert_eq!(second, first);

        // A new multi-platform image only has its selected platform copied.
        let amd64 = registry.insert_image("ghcr.io/org/db:amd64", &[b"db amd64"]).unwrap();
        let arm64 = registry.insert_image("ghcr.io/org/db:arm64", &[b"db arm64"]).unwrap();
        registry
            .insert_index(
                "ghcr.io/org/db:v1",
                &[(amd64.as_str(), "linux/amd64"), (arm64.as_str(), "linux/arm64")],
            )
            .unwrap();
        let mut third = bundle_with(&[("db", "ghcr.io/org/db:v1")]);
        let summary = fixer.fixup(&mut third, &target(), &NoopObserver).await.unwrap();
        assert_eq!(summary.copied, 1);
        // config and one layer
        assert_eq!(registry.blob_uploads(), uploads + 2);
        assert_eq!(registry.rejected_uploads(), rejected);
        let digest = third.images["db"].content_digest.clone().unwrap();
        assert!(digest == amd64 || digest == arm64);
    }

    #[tokio::test]
    async fn test_timeout_leaves_bundle_untouched() {
        let inner = MemoryRegistry::new();
        inner.insert_image("ghcr.io/org/web:v1", &[b"web"]).unwrap();
        let registry = SlowRegistry::new(inner, std::time::Duration::from_secs(30));

        let mut bundle = bundle_with(&[("web", "ghcr.io/org/web:v1")]);
        let original = bundle.clone();
        let config = PushConfig {
            timeout_secs: Some(1),
            ..fast_config()
        };
        let err = fixup_bundle(&mut bundle, &target(), &registry, &config, &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Timeout(_)));
        assert_eq!(bundle, original);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let inner = MemoryRegistry::new();
        let mut images = Vec::new();
        for i in 0..5 {
            let image = format!("ghcr.io/org/svc{}:v1", i);
            inner
                .insert_image(&image, &[format!("layer {}", i).as_bytes()])
                .unwrap();
            images.push((format!("svc{}", i), image));
        }
        let registry = SlowRegistry::new(inner, std::time::Duration::from_millis(20));

        let pairs: Vec<(&str, &str)> = images
            .iter()
            .map(|(name, image)| (name.as_str(), image.as_str()))
            .collect();
        let mut bundle = bundle_with(&pairs);
        let config = PushConfig {
            max_concurrency: 2,
            ..fast_config()
        };
        let summary = fixup_bundle(&mut bundle, &target(), &registry, &config, &NoopObserver)
            .await
            .unwrap();
        assert_eq!(summary.copied, 5);
        assert_eq!(registry.max_in_flight.load(Ordering::SeqCst), 2);
    }
}
