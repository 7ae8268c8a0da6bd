//! End-to-end fix-up and push against the in-process registry.

use cnab_push_core::event::{ChannelObserver, FixupEvent, FixupEventKind};
use cnab_push_core::{PushConfig, PushError, RegistryErrorKind};
use cnab_push_runtime::{
    fixup_bundle, push_bundle, Bundle, BundleFixer, BundlePusher, ImageReference,
    ManifestFormat, MemoryRegistry,
};
use cnab_push_runtime::registry::media_types;

const BUNDLE: &str = r#"{
    "schemaVersion": "v1.0.0",
    "name": "wordpress",
    "version": "0.2.0",
    "description": "WordPress with MySQL",
    "keywords": ["wordpress"],
    "invocationImages": [
        {"imageType": "docker", "image": "docker.io/cnab/wordpress-installer:0.2.0"}
    ],
    "images": {
        "mysql": {"imageType": "oci", "image": "docker.io/library/mysql:8.0", "description": "database"}
    },
    "actions": {"backup": {"modifies": false}},
    "parameters": {"port": {"definition": "port", "destination": {"env": "PORT"}}}
}"#;

const TARGET: &str = "registry.example.com/apps/wordpress:0.2.0";

fn config() -> PushConfig {
    let mut config = PushConfig::default();
    config.retry.base_backoff_ms = 1;
    config
}

fn seeded_registry() -> MemoryRegistry {
    let registry = MemoryRegistry::new();
    registry
        .insert_image("docker.io/cnab/wordpress-installer:0.2.0", &[b"installer layer"])
        .unwrap();
    registry
        .insert_image("docker.io/library/mysql:8.0", &[b"mysql base", b"mysql data"])
        .unwrap();
    registry
}

async fn drain(mut events: tokio::sync::mpsc::UnboundedReceiver<FixupEvent>) -> Vec<FixupEvent> {
    let mut out = Vec::new();
    while let Some(event) = events.recv().await {
        out.push(event);
    }
    out
}

/// Fix up a fresh copy of the bundle and push it; returns the events seen.
async fn cycle(registry: &MemoryRegistry) -> (Bundle, String, Vec<FixupEvent>) {
    let target = ImageReference::parse(TARGET).unwrap();
    let mut bundle = Bundle::from_slice(BUNDLE.as_bytes()).unwrap();
    let (observer, events) = ChannelObserver::new();

    fixup_bundle(&mut bundle, &target, registry, &config(), &observer)
        .await
        .unwrap();
    drop(observer);

    let result = push_bundle(&bundle, &target, registry, config().retry, true)
        .await
        .unwrap();
    (bundle, result.digest, drain(events).await)
}

#[tokio::test]
async fn test_two_images_copied_then_pushed() {
    let registry = seeded_registry();
    let (bundle, digest, events) = cycle(&registry).await;

    let kinds: Vec<FixupEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == FixupEventKind::CopyImageStart)
            .count(),
        2
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == FixupEventKind::CopyImageEnd)
            .count(),
        2
    );
    assert!(events.iter().all(|e| !e.is_failure()));

    assert!(digest.starts_with("sha256:"));
    assert_eq!(digest.len(), "sha256:".len() + 64);
    assert!(digest["sha256:".len()..]
        .chars()
        .all(|c| c.is_ascii_hexdigit()));

    // Every image now resolves by digest at the target.
    let target = ImageReference::parse(TARGET).unwrap();
    for (_, image) in bundle.registry_images() {
        let reference = ImageReference::parse(&image.image).unwrap();
        assert!(reference.same_repository(&target));
        assert_eq!(reference.digest, image.content_digest);
        assert!(registry.manifest(&reference).is_some());
    }
    assert_eq!(registry.tagged_digest(&target), Some(digest));
}

#[tokio::test]
async fn test_second_cycle_copies_nothing() {
    let registry = seeded_registry();
    let (first_bundle, first_digest, _) = cycle(&registry).await;
    let uploads = registry.blob_uploads();

    let (second_bundle, second_digest, events) = cycle(&registry).await;
    assert!(events.is_empty());
    assert_eq!(first_bundle, second_bundle);
    assert_eq!(first_digest, second_digest);
    // Only the bundle config blob is re-sent.
    assert_eq!(registry.blob_uploads(), uploads + 1);
}

#[tokio::test]
async fn test_fixup_of_fixed_up_bundle_is_stable() {
    let registry = seeded_registry();
    let target = ImageReference::parse(TARGET).unwrap();
    let mut bundle = Bundle::from_slice(BUNDLE.as_bytes()).unwrap();
    fixup_bundle(&mut bundle, &target, &registry, &config(), &cnab_push_core::NoopObserver)
        .await
        .unwrap();

    let mut again = bundle.clone();
    let summary = fixup_bundle(&mut again, &target, &registry, &config(), &cnab_push_core::NoopObserver)
        .await
        .unwrap();
    assert_eq!(summary.copied, 0);
    assert_eq!(summary.present, 2);
    assert_eq!(again, bundle);
}

#[tokio::test]
async fn test_missing_source_image_prevents_push() {
    let registry = MemoryRegistry::new();
    registry
        .insert_image("docker.io/cnab/wordpress-installer:0.2.0", &[b"installer layer"])
        .unwrap();

    let target = ImageReference::parse(TARGET).unwrap();
    let mut bundle = Bundle::from_slice(BUNDLE.as_bytes()).unwrap();
    let original = bundle.clone();
    let (observer, events) = ChannelObserver::new();

    let err = fixup_bundle(&mut bundle, &target, &registry, &config(), &observer)
        .await
        .unwrap_err();
    drop(observer);

    assert!(err.is_not_found());
    assert!(err.to_string().contains("docker.io/library/mysql:8.0"));
    assert_eq!(bundle, original);

    let failures: Vec<FixupEvent> = drain(events)
        .await
        .into_iter()
        .filter(FixupEvent::is_failure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].source_image, "docker.io/library/mysql:8.0");

    // The unmodified bundle is refused by push.
    let push = push_bundle(&bundle, &target, &registry, config().retry, true).await;
    assert!(matches!(push, Err(PushError::DanglingReference { .. })));
    assert!(registry.tagged_digest(&target).is_none());
}

#[tokio::test]
async fn test_restrictive_registry_falls_back_everywhere() {
    let registry = MemoryRegistry::new();
    let amd64 = registry
        .insert_image("docker.io/library/mysql:8.0-amd64", &[b"amd64"])
        .unwrap();
    let arm64 = registry
        .insert_image("docker.io/library/mysql:8.0-arm64", &[b"arm64"])
        .unwrap();
    registry
        .insert_index(
            "docker.io/library/mysql:8.0",
            &[(amd64.as_str(), "linux/amd64"), (arm64.as_str(), "linux/arm64")],
        )
        .unwrap();
    registry
        .insert_image("docker.io/cnab/wordpress-installer:0.2.0", &[b"installer layer"])
        .unwrap();
    registry.reject_media_type("registry.example.com", media_types::OCI_INDEX);
    registry.reject_media_type("registry.example.com", media_types::CNAB_CONFIG);

    let target = ImageReference::parse(TARGET).unwrap();
    let fixer = BundleFixer::new(&registry, config());
    let pusher = BundlePusher::new(&registry, config().retry);

    let mut bundle = Bundle::from_slice(BUNDLE.as_bytes()).unwrap();
    fixer
        .fixup(&mut bundle, &target, &cnab_push_core::NoopObserver)
        .await
        .unwrap();
    assert_eq!(fixer.accepts_indexes("registry.example.com"), Some(false));
    let mysql = bundle.images["mysql"].content_digest.clone().unwrap();
    assert!(mysql == amd64 || mysql == arm64);

    let result = pusher.push(&bundle, &target, true).await.unwrap();
    assert_eq!(result.format, ManifestFormat::DockerManifestList);

    // Second cycle: no copies, no refused uploads, same digest.
    let rejected = registry.rejected_uploads();
    let (observer, events) = ChannelObserver::new();
    let mut again = Bundle::from_slice(BUNDLE.as_bytes()).unwrap();
    let summary = fixer.fixup(&mut again, &target, &observer).await.unwrap();
    drop(observer);
    assert_eq!(summary.copied, 0);
    assert_eq!(summary.present, 2);
    assert!(drain(events).await.is_empty());
    assert_eq!(again, bundle);

    let second = pusher.push(&again, &target, true).await.unwrap();
    assert_eq!(second.digest, result.digest);
    assert_eq!(registry.rejected_uploads(), rejected);
}

#[tokio::test]
async fn test_unauthorized_source_is_not_retried() {
    let registry = seeded_registry();
    registry
        .break_repository("docker.io/library/mysql", RegistryErrorKind::Unauthorized)
        .unwrap();

    // A retry would sleep far past the deadline and surface as a timeout.
    let mut config = PushConfig::default();
    config.retry.base_backoff_ms = 60_000;
    config.timeout_secs = Some(5);

    let target = ImageReference::parse(TARGET).unwrap();
    let mut bundle = Bundle::from_slice(BUNDLE.as_bytes()).unwrap();
    let err = fixup_bundle(&mut bundle, &target, &registry, &config, &cnab_push_core::NoopObserver)
        .await
        .unwrap_err();
    assert!(matches!(err, PushError::Resolution { ref image, .. } if image == "docker.io/library/mysql:8.0"));
    assert_eq!(err.registry_kind(), Some(RegistryErrorKind::Unauthorized));
    assert!(registry.tagged_digest(&target).is_none());
}

#[test]
fn test_invalid_target_reference() {
    for bad in [
        "",
        "Registry.example.com/UPPER/case",
        "ghcr.io/org/app:bad tag",
        "ghcr.io/org/app@sha256:zz",
        "bad host.io/org/app:1",
        "ghcr.io:notaport/org/app:1",
        "gh*cr.io/org/app",
    ] {
        assert!(
            matches!(ImageReference::parse(bad), Err(PushError::InvalidReference(_))),
            "{:?} should be rejected",
            bad
        );
    }
}
