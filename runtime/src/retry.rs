//! Retry with exponential backoff for transient registry failures.

use std::future::Future;

use async_trait::async_trait;
use cnab_push_core::config::RetryConfig;
use cnab_push_core::error::Result;

use crate::reference::ImageReference;
use crate::registry::{Descriptor, Registry, ResolvedManifest};

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retry + 1 < attempts => {
                let backoff = policy.backoff(retry);
                tracing::warn!(
                    operation,
                    attempt = retry + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient registry failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Registry decorator that retries transient failures of every call.
pub struct Retrying<'a> {
    inner: &'a dyn Registry,
    policy: RetryConfig,
}

impl<'a> Retrying<'a> {
    pub fn new(inner: &'a dyn Registry, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Registry for Retrying<'_> {
    async fn resolve_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest> {
        with_retry(&self.policy, "resolve manifest", || {
            self.inner.resolve_manifest(reference)
        })
        .await
    }

    async fn manifest_exists(&self, reference: &ImageReference) -> Result<bool> {
        with_retry(&self.policy, "check manifest", || {
            self.inner.manifest_exists(reference)
        })
        .await
    }

    async fn pull_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        with_retry(&self.policy, "pull blob", || {
            self.inner.pull_blob(reference, descriptor)
        })
        .await
    }

    async fn push_blob(&self, reference: &ImageReference, data: &[u8], digest: &str) -> Result<()> {
        with_retry(&self.policy, "push blob", || {
            self.inner.push_blob(reference, data, digest)
        })
        .await
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<String> {
        with_retry(&self.policy, "push manifest", || {
            self.inner.push_manifest(reference, manifest, media_type)
        })
        .await
    }
}
