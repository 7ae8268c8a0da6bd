use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of images copied concurrently.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Push pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Upper bound on concurrent image copies
    pub max_concurrency: usize,

    /// Fall back to more widely supported manifest formats when the
    /// target registry rejects custom media types or image indexes
    pub allow_fallbacks: bool,

    /// Overall deadline for fix-up, in seconds
    pub timeout_secs: Option<u64>,

    /// Retry policy for registry calls
    pub retry: RetryConfig,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            allow_fallbacks: true,
            timeout_secs: None,
            retry: RetryConfig::default(),
        }
    }
}

impl PushConfig {
    /// Concurrency limit, never below one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    /// Overall deadline, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Retry policy for transient registry failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub base_backoff_ms: u64,

    /// Backoff cap, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Exponential backoff before retry number `retry` (0-based), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}
