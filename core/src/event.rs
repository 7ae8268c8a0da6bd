use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of fix-up progress notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupEventKind {
    /// An image copy is about to begin
    CopyImageStart,
    /// An image copy finished, successfully or not
    CopyImageEnd,
}

/// Fix-up progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixupEvent {
    /// Event kind
    pub kind: FixupEventKind,

    /// Image reference as found in the bundle
    pub source_image: String,

    /// Target repository reference the image is copied to
    pub destination: String,

    /// Manifest digest being copied, when known
    pub digest: Option<String>,

    /// Failure detail on an unsuccessful copy end
    pub error: Option<String>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl FixupEvent {
    /// Create a copy-start event
    pub fn copy_start(
        source_image: impl Into<String>,
        destination: impl Into<String>,
        digest: Option<String>,
    ) -> Self {
        Self {
            kind: FixupEventKind::CopyImageStart,
            source_image: source_image.into(),
            destination: destination.into(),
            digest,
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create a copy-end event; `error` is `None` on success
    pub fn copy_end(
        source_image: impl Into<String>,
        destination: impl Into<String>,
        digest: Option<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            kind: FixupEventKind::CopyImageEnd,
            source_image: source_image.into(),
            destination: destination.into(),
            digest,
            error,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Whether this event reports a failed copy
    pub fn is_failure(&self) -> bool {
        self.kind == FixupEventKind::CopyImageEnd && self.error.is_some()
    }
}

/// Receives fix-up events. Has no influence on the pipeline outcome.
pub trait FixupObserver: Send + Sync {
    /// Handle one event and return
    fn handle(&self, event: &FixupEvent);
}

impl<F> FixupObserver for F
where
    F: Fn(&FixupEvent) + Send + Sync,
{
    fn handle(&self, event: &FixupEvent) {
        self(event)
    }
}

/// Discards every event
pub struct NoopObserver;

impl FixupObserver for NoopObserver {
    fn handle(&self, _event: &FixupEvent) {}
}

/// Writes human-readable progress lines to stderr
pub struct StderrProgress;

impl StderrProgress {
    /// Render an event as a progress line
    pub fn render(event: &FixupEvent) -> String {
        match (event.kind, &event.error) {
            (FixupEventKind::CopyImageStart, _) => {
                format!("Starting to copy image {}...", event.source_image)
            }
            (FixupEventKind::CopyImageEnd, Some(err)) => {
                format!("Failed to copy image {}: {}", event.source_image, err)
            }
            (FixupEventKind::CopyImageEnd, None) => {
                format!("Completed image {} copy", event.source_image)
            }
        }
    }
}

impl FixupObserver for StderrProgress {
    fn handle(&self, event: &FixupEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", Self::render(event));
    }
}

/// Logs events through `tracing`
pub struct TracingObserver;

impl FixupObserver for TracingObserver {
    fn handle(&self, event: &FixupEvent) {
        match (event.kind, &event.error) {
            (FixupEventKind::CopyImageStart, _) => tracing::info!(
                image = %event.source_image,
                destination = %event.destination,
                "Copying image"
            ),
            (FixupEventKind::CopyImageEnd, Some(err)) => tracing::warn!(
                image = %event.source_image,
                error = %err,
                "Image copy failed"
            ),
            (FixupEventKind::CopyImageEnd, None) => tracing::info!(
                image = %event.source_image,
                digest = event.digest.as_deref().unwrap_or("-"),
                "Image copied"
            ),
        }
    }
}

/// Forwards events into a channel
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<FixupEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FixupEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl FixupObserver for ChannelObserver {
    fn handle(&self, event: &FixupEvent) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.sender.send(event.clone());
    }
}

/// Fans each event out to several observers, in registration order
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn FixupObserver>>,
}

impl Observers {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer
    pub fn with(mut self, observer: impl FixupObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Number of registered observers
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer is registered
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl FixupObserver for Observers {
    fn handle(&self, event: &FixupEvent) {
        for observer in &self.observers {
            observer.handle(event);
        }
    }
}
