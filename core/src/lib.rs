//! CNAB Push Core - Foundational Types
//!
//! Error taxonomy, pipeline configuration and fix-up events shared by the
//! runtime and the command-line front end.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{PushConfig, RetryConfig};
pub use error::{PushError, RegistryErrorKind, Result};
pub use event::{
    ChannelObserver, FixupEvent, FixupEventKind, FixupObserver, NoopObserver, Observers,
    StderrProgress, TracingObserver,
};

/// CNAB Push version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
