//! CNAB Push Runtime - bundle fix-up and push pipeline.
//!
//! Copies the images a CNAB bundle references into a single target
//! repository, rewrites the bundle to address them by digest, and pushes
//! the bundle itself as an index in that repository.

#![allow(clippy::result_large_err)]

pub mod bundle;
pub mod credentials;
pub mod digest;
pub mod encoder;
pub mod fixup;
pub mod push;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod store;

// Re-export common types
pub use bundle::{Bundle, BundleImage, ImageSlot};
pub use credentials::CredentialStore;
pub use encoder::{EncodedBundle, ManifestFormat};
pub use fixup::{fixup_bundle, BundleFixer, FixupSummary};
pub use push::{push_bundle, BundlePusher, PushResult};
pub use reference::ImageReference;
pub use registry::{MemoryRegistry, OciRegistry, Registry};
pub use resolver::{RegistryAuth, ResolverConfig};
pub use retry::{with_retry, Retrying};
pub use store::BundleStore;

/// CNAB Push Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
