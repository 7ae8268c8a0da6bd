//! `cnab-push push` command.

use std::sync::Arc;

use clap::Args;
use cnab_push_core::config::DEFAULT_MAX_CONCURRENCY;
use cnab_push_core::{FixupObserver, Observers, PushConfig, Result, StderrProgress};
use cnab_push_runtime::{
    fixup_bundle, push_bundle, Bundle, BundleStore, ImageReference, OciRegistry, PushResult,
    Registry, ResolverConfig,
};

#[derive(Args)]
pub struct PushArgs {
    /// Bundle name (`name[:version]`), or a path with --bundle-is-file
    pub bundle: String,

    /// Target repository reference (e.g., "registry.example.com/org/app:1.0.0")
    #[arg(short, long)]
    pub target: String,

    /// Treat the bundle argument as a path to a bundle file
    #[arg(short = 'f', long)]
    pub bundle_is_file: bool,

    /// Registries reached over plain HTTP (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub insecure_registries: Vec<String>,

    /// Fall back to more widely supported manifest formats when the
    /// registry rejects the CNAB media types
    #[arg(
        long,
        default_value_t = true,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    pub allow_fallbacks: bool,

    /// Maximum number of images copied at once
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,

    /// Give up copying images after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl PushArgs {
    /// Pipeline configuration from the command-line flags.
    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            max_concurrency: self.max_concurrency,
            allow_fallbacks: self.allow_fallbacks,
            timeout_secs: self.timeout,
            ..Default::default()
        }
    }
}

pub async fn execute(args: PushArgs) -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Reject a bad target before touching the network.
    let target = ImageReference::parse(&args.target)?;

    let store = BundleStore::from_env()?;
    let mut bundle = store.load(&args.bundle, args.bundle_is_file)?;

    let resolver = Arc::new(ResolverConfig::from_default_credential_store(
        &args.insecure_registries,
    ));
    let registry = OciRegistry::new(resolver);
    let observer = progress_observer();

    let result = run(&mut bundle, &target, &registry, &args.push_config(), &observer).await?;

    println!("Pushed successfully, with digest \"{}\"", result.digest);
    Ok(())
}

/// Observers attached to a command-line push. Progress goes to stderr only;
/// copy failures are reported there once.
pub fn progress_observer() -> Observers {
    Observers::new().with(StderrProgress)
}

/// Fix up `bundle` into `target`, then push it.
pub async fn run(
    bundle: &mut Bundle,
    target: &ImageReference,
    registry: &dyn Registry,
    config: &PushConfig,
    observer: &dyn FixupObserver,
) -> Result<PushResult> {
    let summary = fixup_bundle(bundle, target, registry, config, observer).await?;
    tracing::debug!(
        copied = summary.copied,
        present = summary.present,
        "Pushing bundle"
    );
    push_bundle(
        bundle,
        target,
        registry,
        config.retry.clone(),
        config.allow_fallbacks,
    )
    .await
}
