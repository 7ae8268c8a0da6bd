//! CLI command definitions and dispatch.

pub mod push;
mod version;

use clap::{Parser, Subcommand};

/// Push CNAB bundles to OCI registries.
#[derive(Parser)]
#[command(name = "cnab-push", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Copy a bundle's images into a repository and push the bundle there
    Push(push::PushArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Push(args) => push::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
