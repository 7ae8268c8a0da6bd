//! `cnab-push version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("cnab-push version {}", cnab_push_core::VERSION);
    Ok(())
}
