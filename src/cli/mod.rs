// file: src/cli/mod.rs
// version: 1.1.0
// guid: 7e8f9012-3456-7890-abcd-ef0123456789

//! Command-line interface.

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};

use crate::Result;
use std::path::PathBuf;

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let cache_dir = cli.cache_dir.clone().unwrap_or_else(default_cache_dir);

    match cli.command {
        Commands::ListDevices(args) => commands::list_devices(args).await,
        Commands::GenerateKeys(args) => commands::generate_keys(args).await,
        Commands::Flash(args) => commands::flash(args, cache_dir).await,
        Commands::Discover(args) => commands::discover(args).await,
        Commands::TestConnection(args) => commands::test_connection(args).await,
        Commands::Install(args) => commands::install(args, cache_dir).await,
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pi-provision-agent")
}
