// file: src/main.rs
// version: 1.2.0
// guid: 01234567-890a-bcde-f012-3456789abcde

//! Provisioning agent - Main entry point

use clap::Parser;
use pi_provision_agent::{cli, logging::logger, Result};
use tokio::signal;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    logger::init_logger(args.verbose, args.quiet)?;

    let shutdown_signal = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        warn!("Received Ctrl+C, shutting down...");
    };

    tokio::select! {
        result = cli::run(args) => result,
        _ = shutdown_signal => {
            // Standard exit code for Ctrl+C
            std::process::exit(130);
        }
    }
}
