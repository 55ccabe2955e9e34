// file: src/cli/args.rs
// version: 1.2.0
// guid: 8f901234-5678-90ab-cdef-0123456789ab

//! Argument definitions.

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pi-provision-agent",
    about = "Flash removable media and drive unattended single-board installs",
    version
)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Image cache directory
    #[arg(long, global = true, env = "PI_PROVISION_CACHE")]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List removable storage devices
    ListDevices(ListDevicesArgs),
    /// Generate an SSH keypair for provisioning
    GenerateKeys(GenerateKeysArgs),
    /// Flash an OS image to a removable device
    Flash(FlashArgs),
    /// Search the local network for a provisioned target
    Discover(DiscoverArgs),
    /// Verify SSH connectivity to a target
    TestConnection(TestConnectionArgs),
    /// Run the staged remote installation on a target
    Install(InstallArgs),
}

#[derive(Args)]
pub struct ListDevicesArgs {
    /// Emit machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct GenerateKeysArgs {
    /// Encrypt the private key with this passphrase and print the blob
    #[arg(long)]
    pub encrypt: Option<String>,

    /// Write the keypair to <PATH> and <PATH>.pub instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct FlashArgs {
    /// Raw device path to flash, as reported by list-devices
    #[arg(short, long)]
    pub device: String,

    /// Provisioning configuration file (TOML or JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Explicit image URL; defaults to the latest lite arm64 release
    #[arg(long)]
    pub image_url: Option<String>,
}

#[derive(Args)]
pub struct DiscoverArgs {
    /// Hostname to search for (without .local)
    pub hostname: String,

    /// Seconds between attempts
    #[arg(long, default_value_t = 8)]
    pub interval: u64,

    /// Attempt ceiling
    #[arg(long, default_value_t = 60)]
    pub attempts: u32,

    /// Allow boot time before the first attempt (freshly flashed target)
    #[arg(long)]
    pub fresh: bool,
}

#[derive(Args)]
pub struct TestConnectionArgs {
    /// Target IP address
    pub host: IpAddr,

    /// Remote account name
    #[arg(short, long)]
    pub username: String,

    #[command(flatten)]
    pub auth: AuthArgs,
}

#[derive(Args)]
pub struct InstallArgs {
    /// Target hostname or IP address
    pub target: String,

    /// Remote account name
    #[arg(short, long)]
    pub username: String,

    /// Service payload file (TOML or JSON)
    #[arg(short, long)]
    pub services: PathBuf,

    /// Target was just flashed; wait for it to boot before connecting
    #[arg(long)]
    pub fresh: bool,

    /// Installation registry endpoint; when set the run is recorded there
    #[arg(long, env = "PROVISION_STORE_URL")]
    pub store_url: Option<String>,

    /// Registry API key
    #[arg(long, env = "PROVISION_STORE_KEY", hide_env_values = true)]
    pub store_key: Option<String>,

    /// Passphrase protecting the private key at rest in the registry
    #[arg(long, env = "PROVISION_STORE_PASSPHRASE", hide_env_values = true)]
    pub store_passphrase: Option<String>,

    #[command(flatten)]
    pub auth: AuthArgs,
}

/// Exactly one authentication mode; there is no fallback between them.
#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct AuthArgs {
    /// OpenSSH private key file
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// Account password
    #[arg(short, long)]
    pub password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_auth_modes_are_mutually_exclusive() {
        let err = Cli::try_parse_from([
            "pi-provision-agent",
            "test-connection",
            "192.168.1.40",
            "--username",
            "pi",
            "--key",
            "id_ed25519",
            "--password",
            "pw",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn test_auth_is_required() {
        let err = Cli::try_parse_from([
            "pi-provision-agent",
            "test-connection",
            "192.168.1.40",
            "--username",
            "pi",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn test_discover_defaults() {
        let cli = Cli::try_parse_from(["pi-provision-agent", "discover", "jellypi"]).unwrap();
        match cli.command {
            Commands::Discover(args) => {
                assert_eq!(args.interval, 8);
                assert_eq!(args.attempts, 60);
                assert!(!args.fresh);
            }
            _ => panic!("wrong command"),
        }
    }
}
