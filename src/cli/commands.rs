// file: src/cli/commands.rs
// version: 1.3.0
// guid: 90123456-7890-abcd-ef01-23456789abcd

//! Command implementations.

use crate::cli::args::{
    AuthArgs, DiscoverArgs, FlashArgs, GenerateKeysArgs, InstallArgs, ListDevicesArgs,
    TestConnectionArgs,
};
use crate::config::{Credentials, ProvisioningConfig, ServiceConfig};
use crate::discovery::{self, DiscoveryOptions, TargetOverride};
use crate::keys::{self, KeyPair};
use crate::progress::{self, InstallationOutcome, ProgressEvent};
use crate::session::ProvisionSession;
use crate::store::InstallationStore;
use crate::{device, remote, ProvisionError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub async fn list_devices(args: ListDevicesArgs) -> Result<()> {
    let devices = device::list_devices()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No removable devices found");
        return Ok(());
    }

    for dev in devices {
        println!(
            "{}  {}  {:.1} GB",
            dev.path,
            dev.name,
            dev.size as f64 / 1e9
        );
    }
    Ok(())
}

pub async fn generate_keys(args: GenerateKeysArgs) -> Result<()> {
    let pair = keys::generate_keypair()?;

    if let Some(path) = &args.output {
        tokio::fs::write(path, &pair.private_key).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::write(pub_path(path), &pair.public_key).await?;
        info!("Keypair written to {}", path.display());
    } else {
        println!("{}", pair.public_key);
        println!("{}", pair.private_key);
    }

    if let Some(passphrase) = &args.encrypt {
        let blob = keys::encrypt_private_key(&pair.private_key, passphrase)?;
        println!("{}", blob);
    }
    Ok(())
}

pub async fn flash(args: FlashArgs, cache_dir: PathBuf) -> Result<()> {
    let config = ProvisioningConfig::load(&args.config).await?;

    let target = device::list_devices()?
        .into_iter()
        .find(|d| d.path == args.device)
        .ok_or_else(|| {
            ProvisionError::Validation(format!(
                "'{}' is not a currently attached removable device",
                args.device
            ))
        })?;

    let session = ProvisionSession::new(cache_dir);
    let (tx, rx) = progress::channel();
    let renderer = spawn_renderer(rx);

    let outcome = session.run_flash(target, config, args.image_url, tx).await?;
    let _ = renderer.await;

    finish("flash", outcome)
}

pub async fn discover(args: DiscoverArgs) -> Result<()> {
    let options = DiscoveryOptions {
        attempt_timeout: Duration::from_secs(5),
        interval: Duration::from_secs(args.interval),
        max_attempts: args.attempts,
        boot_grace: args.fresh.then(|| Duration::from_secs(90)),
    };

    let stop = Arc::new(AtomicBool::new(false));
    match discovery::discover(&args.hostname, &options, stop).await? {
        Some(target) => {
            println!("{} {}", target.hostname, target.ip);
            Ok(())
        }
        None => Err(ProvisionError::DiscoveryTimeout(format!(
            "{} not found after {} attempts",
            args.hostname, args.attempts
        ))),
    }
}

pub async fn test_connection(args: TestConnectionArgs) -> Result<()> {
    let credentials = load_credentials(&args.auth).await?;

    if remote::test_connection(args.host, &args.username, &credentials).await? {
        println!("Connection to {}@{} OK", args.username, args.host);
        Ok(())
    } else {
        Err(ProvisionError::ConnectionLost(format!(
            "{} is not reachable over SSH",
            args.host
        )))
    }
}

pub async fn install(args: InstallArgs, cache_dir: PathBuf) -> Result<()> {
    let credentials = load_credentials(&args.auth).await?;
    let services = ServiceConfig::load(&args.services).await?;

    let target = match TargetOverride::parse(&args.target)? {
        ip @ TargetOverride::Ip(_) => ip.into_target(Duration::from_secs(1)).await?,
        TargetOverride::Hostname(name) => {
            let options = if args.fresh {
                DiscoveryOptions::fresh_flash()
            } else {
                DiscoveryOptions::already_running()
            };
            let stop = Arc::new(AtomicBool::new(false));
            discovery::discover(&name, &options, stop).await?
        }
    }
    .ok_or_else(|| {
        ProvisionError::DiscoveryTimeout(format!("{} was not found on the network", args.target))
    })?;

    info!("Installing to {} at {}", target.hostname, target.ip);

    let session = ProvisionSession::new(cache_dir);
    let (tx, rx) = progress::channel();
    let renderer = spawn_renderer(rx);

    let outcome = session
        .run_install(
            target.clone(),
            &args.username,
            Some(credentials.clone()),
            services,
            tx,
        )
        .await?;
    let _ = renderer.await;

    if let (Some(store_url), Some(result)) = (&args.store_url, &outcome) {
        record_installation(&args, store_url, &target, &credentials, result).await?;
    }

    finish("install", outcome)
}

/// Record the run in the installation registry. Key material is only ever
/// stored encrypted, and only when a passphrase was supplied.
async fn record_installation(
    args: &InstallArgs,
    store_url: &str,
    target: &discovery::ResolvedTarget,
    credentials: &Credentials,
    outcome: &InstallationOutcome,
) -> Result<()> {
    let api_key = args.store_key.as_deref().ok_or_else(|| {
        ProvisionError::Validation("--store-key is required with --store-url".to_string())
    })?;
    let store = InstallationStore::new(store_url, api_key)?;

    let (public_key, encrypted_private_key) = match (credentials, &args.store_passphrase) {
        (Credentials::Key(pair), Some(passphrase)) => (
            pair.public_key.clone(),
            keys::encrypt_private_key(&pair.private_key, passphrase)?,
        ),
        _ => (String::new(), String::new()),
    };

    let id = store
        .save_installation(
            &target.hostname,
            &target.ip.to_string(),
            &public_key,
            &encrypted_private_key,
            crate::VERSION,
        )
        .await?;

    for record in &outcome.stage_log {
        let note = if record.success { "completed" } else { "failed" };
        store.add_log(&id, &record.stage, note).await?;
    }

    let status = if outcome.success { "completed" } else { "failed" };
    store.update_status(&id, status).await?;
    info!("Installation recorded as {} ({})", id, status);
    Ok(())
}

/// Render the run's progress events as a single bar. Returns when the
/// sending half is dropped.
fn spawn_renderer(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
                .expect("static template"),
        );

        while let Some(event) = rx.recv().await {
            bar.set_position(event.percent as u64);
            let mut msg = format!("[{}] {}", event.stage.as_str(), event.message);
            if let Some(rate) = &event.throughput {
                msg.push_str(&format!(" ({})", rate));
            }
            bar.set_message(msg);
        }
        bar.finish_and_clear();
    })
}

/// Map a terminal outcome to process success or failure.
fn finish(kind: &str, outcome: Option<InstallationOutcome>) -> Result<()> {
    let outcome = match outcome {
        Some(outcome) => outcome,
        None => {
            // Another run already owns this target; its outcome stands.
            println!("A {} run is already in progress", kind);
            return Ok(());
        }
    };

    if outcome.success {
        println!("{} completed successfully", kind);
        for (name, secret) in &outcome.credentials {
            println!("  {} = {}", name, secret);
        }
        return Ok(());
    }

    Err(ProvisionError::StageFailed {
        stage: outcome.failed_stage.unwrap_or_else(|| "unknown".to_string()),
        message: outcome.message.unwrap_or_default(),
    })
}

async fn load_credentials(auth: &AuthArgs) -> Result<Credentials> {
    if let Some(path) = &auth.key {
        let private_key = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProvisionError::key(format!("cannot read {}: {}", path.display(), e))
        })?;
        let public_key = tokio::fs::read_to_string(pub_path(path))
            .await
            .unwrap_or_default();
        return Ok(Credentials::Key(KeyPair {
            public_key: public_key.trim().to_string(),
            private_key,
        }));
    }

    match &auth.password {
        Some(password) => Ok(Credentials::Password(password.clone())),
        None => Err(ProvisionError::Validation(
            "either a key file or a password is required".to_string(),
        )),
    }
}

fn pub_path(private: &std::path::Path) -> PathBuf {
    let mut name = private.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_credentials_prefers_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        tokio::fs::write(&key_path, "PRIVATE").await.unwrap();
        tokio::fs::write(dir.path().join("id_ed25519.pub"), "ssh-ed25519 AAA\n")
            .await
            .unwrap();

        let auth = AuthArgs {
            key: Some(key_path),
            password: None,
        };
        match load_credentials(&auth).await.unwrap() {
            Credentials::Key(pair) => {
                assert_eq!(pair.private_key, "PRIVATE");
                assert_eq!(pair.public_key, "ssh-ed25519 AAA");
            }
            Credentials::Password(_) => panic!("expected key credentials"),
        }
    }

    #[tokio::test]
    async fn test_load_credentials_password_mode() {
        let auth = AuthArgs {
            key: None,
            password: Some("pw".to_string()),
        };
        assert!(matches!(
            load_credentials(&auth).await.unwrap(),
            Credentials::Password(_)
        ));
    }

    #[test]
    fn test_pub_path_appends_suffix() {
        assert_eq!(
            pub_path(std::path::Path::new("/tmp/id_ed25519")),
            PathBuf::from("/tmp/id_ed25519.pub")
        );
    }

    #[test]
    fn test_finish_maps_failure_to_error() {
        let outcome = InstallationOutcome::failure("write", "device vanished", Vec::new());
        let err = finish("flash", Some(outcome)).unwrap_err();
        assert!(matches!(err, ProvisionError::StageFailed { .. }));
    }

    #[test]
    fn test_finish_treats_duplicate_start_as_quiet_success() {
        assert!(finish("flash", None).is_ok());
    }
}
