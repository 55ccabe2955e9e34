// file: tests/integration_test.rs
// version: 1.1.0
// guid: ab123456-7890-cdef-0123-456789abcdef

//! Integration tests for the provisioning agent

use pi_provision_agent::{
    config::{BootConfig, ProvisioningConfig, ServiceConfig},
    progress::{self, FlashStage, InstallStage, StageId},
    session::ProvisionSession,
    Result,
};
use tempfile::TempDir;

#[tokio::test]
async fn test_provisioning_config_loading_integration() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();

    let config_content = r#"
hostname = "jellypi"
systemUsername = "pi"
systemPassword = "raspberry"
wifiSsid = "HomeNet"
wifiPassword = "wpa-pass"
wifiCountry = "FR"
timezone = "Europe/Paris"
keymap = "fr"
"#;

    let config_path = temp_dir.path().join("provision.toml");
    tokio::fs::write(&config_path, config_content).await?;

    let config = ProvisioningConfig::load(&config_path).await?;
    assert_eq!(config.hostname, "jellypi");
    assert_eq!(config.wifi_country, "FR");

    Ok(())
}

#[tokio::test]
async fn test_boot_config_renders_from_loaded_config() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("provision.json");
    tokio::fs::write(
        &config_path,
        r#"{
            "hostname": "jellypi",
            "systemUsername": "pi",
            "systemPassword": "raspberry",
            "wifiSsid": "HomeNet",
            "wifiPassword": "wpa-pass",
            "wifiCountry": "FR",
            "timezone": "Europe/Paris",
            "keymap": "fr"
        }"#,
    )
    .await?;

    let config = ProvisioningConfig::load(&config_path).await?;

    let session = ProvisionSession::new(temp_dir.path().to_path_buf());
    let keypair = session.keypair()?;

    let boot = BootConfig::new(&config, &keypair.public_key);
    let rendered = boot.to_toml()?;
    assert!(rendered.contains("jellypi"));
    assert!(rendered.contains(&keypair.public_key));
    assert_eq!(boot.to_userconf(), "pi:raspberry");

    Ok(())
}

#[tokio::test]
async fn test_service_payload_loading_integration() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();

    let payload = r#"
remote_dir = "media-stack"
directories = ["jellyfin/config", "jellyfin/media"]
compose = """
services:
  jellyfin:
    image: jellyfin/jellyfin
"""

[readiness]
url = "http://localhost:8096/health"
timeout_secs = 120

[[setup_steps]]
name = "issue api token"
command = "curl -s http://localhost:8096/token"
credential_key = "jellyfin_token"
"#;

    let path = temp_dir.path().join("services.toml");
    tokio::fs::write(&path, payload).await?;

    let services = ServiceConfig::load(&path).await?;
    assert_eq!(services.remote_dir, "media-stack");
    assert_eq!(services.directories.len(), 2);
    assert_eq!(services.readiness.timeout_secs, 120);
    assert_eq!(services.readiness.interval_secs, 5);
    assert_eq!(
        services.setup_steps[0].credential_key.as_deref(),
        Some("jellyfin_token")
    );

    Ok(())
}

#[tokio::test]
async fn test_progress_stream_is_ordered_and_monotonic() {
    let (tx, mut rx) = progress::channel();

    // Emissions as a run would produce them, including one regression that
    // must be clamped.
    tx.emit(StageId::Flash(FlashStage::Download), 10, "downloading");
    tx.emit(StageId::Flash(FlashStage::Download), 25, "downloaded");
    tx.emit(StageId::Flash(FlashStage::Verify), 20, "verifying");
    tx.emit(StageId::Flash(FlashStage::Write), 60, "writing");
    drop(tx);

    let mut last = 0;
    let mut count = 0;
    while let Some(event) = rx.recv().await {
        assert!(event.percent >= last, "percent went backwards");
        last = event.percent;
        count += 1;
    }
    assert_eq!(count, 4);
    assert_eq!(last, 60);
}

#[test]
fn test_install_stage_order_matches_the_documented_flow() {
    let names: Vec<&str> = InstallStage::ALL.iter().map(|s| s.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "connect",
            "system-update",
            "container-runtime-install",
            "reboot",
            "filesystem-structure-setup",
            "service-definition-deploy",
            "service-start",
            "service-readiness-wait",
            "per-service-configuration",
            "finalize",
        ]
    );
}

#[tokio::test]
async fn test_session_keypair_survives_for_flash_and_install() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let session = ProvisionSession::new(temp_dir.path().to_path_buf());

    let first = session.keypair()?;
    let second = session.keypair()?;
    assert_eq!(first.public_key, second.public_key);
    assert!(first.public_key.starts_with("ssh-ed25519 "));

    Ok(())
}
