// file: src/config/mod.rs
// version: 1.2.0
// guid: f6071829-3a4b-5c6d-7e8f-901234567890

//! Shared data model: provisioning configuration, authentication
//! credentials, unattended boot configuration, and the opaque service
//! payload handed to the remote installer.

use crate::keys::KeyPair;
use crate::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything the target needs to configure itself on first boot.
/// Immutable once a run starts; supplied by the external UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningConfig {
    pub hostname: String,
    pub system_username: String,
    pub system_password: String,
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub wifi_country: String,
    pub timezone: String,
    pub keymap: String,
}

impl ProvisioningConfig {
    /// Load from a TOML or JSON file, by extension.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => toml::from_str(&raw)
                .map_err(|e| ProvisionError::Config(format!("{}: {}", path.display(), e)))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty()
            || !self
                .hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ProvisionError::Validation(format!(
                "invalid hostname '{}'",
                self.hostname
            )));
        }
        if self.system_username.is_empty() {
            return Err(ProvisionError::Validation(
                "system account name is required".to_string(),
            ));
        }
        if self.wifi_country.len() != 2 {
            return Err(ProvisionError::Validation(format!(
                "WiFi country must be a 2-letter code, got '{}'",
                self.wifi_country
            )));
        }
        Ok(())
    }
}

/// Authentication material for the remote session. Dispatched exactly once
/// at connect time; the two modes never fall back into each other.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Keypair generated for this run and injected during flashing.
    Key(KeyPair),
    /// Account password for a target provisioned out-of-band.
    Password(String),
}

/// Unattended first-boot configuration, rendered to the image's boot
/// partition as `custom.toml` (Raspberry Pi OS Bookworm convention).
#[derive(Debug, Serialize)]
pub struct BootConfig {
    config_version: u32,
    system: BootSystem,
    user: BootUser,
    ssh: BootSsh,
    wlan: BootWlan,
    locale: BootLocale,
}

#[derive(Debug, Serialize)]
struct BootSystem {
    hostname: String,
}

#[derive(Debug, Serialize)]
struct BootUser {
    name: String,
    password: String,
    password_encrypted: bool,
}

#[derive(Debug, Serialize)]
struct BootSsh {
    enabled: bool,
    password_authentication: bool,
    authorized_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BootWlan {
    ssid: String,
    password: String,
    password_encrypted: bool,
    hidden: bool,
    country: String,
}

#[derive(Debug, Serialize)]
struct BootLocale {
    keymap: String,
    timezone: String,
}

impl BootConfig {
    pub fn new(config: &ProvisioningConfig, public_key: &str) -> Self {
        Self {
            config_version: 1,
            system: BootSystem {
                hostname: config.hostname.clone(),
            },
            user: BootUser {
                name: config.system_username.clone(),
                password: config.system_password.clone(),
                password_encrypted: false,
            },
            ssh: BootSsh {
                enabled: true,
                password_authentication: true,
                authorized_keys: vec![public_key.to_string()],
            },
            wlan: BootWlan {
                ssid: config.wifi_ssid.clone(),
                password: config.wifi_password.clone(),
                password_encrypted: false,
                hidden: false,
                country: config.wifi_country.clone(),
            },
            locale: BootLocale {
                keymap: config.keymap.clone(),
                timezone: config.timezone.clone(),
            },
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ProvisionError::Config(format!("boot config rendering failed: {}", e)))
    }

    /// `userconf.txt` fallback read by older image releases.
    pub fn to_userconf(&self) -> String {
        format!("{}:{}", self.user.name, self.user.password)
    }
}

/// Opaque service payload for the remote installer. The orchestrator uploads
/// and invokes this content without interpreting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base directory under the remote user's home, e.g. "media-stack".
    pub remote_dir: String,
    /// Subdirectories created during filesystem-structure-setup.
    #[serde(default)]
    pub directories: Vec<String>,
    /// Compose definition text, uploaded verbatim.
    pub compose: String,
    pub readiness: ReadinessProbe,
    #[serde(default)]
    pub setup_steps: Vec<ServiceSetupStep>,
}

impl ServiceConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&raw)?),
            _ => toml::from_str(&raw)
                .map_err(|e| ProvisionError::Config(format!("{}: {}", path.display(), e))),
        }
    }
}

/// Poll target for service-readiness-wait: the core service must answer,
/// not merely have its container started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessProbe {
    /// URL probed from the target itself, e.g. "http://localhost:8096/health".
    pub url: String,
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_readiness_interval")]
    pub interval_secs: u64,
}

fn default_readiness_timeout() -> u64 {
    180
}

fn default_readiness_interval() -> u64 {
    5
}

/// One externally defined configuration call against a running service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSetupStep {
    pub name: String,
    /// Shell command executed on the target.
    pub command: String,
    /// When set, the trimmed stdout of the command is captured as a
    /// service-issued credential under this key.
    #[serde(default)]
    pub credential_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ProvisioningConfig {
        ProvisioningConfig {
            hostname: "jellypi".to_string(),
            system_username: "pi".to_string(),
            system_password: "raspberry".to_string(),
            wifi_ssid: "HomeNet".to_string(),
            wifi_password: "wpa-pass".to_string(),
            wifi_country: "FR".to_string(),
            timezone: "Europe/Paris".to_string(),
            keymap: "fr".to_string(),
        }
    }

    #[test]
    fn test_boot_config_renders_all_sections() {
        let toml_text = BootConfig::new(&sample_config(), "ssh-ed25519 AAAA test")
            .to_toml()
            .unwrap();

        assert!(toml_text.contains("config_version = 1"));
        assert!(toml_text.contains("hostname = \"jellypi\""));
        assert!(toml_text.contains("ssh-ed25519 AAAA test"));
        assert!(toml_text.contains("country = \"FR\""));
        assert!(toml_text.contains("timezone = \"Europe/Paris\""));
    }

    #[test]
    fn test_userconf_fallback_format() {
        let boot = BootConfig::new(&sample_config(), "k");
        assert_eq!(boot.to_userconf(), "pi:raspberry");
    }

    #[test]
    fn test_validate_rejects_bad_hostname() {
        let mut config = sample_config();
        config.hostname = "bad host!".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_country_code() {
        let mut config = sample_config();
        config.wifi_country = "FRA".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_config_from_toml() {
        let raw = r#"
remote_dir = "media-stack"
directories = ["jellyfin", "radarr"]
compose = "services: {}"

[readiness]
url = "http://localhost:8096/health"

[[setup_steps]]
name = "issue token"
command = "curl -s http://localhost:8096/token"
credential_key = "jellyfin_token"
"#;
        let config: ServiceConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.remote_dir, "media-stack");
        assert_eq!(config.readiness.timeout_secs, 180);
        assert_eq!(
            config.setup_steps[0].credential_key.as_deref(),
            Some("jellyfin_token")
        );
    }
}
