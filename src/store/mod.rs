// file: src/store/mod.rs
// version: 1.1.0
// guid: 5c6d7e8f-9012-3456-7890-abcdef012345

//! REST-backed installation registry.
//!
//! Records what was provisioned where, keyed by the row id the backend
//! returns. The private key is only ever stored in its encrypted form; the
//! plaintext never leaves the run.

use crate::{ProvisionError, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct InstallationRow<'a> {
    device_name: &'a str,
    ip_address: &'a str,
    public_key: &'a str,
    encrypted_private_key: &'a str,
    agent_version: &'a str,
    status: &'a str,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CreatedRow {
    id: String,
}

#[derive(Debug, Serialize)]
struct LogRow<'a> {
    installation_id: &'a str,
    stage: &'a str,
    message: &'a str,
    logged_at: DateTime<Utc>,
}

/// Client for the installations backend.
pub struct InstallationStore {
    client: reqwest::Client,
    base_url: String,
}

impl InstallationStore {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| ProvisionError::config(format!("invalid api key: {}", e)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key)
                .map_err(|e| ProvisionError::config(format!("invalid api key: {}", e)))?,
        );
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        let client = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Register a provisioned device. Returns the backend row id used for
    /// later status updates and log lines.
    pub async fn save_installation(
        &self,
        device_name: &str,
        ip_address: &str,
        public_key: &str,
        encrypted_private_key: &str,
        agent_version: &str,
    ) -> Result<String> {
        let row = InstallationRow {
            device_name,
            ip_address,
            public_key,
            encrypted_private_key,
            agent_version,
            status: "installing",
            created_at: Utc::now(),
        };

        let created: Vec<CreatedRow> = self
            .client
            .post(format!("{}/rest/v1/installations", self.base_url))
            .json(&row)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let id = created
            .into_iter()
            .next()
            .map(|r| r.id)
            .ok_or_else(|| ProvisionError::network("backend returned no row id"))?;

        info!("Registered installation {} for {}", id, device_name);
        Ok(id)
    }

    /// Move an installation to a new lifecycle status.
    pub async fn update_status(&self, installation_id: &str, status: &str) -> Result<()> {
        self.client
            .patch(format!(
                "{}/rest/v1/installations?id=eq.{}",
                self.base_url, installation_id
            ))
            .json(&serde_json::json!({ "status": status, "updated_at": Utc::now() }))
            .send()
            .await?
            .error_for_status()?;

        debug!("Installation {} is now '{}'", installation_id, status);
        Ok(())
    }

    /// Append one stage log line to an installation.
    pub async fn add_log(&self, installation_id: &str, stage: &str, message: &str) -> Result<()> {
        let row = LogRow {
            installation_id,
            stage,
            message,
            logged_at: Utc::now(),
        };

        self.client
            .post(format!("{}/rest/v1/installation_logs", self.base_url))
            .json(&row)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let store = InstallationStore::new("https://backend.example/", "key").unwrap();
        assert_eq!(store.base_url, "https://backend.example");
    }

    #[test]
    fn test_rejects_unusable_api_key() {
        assert!(InstallationStore::new("https://backend.example", "bad\nkey").is_err());
    }

    #[test]
    fn test_installation_row_serializes_expected_fields() {
        let row = InstallationRow {
            device_name: "jellypi",
            ip_address: "192.168.1.40",
            public_key: "ssh-ed25519 AAAA",
            encrypted_private_key: "blob",
            agent_version: "0.4.2",
            status: "installing",
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["device_name"], "jellypi");
        assert_eq!(json["status"], "installing");
        assert!(json["encrypted_private_key"].is_string());
    }
}
