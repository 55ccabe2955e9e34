// file: src/remote/mod.rs
// version: 1.2.0
// guid: 18293a4b-5c6d-7e8f-9012-34567890abcd

//! SSH transport and the staged remote installer.

pub mod installer;
pub mod session;

pub use installer::RemoteInstaller;
pub use session::{CommandOutput, SshSession};

use crate::config::Credentials;
use crate::{ProvisionError, Result};
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

/// Probe a target without starting an install.
///
/// `Ok(true)` means we connected, authenticated and ran a command. A target
/// that is simply unreachable yields `Ok(false)`; rejected credentials are a
/// hard error so the caller never retries them blindly.
pub async fn test_connection(
    host: IpAddr,
    username: &str,
    credentials: &Credentials,
) -> Result<bool> {
    match SshSession::connect(host, 22, username, credentials, Duration::from_secs(10)) {
        Ok(session) => {
            session.run_checked("connect", "true")?;
            info!("Connection test to {} succeeded", host);
            Ok(true)
        }
        Err(e @ ProvisionError::AuthenticationFailure(_)) => Err(e),
        Err(e) if e.is_transient_disconnect() => {
            info!("Connection test to {} failed: {}", host, e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
