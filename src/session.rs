// file: src/session.rs
// version: 1.2.0
// guid: 6d7e8f90-1234-5678-90ab-cdef01234567

//! Per-run session state.
//!
//! All run bookkeeping (key material, flash latch, install latch) is scoped
//! to a session instance so concurrent sessions in one process never share
//! state. Nothing here is global.

use crate::config::{Credentials, ProvisioningConfig, ServiceConfig};
use crate::discovery::ResolvedTarget;
use crate::flash::{FlashEngine, FlashRequest};
use crate::keys::{self, KeyPair};
use crate::progress::{InstallationOutcome, ProgressSender};
use crate::remote::RemoteInstaller;
use crate::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// One provisioning session: a keypair, a flash engine, and the install
/// latch, all instance-scoped.
pub struct ProvisionSession {
    pub id: Uuid,
    keypair: Mutex<Option<KeyPair>>,
    flash: FlashEngine,
    install_active: AtomicBool,
}

impl ProvisionSession {
    pub fn new(cache_dir: PathBuf) -> Self {
        let id = Uuid::new_v4();
        info!("Session {} started", id);
        Self {
            id,
            keypair: Mutex::new(None),
            flash: FlashEngine::new(cache_dir),
            install_active: AtomicBool::new(false),
        }
    }

    /// Session keypair, generated on first use and reused for the rest of
    /// the session.
    pub fn keypair(&self) -> Result<KeyPair> {
        let mut slot = self.keypair.lock().expect("keypair lock");
        if slot.is_none() {
            *slot = Some(keys::generate_keypair()?);
            debug!("Generated session keypair");
        }
        Ok(slot.as_ref().cloned().expect("keypair just set"))
    }

    /// Flash a device with the session's public key injected for first boot.
    ///
    /// Returns `None` when the same device already has a flash in flight;
    /// that run owns the device's single terminal outcome.
    pub async fn run_flash(
        &self,
        device: crate::device::StorageDevice,
        config: ProvisioningConfig,
        image_url: Option<String>,
        progress: ProgressSender,
    ) -> Result<Option<InstallationOutcome>> {
        let keypair = self.keypair()?;
        let request = FlashRequest {
            device,
            config,
            public_key: keypair.public_key,
            image_url,
        };
        self.flash.run(request, progress).await
    }

    /// Run the staged remote install against a resolved target.
    ///
    /// Returns `None` when an install is already in flight for this session.
    /// When no credentials are given the session keypair is used.
    pub async fn run_install(
        &self,
        target: ResolvedTarget,
        username: &str,
        credentials: Option<Credentials>,
        services: ServiceConfig,
        progress: ProgressSender,
    ) -> Result<Option<InstallationOutcome>> {
        let guard = match self.begin_install() {
            Some(guard) => guard,
            None => {
                debug!("Install already in progress for session {}", self.id);
                return Ok(None);
            }
        };

        let credentials = match credentials {
            Some(c) => c,
            None => Credentials::Key(self.keypair()?),
        };

        let mut installer =
            RemoteInstaller::new(target, username, credentials, services, progress);
        let outcome = installer.run().await;
        drop(guard);
        Ok(Some(outcome))
    }

    fn begin_install(&self) -> Option<InstallGuard<'_>> {
        if self.install_active.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(InstallGuard { session: self })
    }
}

/// Clears the install latch when the run ends, on any path.
struct InstallGuard<'a> {
    session: &'a ProvisionSession,
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.session.install_active.store(false, Ordering::Release);
    }
}
