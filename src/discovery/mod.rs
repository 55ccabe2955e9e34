// file: src/discovery/mod.rs
// version: 1.3.1
// guid: 07182930-4a5b-6c7d-8e9f-a0b1c2d3e4f5

//! Local-network discovery of a freshly provisioned target.
//!
//! Resolution is single-shot per call; the retry/backoff loop lives at the
//! caller level in [`discover`]. A target that has not booted yet is normal
//! during the first minute or two after flashing, so early misses are logged
//! at debug and never surface as errors.

use crate::{ProvisionError, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

const SSH_SERVICE_TYPE: &str = "_ssh._tcp.local.";

/// Point-in-time snapshot of a resolved target. The address is not assumed
/// stable across a remote reboot; hostname-based callers re-resolve after
/// reconnect-worthy events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub hostname: String,
    pub ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Parameters for the caller-level discovery loop.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Per-attempt resolution timeout.
    pub attempt_timeout: Duration,
    /// Fixed wait between attempts.
    pub interval: Duration,
    /// Attempt ceiling before surfacing "not found".
    pub max_attempts: u32,
    /// Wait before the first attempt. Freshly flashed targets need boot time;
    /// already-running targets do not.
    pub boot_grace: Option<Duration>,
}

impl DiscoveryOptions {
    /// Target was just flashed and has never booted.
    pub fn fresh_flash() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(8),
            max_attempts: 60,
            boot_grace: Some(Duration::from_secs(90)),
        }
    }

    /// Target is expected to already be up (connect-to-existing flow).
    pub fn already_running() -> Self {
        Self {
            boot_grace: None,
            ..Self::fresh_flash()
        }
    }
}

/// Resolve `<hostname>.local` once, bounded by `timeout`.
///
/// Tries standard local resolution first, then an mDNS browse of the SSH
/// service type for the remaining budget. `Ok(None)` means "not there yet".
pub async fn resolve(hostname: &str, timeout: Duration) -> Result<Option<ResolvedTarget>> {
    let started = Instant::now();
    let fqdn = format!("{}.local", hostname);

    // Standard resolver path; covers hosts already in the mDNS cache.
    if let Ok(Ok(addrs)) =
        tokio::time::timeout(timeout, lookup_host(format!("{}:22", fqdn))).await
    {
        for addr in addrs {
            if addr.ip().is_ipv4() {
                debug!("Resolved {} to {} via system resolver", fqdn, addr.ip());
                return Ok(Some(ResolvedTarget {
                    hostname: hostname.to_string(),
                    ip: addr.ip(),
                    mac_address: None,
                }));
            }
        }
    }

    let remaining = timeout.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        return Ok(None);
    }

    browse_mdns(hostname.to_string(), remaining).await
}

/// Browse mDNS SSH announcements until the hostname shows up or the budget
/// runs out. The mdns-sd receiver is blocking, so the browse runs on the
/// blocking pool.
async fn browse_mdns(hostname: String, budget: Duration) -> Result<Option<ResolvedTarget>> {
    let handle = tokio::task::spawn_blocking(move || -> Option<ResolvedTarget> {
        let daemon = match ServiceDaemon::new() {
            Ok(d) => d,
            Err(e) => {
                warn!("mDNS daemon unavailable: {}", e);
                return None;
            }
        };

        let receiver = match daemon.browse(SSH_SERVICE_TYPE) {
            Ok(r) => r,
            Err(e) => {
                warn!("mDNS browse failed: {}", e);
                return None;
            }
        };

        let deadline = Instant::now() + budget;
        let mut found = None;

        while Instant::now() < deadline {
            let step = deadline
                .saturating_duration_since(Instant::now())
                .min(Duration::from_secs(1));
            match receiver.recv_timeout(step) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    if !info.get_hostname().starts_with(&hostname) {
                        continue;
                    }
                    if let Some(ip) = info.get_addresses().iter().find(|a| a.is_ipv4()) {
                        found = Some(ResolvedTarget {
                            hostname: hostname.clone(),
                            ip: *ip,
                            mac_address: None,
                        });
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => {}
            }
        }

        let _ = daemon.shutdown();
        found
    });

    handle
        .await
        .map_err(|e| ProvisionError::Network(format!("mDNS browse task failed: {}", e)))
}

/// Caller-level discovery loop: repeated single-shot attempts at a fixed
/// interval up to the attempt ceiling. Stoppable through `stop`, e.g. when
/// the user switches to a manual override.
pub async fn discover(
    hostname: &str,
    options: &DiscoveryOptions,
    stop: Arc<AtomicBool>,
) -> Result<Option<ResolvedTarget>> {
    if let Some(grace) = options.boot_grace {
        info!(
            "Waiting {}s for {} to boot before searching",
            grace.as_secs(),
            hostname
        );
        if !sleep_unless_stopped(grace, &stop).await {
            info!("Discovery for {} stopped by caller", hostname);
            return Ok(None);
        }
    }

    for attempt in 1..=options.max_attempts {
        if stop.load(Ordering::Relaxed) {
            info!("Discovery for {} stopped by caller", hostname);
            return Ok(None);
        }

        match resolve(hostname, options.attempt_timeout).await? {
            Some(target) => {
                info!(
                    "Found {} at {} (attempt {}/{})",
                    hostname, target.ip, attempt, options.max_attempts
                );
                return Ok(Some(target));
            }
            None => {
                // Expected while the target is still booting.
                debug!(
                    "{} not visible yet (attempt {}/{})",
                    hostname, attempt, options.max_attempts
                );
            }
        }

        if attempt < options.max_attempts
            && !sleep_unless_stopped(options.interval, &stop).await
        {
            info!("Discovery for {} stopped by caller", hostname);
            return Ok(None);
        }
    }

    Ok(None)
}

/// Sleep in short slices so a raised stop flag cuts the wait short.
/// Returns false when stopped.
async fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        tokio::time::sleep(remaining.min(Duration::from_millis(250))).await;
    }
}

/// Manual override supplied by the user after discovery gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOverride {
    /// Trusted verbatim; bypasses resolution entirely.
    Ip(IpAddr),
    /// Re-enters the resolution path.
    Hostname(String),
}

impl TargetOverride {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ProvisionError::Validation(
                "empty target override".to_string(),
            ));
        }
        match input.parse::<IpAddr>() {
            Ok(ip) => Ok(TargetOverride::Ip(ip)),
            Err(_) => Ok(TargetOverride::Hostname(input.to_string())),
        }
    }

    /// Turn the override into a connection target. IP overrides resolve to
    /// themselves; hostname overrides go through [`resolve`].
    pub async fn into_target(self, timeout: Duration) -> Result<Option<ResolvedTarget>> {
        match self {
            TargetOverride::Ip(ip) => Ok(Some(ResolvedTarget {
                hostname: ip.to_string(),
                ip,
                mac_address: None,
            })),
            TargetOverride::Hostname(name) => resolve(&name, timeout).await,
        }
    }
}
