// file: src/remote/installer.rs
// version: 1.4.0
// guid: 3a4b5c6d-7e8f-9012-3456-7890abcdef01

//! Staged remote installation over an authenticated SSH session.
//!
//! Stages run strictly in order and the run stops at the first failure with
//! a terminal outcome naming the failed stage. A retried install always
//! begins again at the connect stage; completed remote work is expected to
//! be idempotent (`mkdir -p`, `docker compose up`, apt re-runs).

use crate::config::{Credentials, ServiceConfig};
use crate::discovery::{self, ResolvedTarget};
use crate::progress::{
    InstallStage, InstallationOutcome, ProgressSender, StageId, StageRecord,
};
use crate::remote::session::SshSession;
use crate::{ProvisionError, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// The target needs time to actually go down before reconnect attempts
/// make sense.
const REBOOT_INITIAL_WAIT: Duration = Duration::from_secs(60);
const RECONNECT_ATTEMPTS: u32 = 30;
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Drives the ordered install stages against one target.
pub struct RemoteInstaller {
    target: ResolvedTarget,
    username: String,
    credentials: Credentials,
    services: ServiceConfig,
    progress: ProgressSender,
    /// Hostname-based targets are re-resolved after a reboot since DHCP may
    /// hand out a different address. Manual IP targets are trusted verbatim.
    rediscover: bool,
}

impl RemoteInstaller {
    pub fn new(
        target: ResolvedTarget,
        username: impl Into<String>,
        credentials: Credentials,
        services: ServiceConfig,
        progress: ProgressSender,
    ) -> Self {
        let rediscover = target.hostname.parse::<IpAddr>().is_err();
        Self {
            target,
            username: username.into(),
            credentials,
            services,
            progress,
            rediscover,
        }
    }

    /// Run all stages. Stage failures are terminal and reported through the
    /// outcome, never as an `Err` to the caller.
    pub async fn run(&mut self) -> InstallationOutcome {
        let mut session: Option<SshSession> = None;
        let mut issued = BTreeMap::new();
        let mut stage_log = Vec::new();

        for stage in InstallStage::ALL {
            self.progress.emit(
                StageId::Install(stage),
                stage.percent(),
                format!("Starting {}", stage.as_str()),
            );

            let started_at = Utc::now();
            let t0 = Instant::now();
            let result = self.run_stage(stage, &mut session, &mut issued).await;

            stage_log.push(StageRecord {
                stage: stage.as_str().to_string(),
                started_at,
                duration_ms: t0.elapsed().as_millis() as i64,
                success: result.is_ok(),
            });

            if let Err(e) = result {
                error!("Stage {} failed: {}", stage.as_str(), e);
                self.progress.emit(
                    StageId::Install(stage),
                    stage.percent(),
                    format!("{} failed: {}", stage.as_str(), e),
                );
                if let Some(s) = session.take() {
                    s.disconnect();
                }
                return InstallationOutcome::failure(stage.as_str(), e.to_string(), stage_log);
            }

            info!("Stage {} completed", stage.as_str());
        }

        if let Some(s) = session.take() {
            s.disconnect();
        }

        self.progress.emit(
            StageId::Install(InstallStage::Finalize),
            100,
            "Installation complete",
        );
        InstallationOutcome::success(issued, stage_log)
    }

    async fn run_stage(
        &mut self,
        stage: InstallStage,
        session: &mut Option<SshSession>,
        issued: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        match stage {
            InstallStage::Connect => {
                let s = SshSession::connect(
                    self.target.ip,
                    22,
                    &self.username,
                    &self.credentials,
                    CONNECT_TIMEOUT,
                )?;
                session.replace(s);
                Ok(())
            }
            InstallStage::SystemUpdate => {
                let s = active(session)?;
                s.run_checked(
                    stage.as_str(),
                    "sudo DEBIAN_FRONTEND=noninteractive apt-get update -y && \
                     sudo DEBIAN_FRONTEND=noninteractive apt-get upgrade -y",
                )?;
                Ok(())
            }
            InstallStage::ContainerRuntime => {
                let s = active(session)?;
                if s.check_silent("command -v docker >/dev/null")? {
                    debug!("Container runtime already present, skipping install");
                    return Ok(());
                }
                s.run_checked(
                    stage.as_str(),
                    "curl -fsSL https://get.docker.com | sudo sh",
                )?;
                s.run_checked(
                    stage.as_str(),
                    &format!("sudo usermod -aG docker {}", self.username),
                )?;
                Ok(())
            }
            InstallStage::Reboot => self.reboot_and_reconnect(session).await,
            InstallStage::FilesystemSetup => {
                let s = active(session)?;
                let mut dirs = vec![self.services.remote_dir.clone()];
                for sub in &self.services.directories {
                    dirs.push(format!("{}/{}", self.services.remote_dir, sub));
                }
                s.run_checked(
                    stage.as_str(),
                    &format!("mkdir -p {}", shell_join(&dirs)),
                )?;
                Ok(())
            }
            InstallStage::ServiceDeploy => {
                let s = active(session)?;
                s.upload(
                    &compose_path(&self.services.remote_dir),
                    self.services.compose.as_bytes(),
                    0o644,
                )?;
                Ok(())
            }
            InstallStage::ServiceStart => {
                let s = active(session)?;
                s.run_checked(
                    stage.as_str(),
                    &format!(
                        "cd {} && docker compose pull && docker compose up -d",
                        self.services.remote_dir
                    ),
                )?;
                Ok(())
            }
            InstallStage::ServiceReadiness => self.wait_for_readiness(session).await,
            InstallStage::ServiceConfiguration => {
                self.run_setup_steps(session, issued)?;
                Ok(())
            }
            InstallStage::Finalize => {
                let s = active(session)?;
                s.run_checked(stage.as_str(), "sync")?;
                Ok(())
            }
        }
    }

    /// Issue a reboot, wait for the target to go down, then reconnect within
    /// a bounded grace window. The reboot command itself usually dies with
    /// the link, so its error is ignored.
    async fn reboot_and_reconnect(&mut self, session: &mut Option<SshSession>) -> Result<()> {
        if let Some(s) = session.take() {
            let _ = s.execute("sudo reboot");
            s.disconnect();
        }

        self.progress.emit(
            StageId::Install(InstallStage::Reboot),
            InstallStage::Reboot.percent(),
            "Target rebooting, waiting to reconnect",
        );
        tokio::time::sleep(REBOOT_INITIAL_WAIT).await;

        let label = self.target.hostname.clone();
        let s =
            reconnect_within_grace(&label, RECONNECT_ATTEMPTS, RECONNECT_INTERVAL, self).await?;
        session.replace(s);
        Ok(())
    }

    /// Poll the service's own health endpoint from the target until it
    /// answers. A started container is not enough.
    async fn wait_for_readiness(&self, session: &mut Option<SshSession>) -> Result<()> {
        let probe = &self.services.readiness;
        let deadline = Instant::now() + Duration::from_secs(probe.timeout_secs);
        let command = readiness_command(&probe.url);

        loop {
            // Session borrow must not live across the sleep below.
            let answered = {
                let s = active(session)?;
                match s.execute(&command) {
                    Ok(output) => {
                        let code = output.stdout.trim().to_string();
                        debug!("Readiness probe returned {}", code);
                        code.starts_with('2') || code.starts_with('3')
                    }
                    Err(_) => false,
                }
            };
            if answered {
                info!("Service answered readiness probe");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ProvisionError::RemoteStageFailure {
                    stage: InstallStage::ServiceReadiness.as_str().to_string(),
                    exit_code: None,
                    stderr: format!(
                        "{} did not answer within {}s",
                        probe.url, probe.timeout_secs
                    ),
                });
            }
            tokio::time::sleep(Duration::from_secs(probe.interval_secs)).await;
        }
    }

    /// Execute the payload's setup steps in order. Steps marked with a
    /// credential key have their stdout captured as a service-issued secret,
    /// surfaced once on the event stream and in the outcome.
    fn run_setup_steps(
        &self,
        session: &mut Option<SshSession>,
        issued: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let s = active(session)?;
        let stage = InstallStage::ServiceConfiguration;

        for step in &self.services.setup_steps {
            debug!("Setup step: {}", step.name);
            let stdout = s.run_checked(stage.as_str(), &step.command)?;

            if let Some(key) = &step.credential_key {
                let secret = stdout.trim().to_string();
                if secret.is_empty() {
                    return Err(ProvisionError::RemoteStageFailure {
                        stage: stage.as_str().to_string(),
                        exit_code: None,
                        stderr: format!("step '{}' produced no credential output", step.name),
                    });
                }
                self.progress.emit_full(
                    StageId::Install(stage),
                    stage.percent(),
                    format!("Credential issued for {}", key),
                    None,
                    Some(serde_json::json!({ key: secret })),
                );
                issued.insert(key.clone(), secret);
            }
        }
        Ok(())
    }
}

/// One reconnect attempt against a rebooting target. The installer's
/// implementation re-resolves hostname-based targets before each try.
pub(crate) trait Reconnect {
    type Session;

    fn attempt(&mut self, attempt: u32) -> BoxFuture<'_, Result<Self::Session>>;
}

impl Reconnect for RemoteInstaller {
    type Session = SshSession;

    fn attempt(&mut self, attempt: u32) -> BoxFuture<'_, Result<SshSession>> {
        Box::pin(async move {
            if self.rediscover {
                match discovery::resolve(&self.target.hostname, Duration::from_secs(5)).await {
                    Ok(Some(fresh)) if fresh.ip != self.target.ip => {
                        info!(
                            "{} came back at {} (was {})",
                            self.target.hostname, fresh.ip, self.target.ip
                        );
                        self.target.ip = fresh.ip;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Re-resolution attempt failed: {}", e),
                }
            }

            debug!("Reconnect attempt {}/{}", attempt, RECONNECT_ATTEMPTS);
            SshSession::connect(
                self.target.ip,
                22,
                &self.username,
                &self.credentials,
                Duration::from_secs(8),
            )
        })
    }
}

/// Retry connecting at a fixed interval up to the attempt ceiling.
///
/// Transient transport errors keep the loop alive; anything else (a rejected
/// credential, for instance) fails immediately. Exhausting the ceiling maps
/// to `ConnectionLost`.
pub(crate) async fn reconnect_within_grace<R: Reconnect>(
    target: &str,
    attempts: u32,
    interval: Duration,
    reconnect: &mut R,
) -> Result<R::Session> {
    for attempt in 1..=attempts {
        match reconnect.attempt(attempt).await {
            Ok(session) => {
                info!("Reconnected after reboot (attempt {})", attempt);
                return Ok(session);
            }
            Err(e) if e.is_transient_disconnect() => {
                debug!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(ProvisionError::ConnectionLost(format!(
        "{} did not come back within the reboot grace window",
        target
    )))
}

fn active<'a>(session: &'a Option<SshSession>) -> Result<&'a SshSession> {
    session
        .as_ref()
        .ok_or_else(|| ProvisionError::ConnectionLost("no active session".to_string()))
}

fn compose_path(remote_dir: &str) -> PathBuf {
    PathBuf::from(format!("{}/docker-compose.yml", remote_dir))
}

fn readiness_command(url: &str) -> String {
    format!(
        "curl -s -o /dev/null -w '%{{http_code}}' --max-time 5 {}",
        url
    )
}

fn shell_join(paths: &[String]) -> String {
    paths
        .iter()
        .map(|p| format!("'{}'", p.replace('\'', "'\\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadinessProbe;
    use crate::progress;

    fn sample_services() -> ServiceConfig {
        ServiceConfig {
            remote_dir: "media-stack".to_string(),
            directories: vec!["jellyfin".to_string()],
            compose: "services: {}".to_string(),
            readiness: ReadinessProbe {
                url: "http://localhost:8096/health".to_string(),
                timeout_secs: 180,
                interval_secs: 5,
            },
            setup_steps: Vec::new(),
        }
    }

    #[test]
    fn test_hostname_targets_rediscover_and_ip_targets_do_not() {
        let (tx, _rx) = progress::channel();

        let by_name = RemoteInstaller::new(
            ResolvedTarget {
                hostname: "jellypi".to_string(),
                ip: "192.168.1.40".parse().unwrap(),
                mac_address: None,
            },
            "pi",
            Credentials::Password("pw".to_string()),
            sample_services(),
            tx.clone(),
        );
        assert!(by_name.rediscover);

        let by_ip = RemoteInstaller::new(
            ResolvedTarget {
                hostname: "192.168.1.40".to_string(),
                ip: "192.168.1.40".parse().unwrap(),
                mac_address: None,
            },
            "pi",
            Credentials::Password("pw".to_string()),
            sample_services(),
            tx,
        );
        assert!(!by_ip.rediscover);
    }

    /// Target that stays down for a fixed number of attempts, then either
    /// accepts the connection or rejects the credentials outright.
    struct RebootingTarget {
        down_for: u32,
        then: fn() -> Result<u32>,
    }

    impl Reconnect for RebootingTarget {
        type Session = u32;

        fn attempt(&mut self, attempt: u32) -> BoxFuture<'_, Result<u32>> {
            Box::pin(async move {
                if attempt <= self.down_for {
                    return Err(ProvisionError::ConnectionLost("still booting".to_string()));
                }
                (self.then)()
            })
        }
    }

    #[tokio::test]
    async fn test_reconnect_succeeds_when_target_returns_mid_window() {
        let mut target = RebootingTarget {
            down_for: 3,
            then: || Ok(42),
        };
        let session =
            reconnect_within_grace("jellypi", 10, Duration::from_millis(1), &mut target)
                .await
                .unwrap();
        assert_eq!(session, 42);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_the_attempt_ceiling() {
        let mut target = RebootingTarget {
            down_for: u32::MAX,
            then: || Ok(0),
        };
        let err = reconnect_within_grace("jellypi", 5, Duration::from_millis(1), &mut target)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ConnectionLost(_)));
        assert!(err.to_string().contains("grace window"));
    }

    #[tokio::test]
    async fn test_reconnect_stops_immediately_on_rejected_credentials() {
        let mut target = RebootingTarget {
            down_for: 0,
            then: || Err(ProvisionError::AuthenticationFailure("bad key".to_string())),
        };
        let err = reconnect_within_grace("jellypi", 30, Duration::from_secs(5), &mut target)
            .await
            .unwrap_err();
        // Must fail on the first attempt, not retry through the window.
        assert!(matches!(err, ProvisionError::AuthenticationFailure(_)));
    }

    #[test]
    fn test_readiness_command_reports_http_code_only() {
        let cmd = readiness_command("http://localhost:8096/health");
        assert!(cmd.contains("%{http_code}"));
        assert!(cmd.contains("--max-time"));
    }

    #[test]
    fn test_shell_join_quotes_every_path() {
        let joined = shell_join(&["a".to_string(), "b c".to_string()]);
        assert_eq!(joined, "'a' 'b c'");
    }

    #[test]
    fn test_compose_path_lands_in_remote_dir() {
        assert_eq!(
            compose_path("media-stack"),
            PathBuf::from("media-stack/docker-compose.yml")
        );
    }
}
