// file: src/remote/session.rs
// version: 1.3.0
// guid: 293a4b5c-6d7e-8f90-1234-567890abcdef

//! Thin wrapper around an authenticated ssh2 session.
//!
//! Authentication is dispatched exactly once per session from the supplied
//! [`Credentials`] variant. Key auth never falls back to password auth and
//! vice versa; a rejected credential is a hard failure.

use crate::config::Credentials;
use crate::{ProvisionError, Result};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, trace};

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One authenticated SSH session to a target.
pub struct SshSession {
    session: Session,
    host: IpAddr,
    username: String,
}

impl SshSession {
    /// Open a TCP connection, handshake, and authenticate.
    pub fn connect(
        host: IpAddr,
        port: u16,
        username: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self> {
        let addr = SocketAddr::new(host, port);
        debug!("Connecting to {}", addr);

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| ProvisionError::ConnectionLost(format!("{}: {}", addr, e)))?;
        stream.set_read_timeout(Some(Duration::from_secs(120)))?;
        stream.set_write_timeout(Some(Duration::from_secs(120)))?;

        let mut session = Session::new()
            .map_err(|e| ProvisionError::ssh(format!("session init failed: {}", e)))?;
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|e| ProvisionError::ssh(format!("handshake with {} failed: {}", addr, e)))?;

        match credentials {
            Credentials::Key(pair) => {
                session
                    .userauth_pubkey_memory(username, None, &pair.private_key, None)
                    .map_err(|e| {
                        ProvisionError::AuthenticationFailure(format!(
                            "key auth rejected for {}@{}: {}",
                            username, host, e
                        ))
                    })?;
            }
            Credentials::Password(password) => {
                session.userauth_password(username, password).map_err(|e| {
                    ProvisionError::AuthenticationFailure(format!(
                        "password auth rejected for {}@{}: {}",
                        username, host, e
                    ))
                })?;
            }
        }

        if !session.authenticated() {
            return Err(ProvisionError::AuthenticationFailure(format!(
                "{}@{} not authenticated after auth exchange",
                username, host
            )));
        }

        debug!("Authenticated as {}@{}", username, host);
        Ok(Self {
            session,
            host,
            username: username.to_string(),
        })
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn username(&self) -> &str {
        self.username.as_str()
    }

    /// Run a command and capture its output. Non-zero exit is not an error
    /// at this level; callers decide what a failure means.
    pub fn execute(&self, command: &str) -> Result<CommandOutput> {
        trace!("remote$ {}", command);

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| ProvisionError::ConnectionLost(format!("channel open failed: {}", e)))?;

        channel
            .exec(command)
            .map_err(|e| ProvisionError::ConnectionLost(format!("exec failed: {}", e)))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| ProvisionError::ConnectionLost(format!("read failed: {}", e)))?;

        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| ProvisionError::ConnectionLost(format!("stderr read failed: {}", e)))?;

        channel
            .wait_close()
            .map_err(|e| ProvisionError::ConnectionLost(format!("channel close failed: {}", e)))?;
        let exit_code = channel
            .exit_status()
            .map_err(|e| ProvisionError::ssh(format!("exit status unavailable: {}", e)))?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Run a command that must succeed; non-zero exit maps to a stage
    /// failure carrying the remote stderr.
    pub fn run_checked(&self, stage: &str, command: &str) -> Result<String> {
        let output = self.execute(command)?;
        if !output.success() {
            return Err(ProvisionError::RemoteStageFailure {
                stage: stage.to_string(),
                exit_code: Some(output.exit_code),
                stderr: if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                },
            });
        }
        Ok(output.stdout)
    }

    /// True when the command exits zero. Transport failures still propagate.
    pub fn check_silent(&self, command: &str) -> Result<bool> {
        Ok(self.execute(command)?.success())
    }

    /// Upload in-memory content to a remote path via SCP.
    pub fn upload(&self, remote_path: &Path, contents: &[u8], mode: i32) -> Result<()> {
        debug!("Uploading {} bytes to {}", contents.len(), remote_path.display());

        let mut remote_file = self
            .session
            .scp_send(remote_path, mode, contents.len() as u64, None)
            .map_err(|e| {
                ProvisionError::ssh(format!("scp to {} failed: {}", remote_path.display(), e))
            })?;

        remote_file
            .write_all(contents)
            .map_err(|e| ProvisionError::ConnectionLost(format!("upload write failed: {}", e)))?;

        remote_file
            .send_eof()
            .and_then(|_| remote_file.wait_eof())
            .and_then(|_| remote_file.close())
            .and_then(|_| remote_file.wait_close())
            .map_err(|e| ProvisionError::ssh(format!("upload finalize failed: {}", e)))?;

        Ok(())
    }

    /// Polite disconnect. Errors are ignored; the target may already be
    /// tearing the link down (e.g. around a reboot).
    pub fn disconnect(self) {
        let _ = self.session.disconnect(None, "done", None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_to_unreachable_host_is_connection_lost() {
        // TEST-NET-1, guaranteed non-routable
        let result = SshSession::connect(
            "192.0.2.1".parse().unwrap(),
            22,
            "pi",
            &Credentials::Password("x".to_string()),
            Duration::from_millis(300),
        );
        assert!(matches!(result, Err(ProvisionError::ConnectionLost(_))));
    }

    #[test]
    fn test_command_output_success_flag() {
        let ok = CommandOutput {
            stdout: "done".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        let bad = CommandOutput {
            stdout: String::new(),
            stderr: "boom".into(),
            exit_code: 1,
        };
        assert!(ok.success());
        assert!(!bad.success());
    }
}
