// file: src/error.rs
// version: 1.1.0
// guid: 7d3e1b5a-2c4f-4a8d-b6e9-0f1a2b3c4d5e

use thiserror::Error;

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Error types for the provisioning agent
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Device busy or unmount failed: {0}")]
    DeviceBusy(String),

    #[error("Write failure: {0}")]
    WriteIo(String),

    #[error("Discovery timed out: {0}")]
    DiscoveryTimeout(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Remote stage '{stage}' failed (exit code {exit_code:?}): {stderr}")]
    RemoteStageFailure {
        stage: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Key material error: {0}")]
    Key(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ProvisionError {
    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new SSH error
    pub fn ssh(msg: impl Into<String>) -> Self {
        Self::Ssh(msg.into())
    }

    /// Create a new key material error
    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True when the error is expected to clear on its own during a reboot
    /// window (transient transport loss rather than a hard failure).
    pub fn is_transient_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Ssh(_) | Self::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_stage_failure_display() {
        let err = ProvisionError::RemoteStageFailure {
            stage: "system-update".to_string(),
            exit_code: Some(100),
            stderr: "apt lock held".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("system-update"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProvisionError::ConnectionLost("reboot".into()).is_transient_disconnect());
        assert!(!ProvisionError::AuthenticationFailure("bad key".into())
            .is_transient_disconnect());
    }
}
