//! Error types for the SSH gateway

use thiserror::Error;

/// Main error type for the SSH gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Outbound SSH connection failed (includes unresolved hosts)
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// The remote node rejected the gateway's credentials
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Connecting or opening a channel exceeded the configured timeout
    #[error("Connection timeout after {0}ms")]
    Timeout(u64),

    /// Invalid command arguments provided
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Directory service failure (connect, bind or search)
    #[error("Directory error: {0}")]
    Directory(String),

    /// The audit pipeline refused or could not accept work
    #[error("Audit unavailable: {0}")]
    AuditUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// SSH key loading or generation error
    #[error("SSH key error: {0}")]
    SshKey(String),
}

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Create a connection error from a string
    pub fn connection(msg: impl Into<String>) -> Self {
        GatewayError::Connection(msg.into())
    }

    /// Create an unauthorized error from a string
    pub fn auth(msg: impl Into<String>) -> Self {
        GatewayError::Unauthorized(msg.into())
    }

    /// Create an invalid params error from a string
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        GatewayError::InvalidParams(msg.into())
    }

    /// Create a directory error from a string
    pub fn directory(msg: impl Into<String>) -> Self {
        GatewayError::Directory(msg.into())
    }

    /// Create an audit-unavailable error from a string
    pub fn audit_unavailable(msg: impl Into<String>) -> Self {
        GatewayError::AuditUnavailable(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::Connection("failed to connect".to_string());
        assert_eq!(err.to_string(), "SSH connection error: failed to connect");

        let err = GatewayError::Timeout(5000);
        assert_eq!(err.to_string(), "Connection timeout after 5000ms");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: GatewayError = io.into();
        assert!(matches!(err, GatewayError::Io(_)));
        assert!(err.to_string().contains("pipe closed"));
    }
}
