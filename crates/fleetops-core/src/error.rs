//! Error types and error handling for fleetops

use thiserror::Error;

/// Result type alias using FleetError
pub type Result<T> = std::result::Result<T, FleetError>;

/// Custom error types for fleet operations
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Command execution error: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FleetError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        FleetError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Transport-level failures a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::Network(_) | FleetError::Timeout(_) | FleetError::NotConnected(_)
        )
    }
}

impl From<ssh2::Error> for FleetError {
    fn from(e: ssh2::Error) -> Self {
        match e.code() {
            // LIBSSH2_ERROR_TIMEOUT
            ssh2::ErrorCode::Session(-9) => FleetError::Timeout(e.to_string()),
            _ => FleetError::Network(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = FleetError::not_found("server", "web1");
        assert_eq!(err.to_string(), "server not found: web1");
    }

    #[test]
    fn test_transient_classification() {
        assert!(FleetError::Network("reset".into()).is_transient());
        assert!(FleetError::Timeout("connect".into()).is_transient());
        assert!(!FleetError::Validation("bad".into()).is_transient());
        assert!(!FleetError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_transient());
    }
}
