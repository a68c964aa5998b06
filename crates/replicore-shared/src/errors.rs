//! # Replicore Error Types
//!
//! Unified error handling across the controller, worker and CLI crates.

use thiserror::Error;

/// Result alias used throughout the workspace
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Error kinds surfaced by the replication and ingest control plane
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    #[error("Transport failure: {0}")]
    TransportError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Timer expired waiting for the next eligible ingest request")]
    IngestTimerExpired,

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Wire message decoding failed: {0}")]
    DecodeError(#[from] prost::DecodeError),
}

impl ReplicaError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a protocol violation error
    ///
    /// Use this when a frame carries an unknown enumeration value, a
    /// mismatched instance id, or a body that does not match its type tag.
    /// Protocol violations are never retried.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError(message.into())
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError(message.into())
    }

    /// Create a worker-local error
    pub fn worker(message: impl Into<String>) -> Self {
        Self::WorkerError(message.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create an illegal-state error for broken state-machine transitions
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Check if the error is recoverable (worth retrying)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReplicaError::TransportError(_) => true,
            ReplicaError::IngestTimerExpired => true,
            // Protocol violations mean one of the peers is broken
            ReplicaError::ProtocolError(_) => false,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_recoverable() {
        assert!(ReplicaError::transport("connection reset").is_recoverable());
    }

    #[test]
    fn test_protocol_not_recoverable() {
        assert!(!ReplicaError::protocol("unknown status 42").is_recoverable());
    }

    #[test]
    fn test_config_not_recoverable() {
        assert!(!ReplicaError::config("missing section").is_recoverable());
    }

    #[test]
    fn test_display_invalid_argument() {
        let err = ReplicaError::invalid_argument("empty worker name");
        assert_eq!(format!("{err}"), "Invalid argument: empty worker name");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file gone");
        let err: ReplicaError = io_err.into();
        assert!(matches!(err, ReplicaError::IoError(_)));
    }
}
