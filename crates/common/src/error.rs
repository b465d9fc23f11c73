//! Common error types for WorkerBridge
//!
//! This module defines all error types used across the WorkerBridge system.
//! Every error maps to the HTTP status an API gateway should surface to its
//! client, so failures propagate without the gateway inspecting messages.

use thiserror::Error;

/// Main error type for WorkerBridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker pool is at capacity
    #[error("Maximum worker limit ({0}) reached")]
    PoolFull(usize),

    /// A live worker already uses this id
    #[error("Worker ID '{0}' is already registered")]
    DuplicateWorker(String),

    /// Worker presented an unknown token
    #[error("Invalid authentication token for worker '{0}'")]
    Unauthorized(String),

    /// Unknown worker id
    #[error("Worker '{0}' not found")]
    WorkerNotFound(String),

    /// Unknown request id
    #[error("Request '{0}' not found")]
    RequestNotFound(String),

    /// Request id is already being tracked
    #[error("Request '{0}' is already being tracked")]
    DuplicateRequest(String),

    /// No idle, healthy worker could take the request
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Tracker has been drained for shutdown
    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    /// Push into a worker or result channel failed
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Whether this error rejected a worker registration
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            BridgeError::PoolFull(_) | BridgeError::DuplicateWorker(_) | BridgeError::Unauthorized(_)
        )
    }

    /// HTTP status code the API gateway should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            BridgeError::PoolFull(_) | BridgeError::WorkerUnavailable(_) => 503,
            BridgeError::ShuttingDown(_) => 503,
            BridgeError::Unauthorized(_) => 401,
            BridgeError::DuplicateWorker(_) | BridgeError::DuplicateRequest(_) => 409,
            BridgeError::WorkerNotFound(_) | BridgeError::RequestNotFound(_) => 404,
            BridgeError::Timeout(_) => 504,
            BridgeError::Delivery(_) => 502,
            BridgeError::Config(_)
            | BridgeError::Serialization(_)
            | BridgeError::Io(_)
            | BridgeError::Internal(_) => 500,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Config(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        BridgeError::WorkerUnavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        BridgeError::Timeout(msg.into())
    }

    /// Create a delivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        BridgeError::Delivery(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        BridgeError::Internal(msg.into())
    }
}

/// Result type alias for WorkerBridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_errors() {
        assert!(BridgeError::PoolFull(10).is_admission());
        assert!(BridgeError::DuplicateWorker("w1".into()).is_admission());
        assert!(BridgeError::Unauthorized("w1".into()).is_admission());
        assert!(!BridgeError::WorkerNotFound("w1".into()).is_admission());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(BridgeError::worker_unavailable("none idle").status_code(), 503);
        assert_eq!(BridgeError::Unauthorized("w1".into()).status_code(), 401);
        assert_eq!(BridgeError::DuplicateRequest("r1".into()).status_code(), 409);
        assert_eq!(BridgeError::timeout("r1").status_code(), 504);
        assert_eq!(BridgeError::internal("boom").status_code(), 500);
    }

    #[test]
    fn test_admission_messages() {
        assert_eq!(
            BridgeError::PoolFull(1).to_string(),
            "Maximum worker limit (1) reached"
        );
        assert_eq!(
            BridgeError::DuplicateWorker("w1".into()).to_string(),
            "Worker ID 'w1' is already registered"
        );
    }
}
