//! Custom error types for the backup engine.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Sync to '{destination}' failed after {attempts} attempt(s): {reason}")]
    SyncFailed {
        destination: String,
        attempts: u32,
        reason: String,
    },

    #[error("A {running} operation is already running")]
    AlreadyRunning { running: String },

    #[error("Baseline chain of {manifest_id} is broken at {missing_link}: {reason}")]
    ChainBroken {
        manifest_id: String,
        missing_link: String,
        reason: String,
    },

    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Live system error: {0}")]
    Live(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable taxonomy name reported in run results.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::Integrity(_) => "integrity_error",
            EngineError::SyncFailed { .. } => "sync_failed",
            EngineError::AlreadyRunning { .. } => "already_running",
            EngineError::ChainBroken { .. } => "chain_broken",
            EngineError::RestoreFailed(_) => "restore_failed",
            EngineError::Cancelled => "cancelled",
            EngineError::NotFound(_) => "not_found",
            EngineError::Config(_) => "config_error",
            EngineError::Storage(_) => "storage_error",
            EngineError::Network(_) | EngineError::Http(_) => "network_error",
            EngineError::Timeout(_) => "timeout",
            EngineError::Live(_) => "live_system_error",
            EngineError::Io(_) => "io_error",
            EngineError::Sqlite(_) => "store_error",
            EngineError::Serialization(_) => "serialization_error",
        }
    }

    /// Whether a remote operation failing with this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Network(_) | EngineError::Timeout(_) | EngineError::Io(_) => true,
            EngineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        EngineError::Io(std::io::Error::other(err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Serializable form of an error carried in run and restore results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

impl From<&EngineError> for ErrorReport {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Network("reset".into()).is_transient());
        assert!(EngineError::Timeout("put".into()).is_transient());
        assert!(!EngineError::Integrity("digest mismatch".into()).is_transient());
        assert!(!EngineError::Storage("403 Forbidden".into()).is_transient());
    }

    #[test]
    fn test_kind_names() {
        let err = EngineError::AlreadyRunning {
            running: "backup".into(),
        };
        assert_eq!(err.kind(), "already_running");
        assert_eq!(err.to_string(), "A backup operation is already running");
        assert_eq!(EngineError::Cancelled.kind(), "cancelled");
    }
}
