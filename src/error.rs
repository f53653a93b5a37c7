//! Error types for kg-core.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using kg-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during knowledge graph operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A required key was empty or a request was malformed. Nothing changed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Delete or recall on a key that does not exist. Nothing changed.
    #[error("Not found in {scope} graph: {key}")]
    NotFound { scope: String, key: String },

    /// Sync with a session that was never registered or has been purged.
    #[error("Unknown session: {0}. Register a new session first")]
    UnknownSession(String),

    /// Snapshot write or backup rotation failed.
    #[error("Storage I/O error at {}: {source}", path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A snapshot file could not be parsed or failed verification.
    #[error("Corrupt snapshot {}: {reason}", path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    /// A graph lock could not be acquired within the configured wait.
    #[error("{scope} graph busy: lock not acquired within {waited_ms}ms")]
    Busy { scope: String, waited_ms: u64 },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(scope: impl std::fmt::Display, key: impl Into<String>) -> Self {
        Self::NotFound {
            scope: scope.to_string(),
            key: key.into(),
        }
    }

    /// Create a storage I/O error.
    pub fn storage_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageIo {
            path: path.into(),
            source,
        }
    }

    /// Create a corrupt snapshot error.
    pub fn corrupt_snapshot(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptSnapshot {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a busy error.
    pub fn busy(scope: impl std::fmt::Display, waited_ms: u64) -> Self {
        Self::Busy {
            scope: scope.to_string(),
            waited_ms,
        }
    }
}
