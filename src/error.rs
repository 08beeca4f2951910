//! Error types for the snapshot manager.

use crate::types::SnapshotId;
use thiserror::Error;

/// Main error type for snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The key-value store failed to read or write a key.
    #[error("Storage error on key '{key}': {message}")]
    Storage { key: String, message: String },

    #[error("Snapshot not found: {0}")]
    NotFound(SnapshotId),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,
}

impl SnapshotError {
    /// Wrap any store failure as a storage error for `key`.
    pub fn storage(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SnapshotError::Storage {
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Attribute a store failure to `key`, keeping an existing storage error as is.
    pub fn at_key(self, key: &str) -> Self {
        match self {
            storage @ SnapshotError::Storage { .. } => storage,
            other => SnapshotError::storage(key, other),
        }
    }

    /// Whether this is a key-value store failure.
    pub fn is_storage(&self) -> bool {
        matches!(self, SnapshotError::Storage { .. })
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(e: serde_json::Error) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;
