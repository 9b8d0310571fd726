//! Error types for the face index cache

use std::time::Duration;
use thiserror::Error;

/// Result type alias for facematch operations
pub type Result<T> = std::result::Result<T, FaceMatchError>;

/// Error types that can occur while maintaining or querying face indexes
#[derive(Error, Debug)]
pub enum FaceMatchError {
    #[error("Collection not found: {collection}")]
    NotFound { collection: String },

    #[error("Timed out after {waited:?} waiting for the lock on collection {collection}")]
    LockTimeout { collection: String, waited: Duration },

    #[error("Lease on collection {collection} expired before the commit")]
    LeaseLost { collection: String },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Inconsistent snapshot: {vectors} vectors but {labels} labels")]
    InconsistentSnapshot { vectors: usize, labels: usize },

    #[error("Invalid vector: {reason}")]
    InvalidVector { reason: String },

    #[error("Corrupt snapshot: {reason}")]
    CorruptSnapshot { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Face source error: {0}")]
    SourceError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FaceMatchError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FaceMatchError::LockTimeout { .. } | FaceMatchError::LeaseLost { .. }
        )
    }
}
