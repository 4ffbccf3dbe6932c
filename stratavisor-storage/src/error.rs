//! Error types for the storage core.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Bad, unknown or conditionally-invalid configuration.
    /// Surfaced to the caller, never retried automatically.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Insufficient space in the pool. Retryable by the caller after
    /// freeing space.
    #[error("Insufficient capacity in pool {pool}: requested {requested} bytes, {available} bytes free")]
    Capacity {
        pool: String,
        requested: u64,
        available: u64,
    },

    /// Referenced pool, volume or snapshot does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Duplicate name within the same namespace.
    #[error("Name already in use: {0}")]
    NameConflict(String),

    /// Delete blocked by live references, listing the blockers.
    #[error("Operation blocked by dependents: {blockers:?}")]
    HasDependents { blockers: Vec<String> },

    /// Operation not available for this driver or instance kind. Raised at
    /// validation time, never discovered mid-operation.
    #[error("Driver {driver} does not support {operation}")]
    CapabilityUnsupported { driver: String, operation: String },

    /// Invalid size, including shrinking below current used space.
    #[error("Invalid size: {0}")]
    Size(String),

    /// Backend failure after transient retries were exhausted.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Transient backend contention (e.g. a lock held by an external
    /// process). Retried a bounded number of times before surfacing
    /// as [`StorageError::Backend`].
    #[error("Backend busy: {0}")]
    BackendBusy(String),

    /// The operation was cancelled; any partial state has been torn down.
    #[error("Operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Whether a bounded retry with backoff is appropriate.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::BackendBusy(_))
    }

    /// Shorthand for a missing pool.
    pub fn pool_not_found(name: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind: "Pool",
            name: name.into(),
        }
    }

    /// Shorthand for a missing volume.
    pub fn volume_not_found(name: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind: "Volume",
            name: name.into(),
        }
    }

    /// Shorthand for a missing snapshot.
    pub fn snapshot_not_found(name: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind: "Snapshot",
            name: name.into(),
        }
    }
}

impl From<stratavisor_common::SizeParseError> for StorageError {
    fn from(err: stratavisor_common::SizeParseError) -> Self {
        StorageError::Config(err.to_string())
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
