//! Error types for molvec

use std::time::Duration;
use thiserror::Error;

/// Result type alias for molvec operations
pub type Result<T> = std::result::Result<T, MolvecError>;

/// Main error type for molvec
#[derive(Error, Debug)]
pub enum MolvecError {
    /// Fingerprint rejected at the boundary (bad byte length, bit width or padding)
    #[error("Malformed fingerprint: {0}")]
    MalformedFingerprint(String),

    /// Absent record
    #[error("Not found: {0}")]
    NotFound(String),

    /// Fingerprint store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// External vector index failure
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Approximate index references a molecule missing from the store
    #[error("Index inconsistency: {0}")]
    IndexInconsistency(String),

    /// Cooperative cancellation or deadline hit
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Rejected sync-state transition
    #[error("Invalid sync transition: {event} from {from}")]
    InvalidTransition {
        /// State the entry was in
        from: String,
        /// Event that was applied
        event: String,
    },

    /// Every routing tier failed for a query
    #[error("All similarity backends failed: {0}")]
    AllBackendsFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by a [`FingerprintStore`](crate::storage::FingerprintStore)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Underlying storage failed; never retried by the store itself
    #[error("Storage I/O failure: {0}")]
    IoFailure(String),
}

/// Errors raised by an [`ExternalIndexAdapter`](crate::external::ExternalIndexAdapter)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Call did not complete within its bound
    #[error("External index call timed out after {0:?}")]
    Timeout(Duration),

    /// Service unreachable or returned a server error
    #[error("External index unavailable: {0}")]
    Unavailable(String),

    /// Service asked us to slow down
    #[error("External index rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Server-provided hint, if any
        retry_after: Option<Duration>,
    },
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoFailure(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::IoFailure(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        StoreError::IoFailure(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        StoreError::IoFailure(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        StoreError::IoFailure(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        StoreError::IoFailure(err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        StoreError::IoFailure(err.to_string())
    }
}

impl MolvecError {
    /// Whether the error came from the storage layer
    pub fn is_store_failure(&self) -> bool {
        matches!(self, MolvecError::Store(StoreError::IoFailure(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_converts() {
        let err: MolvecError = AdapterError::Timeout(Duration::from_millis(250)).into();
        assert!(matches!(err, MolvecError::Adapter(AdapterError::Timeout(_))));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_io_failure_is_store_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: MolvecError = StoreError::from(io).into();
        assert!(err.is_store_failure());
    }
}
