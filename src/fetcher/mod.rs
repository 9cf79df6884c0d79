//! Retrieval of single packages from the remote archive

mod http;

pub use http::HttpFetcher;

use crate::identifier::Identifier;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Classified outcome of one failed fetch attempt
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchError {
    /// The archive has no package with this identifier
    #[error("Not found in archive")]
    NotFound,

    /// Network failure, timeout, rate limit or server error
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Writing to local storage failed
    #[error("Storage failure: {0}")]
    Storage(String),

    /// Body was empty or did not hash to the identifier
    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// The archive refused the request (bad key, bad request)
    #[error("Rejected by archive: {0}")]
    Rejected(String),

    /// The fetch itself panicked
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::IntegrityMismatch(_))
    }
}

impl From<crate::storage::StorageError> for FetchError {
    fn from(err: crate::storage::StorageError) -> Self {
        if err.is_integrity() {
            FetchError::IntegrityMismatch(err.to_string())
        } else {
            FetchError::Storage(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// One network retrieval plus local write of a package.
///
/// Implementations must bound their own run time; the queue never cancels
/// a fetch in progress.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, identifier: &Identifier) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Transient("503".into()).is_retryable());
        assert!(FetchError::IntegrityMismatch("short body".into()).is_retryable());
        assert!(!FetchError::NotFound.is_retryable());
        assert!(!FetchError::Storage("disk full".into()).is_retryable());
        assert!(!FetchError::Rejected("401".into()).is_retryable());
        assert!(!FetchError::Internal("panic".into()).is_retryable());
    }

    #[test]
    fn test_storage_error_mapping() {
        let id = Identifier::parse(&"A".repeat(64)).unwrap();
        let empty: FetchError = StorageError::Empty(id).into();
        assert!(matches!(empty, FetchError::IntegrityMismatch(_)));

        let io = StorageError::Prepare {
            path: PathBuf::from("/nowhere"),
            source: std::io::Error::other("read-only"),
        };
        assert!(matches!(FetchError::from(io), FetchError::Storage(_)));
    }

    #[test]
    fn test_serializes_with_kind() {
        let json = serde_json::to_value(FetchError::Transient("timeout".into())).unwrap();
        assert_eq!(json["kind"], "transient");
        assert_eq!(json["detail"], "timeout");
    }
}
