//! Error types for the MongoDB backend.
//!
//! This module maps driver errors onto the canonical
//! [`StorageError`](fimidx_storage::StorageError) variants.

use fimidx_storage::{ConfigError, StorageError};
use mongodb::error::{
    ErrorKind, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT, WriteFailure,
};
use thiserror::Error;

/// Server code for a unique index violation.
const DUPLICATE_KEY: i32 = 11000;

/// Result type alias for MongoDB backend operations.
pub type Result<T> = std::result::Result<T, MongoStorageError>;

/// Errors specific to the MongoDB backend.
#[derive(Debug, Error)]
pub enum MongoStorageError {
    /// Error from the driver.
    #[error("MongoDB driver error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stored document does not have the envelope shape.
    #[error("Malformed document: {0}")]
    Document(String),
}

impl From<MongoStorageError> for StorageError {
    fn from(err: MongoStorageError) -> Self {
        match err {
            MongoStorageError::Driver(source) => driver_error_to_storage_error(source),
            MongoStorageError::Config(source) => source.into(),
            MongoStorageError::Document(message) => StorageError::serialization(message),
        }
    }
}

/// Returns `true` if the error reports a unique index violation.
pub(crate) fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::InsertMany(e) => {
            e.write_errors.as_ref().is_some_and(|errs| errs.iter().any(|w| w.code == DUPLICATE_KEY))
        },
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Converts a driver error to a storage error.
pub(crate) fn driver_error_to_storage_error(err: mongodb::error::Error) -> StorageError {
    if is_duplicate_key(&err) {
        return StorageError::conflict_with_source("duplicate object id", err);
    }
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR)
        || err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    {
        tracing::debug!(error = %err, "MongoDB transaction conflict");
        return StorageError::transaction_aborted_with_source("transaction aborted by server", err);
    }
    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => {
            tracing::warn!(error = %err, "MongoDB unreachable");
            StorageError::backend_unavailable_with_source("MongoDB unreachable", err)
        },
        ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
            StorageError::serialization_with_source("BSON conversion failed", err)
        },
        _ => {
            tracing::warn!(error = %err, "Unexpected MongoDB error");
            StorageError::internal_with_source("MongoDB operation failed", err)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_become_validation() {
        let err: StorageError =
            MongoStorageError::Config(ConfigError::Empty { field: "uri" }).into();
        assert!(matches!(err, StorageError::Validation { .. }));
    }

    #[test]
    fn malformed_documents_become_serialization() {
        let err: StorageError = MongoStorageError::Document("missing createdAt".into()).into();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn custom_driver_errors_are_internal() {
        let driver = mongodb::error::Error::custom("boom");
        assert!(!is_duplicate_key(&driver));
        let err = driver_error_to_storage_error(driver);
        assert!(matches!(err, StorageError::Internal { .. }));
    }
}
