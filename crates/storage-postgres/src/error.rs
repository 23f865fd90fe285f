//! Error types for the PostgreSQL backend.
//!
//! This module maps `sqlx` errors onto the canonical
//! [`StorageError`](fimidx_storage::StorageError) variants, mostly by
//! SQLSTATE code.

use fimidx_storage::{ConfigError, StorageError};
use thiserror::Error;

/// `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";

/// `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";

/// `invalid_regular_expression`.
const INVALID_REGEX: &str = "2201B";

/// Result type alias for PostgreSQL backend operations.
pub type Result<T> = std::result::Result<T, PostgresStorageError>;

/// Errors specific to the PostgreSQL backend.
#[derive(Debug, Error)]
pub enum PostgresStorageError {
    /// Error from the driver.
    #[error("PostgreSQL error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stored row does not have the envelope shape.
    #[error("Malformed row: {0}")]
    Row(String),
}

impl From<PostgresStorageError> for StorageError {
    fn from(err: PostgresStorageError) -> Self {
        match err {
            PostgresStorageError::Sqlx(source) => sqlx_error_to_storage_error(source),
            PostgresStorageError::Config(source) => source.into(),
            PostgresStorageError::Row(message) => StorageError::serialization(message),
        }
    }
}

/// Returns the SQLSTATE of a database error, if it is one.
fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error().and_then(|db| db.code()).map(|code| code.into_owned())
}

/// Converts a driver error to a storage error.
pub(crate) fn sqlx_error_to_storage_error(err: sqlx::Error) -> StorageError {
    match sqlstate(&err).as_deref() {
        Some(UNIQUE_VIOLATION) => {
            return StorageError::conflict_with_source("duplicate object id", err);
        },
        Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => {
            tracing::debug!(error = %err, "PostgreSQL transaction conflict");
            return StorageError::transaction_aborted_with_source(
                "transaction aborted by server",
                err,
            );
        },
        Some(INVALID_REGEX) => {
            return StorageError::validation(format!("pattern rejected by PostgreSQL: {err}"));
        },
        Some(code) if code.starts_with("08") => {
            tracing::warn!(error = %err, "PostgreSQL connection failure");
            return StorageError::backend_unavailable_with_source("PostgreSQL unreachable", err);
        },
        _ => {},
    }
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            tracing::warn!(error = %err, "PostgreSQL unreachable");
            StorageError::backend_unavailable_with_source("PostgreSQL unreachable", err)
        },
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Encode(_) => {
            StorageError::serialization_with_source("row conversion failed", err)
        },
        _ => {
            tracing::warn!(error = %err, "Unexpected PostgreSQL error");
            StorageError::internal_with_source("PostgreSQL operation failed", err)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_become_validation() {
        let err: StorageError =
            PostgresStorageError::Config(ConfigError::Empty { field: "url" }).into();
        assert!(matches!(err, StorageError::Validation { .. }));
    }

    #[test]
    fn malformed_rows_become_serialization() {
        let err: StorageError = PostgresStorageError::Row("obj_record is a list".into()).into();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn pool_exhaustion_is_retryable() {
        let err = sqlx_error_to_storage_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StorageError::BackendUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_rows_are_internal() {
        let err = sqlx_error_to_storage_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::Internal { .. }));
    }
}
