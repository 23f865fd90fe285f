//! Storage error types and result alias.
//!
//! Every backend maps its driver errors onto [`StorageError`], so callers can
//! branch on the same taxonomy whichever database sits underneath.
//!
//! # Error Types
//!
//! - [`StorageError::NotFound`] - exactly one object was required and none matched
//! - [`StorageError::Conflict`] - identity collision on create or a unique violation
//! - [`StorageError::Validation`] - malformed query, unknown operator, bad value shape
//! - [`StorageError::TransactionAborted`] - the backend rolled a transaction back
//! - [`StorageError::BackendUnavailable`] - connection or transport failure
//! - [`StorageError::Serialization`] - stored data could not be encoded or decoded
//! - [`StorageError::Internal`] - any other backend failure
//!
//! # Example
//!
//! ```
//! use fimidx_storage::{StorageError, StorageResult};
//!
//! fn lookup(id: &str) -> StorageResult<()> {
//!     Err(StorageError::not_found(format!("obj {id}")))
//! }
//!
//! assert!(matches!(lookup("a"), Err(StorageError::NotFound { .. })));
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via `#[source]`, so the original driver
/// error stays reachable for logging.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream matches must
/// include a wildcard arm.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A lookup that required exactly one match found nothing.
    #[error("Not found: {what}")]
    NotFound {
        /// What was being looked up.
        what: String,
    },

    /// Identity collision.
    ///
    /// Raised for the whole call by `create` when an id already exists, and by
    /// backends when a unique index rejects a write.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the collision.
        message: String,
        /// The underlying error, when the backend reported one.
        #[source]
        source: Option<BoxError>,
    },

    /// Malformed input, rejected before the backend is touched.
    #[error("Validation error: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// The backend aborted or failed to commit a transaction.
    ///
    /// The original cause is kept as the source.
    #[error("Transaction aborted: {message}")]
    TransactionAborted {
        /// Description of the abort.
        message: String,
        /// The error that caused the rollback.
        #[source]
        source: Option<BoxError>,
    },

    /// Connection or transport failure. Never retried inside this crate.
    #[error("Backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the connection error.
        message: String,
        /// The underlying transport error.
        #[source]
        source: Option<BoxError>,
    },

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Catch-all for backend errors that fit no other category.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a new `Conflict` error with the given message.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into(), source: None }
    }

    /// Creates a new `Conflict` error with a message and source error.
    #[must_use]
    pub fn conflict_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Conflict { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a new `TransactionAborted` error with the given message.
    #[must_use]
    pub fn transaction_aborted(message: impl Into<String>) -> Self {
        Self::TransactionAborted { message: message.into(), source: None }
    }

    /// Creates a new `TransactionAborted` error with a message and source error.
    #[must_use]
    pub fn transaction_aborted_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransactionAborted { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `BackendUnavailable` error with the given message.
    #[must_use]
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable { message: message.into(), source: None }
    }

    /// Creates a new `BackendUnavailable` error with a message and source error.
    #[must_use]
    pub fn backend_unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendUnavailable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` if retrying the same call later may succeed.
    ///
    /// Only transport failures qualify. Retrying is the caller's decision;
    /// nothing in this crate retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

/// Errors raised while validating configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric setting is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending setting.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// Value that was supplied.
        value: String,
    },

    /// A required setting is empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Name of the offending setting.
        field: &'static str,
    },

    /// A setting has an unusable value.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// Name of the offending setting.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl From<ConfigError> for StorageError {
    fn from(err: ConfigError) -> Self {
        StorageError::validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn only_backend_unavailable_is_retryable() {
        assert!(StorageError::backend_unavailable("down").is_retryable());
        assert!(!StorageError::conflict("dup").is_retryable());
        assert!(!StorageError::validation("bad op").is_retryable());
        assert!(!StorageError::transaction_aborted("rolled back").is_retryable());
        assert!(!StorageError::not_found("x").is_retryable());
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = StorageError::backend_unavailable_with_source("connect failed", io);
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("refused"));
    }

    #[test]
    fn config_error_converts_to_validation() {
        let err: StorageError =
            ConfigError::BelowMinimum { field: "batch_size", min: "1".into(), value: "0".into() }
                .into();
        assert!(matches!(err, StorageError::Validation { .. }));
        assert_eq!(err.to_string(), "Validation error: batch_size must be at least 1, got 0");
    }
}
