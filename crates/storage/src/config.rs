//! Settings shared by every object storage backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default page size for reads.
pub const DEFAULT_LIMIT: usize = 100;

/// Default chunk size for bulk operations.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default soft-delete retention: purge everything already deleted.
pub const DEFAULT_CLEANUP_RETENTION: Duration = Duration::ZERO;

/// Backend-independent storage settings.
///
/// # Validation
///
/// - `default_limit` must be `>= 1`
/// - `batch_size` must be `>= 1`
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use fimidx_storage::StorageConfig;
///
/// let config = StorageConfig::builder()
///     .batch_size(100)
///     .cleanup_retention(Duration::from_secs(7 * 24 * 3600))
///     .build()?;
/// assert_eq!(config.default_limit(), 100);
/// # Ok::<(), fimidx_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Page size used when a read gives no limit.
    #[serde(default = "default_limit")]
    pub(crate) default_limit: usize,

    /// Chunk size used when a bulk call gives no batch size.
    #[serde(default = "default_batch_size")]
    pub(crate) batch_size: usize,

    /// How long soft-deleted objects are kept before cleanup purges them.
    #[serde(with = "humantime_serde", default = "default_cleanup_retention")]
    pub(crate) cleanup_retention: Duration,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_cleanup_retention() -> Duration {
    DEFAULT_CLEANUP_RETENTION
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            cleanup_retention: DEFAULT_CLEANUP_RETENTION,
        }
    }
}

#[bon::bon]
impl StorageConfig {
    /// Creates a new configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `default_limit` or `batch_size` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_LIMIT)] default_limit: usize,
        #[builder(default = DEFAULT_BATCH_SIZE)] batch_size: usize,
        #[builder(default = DEFAULT_CLEANUP_RETENTION)] cleanup_retention: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { default_limit, batch_size, cleanup_retention };
        config.validate()?;
        Ok(config)
    }
}

impl StorageConfig {
    /// Re-checks the invariants, for values that came through serde.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] for a zero limit or batch size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_limit == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "default_limit",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "batch_size",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Returns the default page size.
    #[must_use]
    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Returns the default bulk chunk size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the soft-delete retention.
    #[must_use]
    pub fn cleanup_retention(&self) -> Duration {
        self.cleanup_retention
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_default_impl() {
        assert_eq!(StorageConfig::builder().build().expect("valid"), StorageConfig::default());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = StorageConfig::builder().batch_size(0).build().unwrap_err();
        assert_eq!(err, ConfigError::BelowMinimum {
            field: "batch_size",
            min: "1".into(),
            value: "0".into(),
        });
    }

    #[test]
    fn zero_limit_is_rejected() {
        assert!(StorageConfig::builder().default_limit(0).build().is_err());
    }

    #[test]
    fn deserializes_humantime_retention() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"cleanup_retention": "7days", "batch_size": 50}"#)
                .expect("config");
        assert_eq!(config.cleanup_retention(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.batch_size(), 50);
        assert_eq!(config.default_limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<StorageConfig>(r#"{"page_size": 10}"#).is_err());
    }
}
