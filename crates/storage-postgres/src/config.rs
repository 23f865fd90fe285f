//! Configuration for the PostgreSQL backend.
//!
//! [`PostgresConfig`] names the database, the table objects live in and the
//! pool limits, plus the backend-agnostic [`StorageConfig`].

use std::time::Duration;

use fimidx_storage::{ConfigError, StorageConfig};
use serde::{Deserialize, Serialize};

/// Default table name.
pub const DEFAULT_TABLE: &str = "objs";

/// Default maximum pool size.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default time to wait for a pooled connection (30 seconds).
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`PostgresObjStorage`](crate::PostgresObjStorage).
///
/// # Example
///
/// ```
/// use fimidx_storage_postgres::PostgresConfig;
///
/// let config = PostgresConfig::builder()
///     .url("postgres://fimidx@localhost/fimidx")
///     .max_connections(4)
///     .build()?;
/// assert_eq!(config.table(), "objs");
/// # Ok::<(), fimidx_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresConfig {
    /// Connection URL.
    pub(crate) url: String,

    /// Table holding every object. Spliced into SQL, so it must be a plain
    /// identifier.
    #[serde(default = "default_table")]
    pub(crate) table: String,

    /// Upper bound on pooled connections.
    #[serde(default = "default_max_connections")]
    pub(crate) max_connections: u32,

    /// Connections kept open while idle.
    #[serde(default)]
    pub(crate) min_connections: u32,

    /// How long an operation waits for a pooled connection.
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub(crate) acquire_timeout: Duration,

    /// Create the table and its indexes on connect.
    #[serde(default = "default_migrate")]
    pub(crate) migrate: bool,

    /// Backend-agnostic settings.
    #[serde(default)]
    pub(crate) storage: StorageConfig,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_owned()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_acquire_timeout() -> Duration {
    DEFAULT_ACQUIRE_TIMEOUT
}

fn default_migrate() -> bool {
    true
}

#[bon::bon]
impl PostgresConfig {
    /// Creates a new configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Empty`] if `url` or `table` is empty,
    /// [`ConfigError::Invalid`] if `url` is not a PostgreSQL URL or `table`
    /// is not a plain identifier, and [`ConfigError::BelowMinimum`] if
    /// `max_connections` is zero or below `min_connections`.
    #[builder]
    pub fn new(
        #[builder(into)] url: String,
        #[builder(into, default = DEFAULT_TABLE.to_owned())] table: String,
        #[builder(default = DEFAULT_MAX_CONNECTIONS)] max_connections: u32,
        #[builder(default)] min_connections: u32,
        #[builder(default = DEFAULT_ACQUIRE_TIMEOUT)] acquire_timeout: Duration,
        #[builder(default = true)] migrate: bool,
        #[builder(default)] storage: StorageConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            url,
            table,
            max_connections,
            min_connections,
            acquire_timeout,
            migrate,
            storage,
        };
        config.validate()?;
        Ok(config)
    }
}

impl PostgresConfig {
    /// Re-checks the invariants, for values that came through serde.
    ///
    /// # Errors
    ///
    /// See [`PostgresConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Empty { field: "url" });
        }
        if !self.url.starts_with("postgres://") && !self.url.starts_with("postgresql://") {
            return Err(ConfigError::Invalid {
                field: "url",
                reason: "expected a postgres:// or postgresql:// URL".into(),
            });
        }
        if self.table.is_empty() {
            return Err(ConfigError::Empty { field: "table" });
        }
        if !is_identifier(&self.table) {
            return Err(ConfigError::Invalid {
                field: "table",
                reason: format!("{:?} is not a lowercase SQL identifier", self.table),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_connections",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.max_connections < self.min_connections {
            return Err(ConfigError::BelowMinimum {
                field: "max_connections",
                min: self.min_connections.to_string(),
                value: self.max_connections.to_string(),
            });
        }
        self.storage.validate()
    }

    /// Returns the connection URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the maximum pool size.
    #[must_use]
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Returns the number of idle connections kept open.
    #[must_use]
    pub fn min_connections(&self) -> u32 {
        self.min_connections
    }

    /// Returns the pool acquire timeout.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Returns whether the schema is created on connect.
    #[must_use]
    pub fn migrate(&self) -> bool {
        self.migrate
    }

    /// Returns the backend-agnostic settings.
    #[must_use]
    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }
}

/// `[a-z_][a-z0-9_]*`, at most 48 bytes so derived index names fit the
/// 63-byte limit.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    name.len() <= 48
        && chars.next().is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
