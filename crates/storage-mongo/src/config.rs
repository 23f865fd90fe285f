//! Configuration for the MongoDB backend.
//!
//! [`MongoConfig`] names the deployment, the database and the collection
//! objects live in, plus the backend-agnostic [`StorageConfig`].

use std::time::Duration;

use fimidx_storage::{ConfigError, StorageConfig};
use serde::{Deserialize, Serialize};

/// Default collection name.
pub const DEFAULT_COLLECTION: &str = "objs";

/// Default connection timeout (10 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default server selection timeout (30 seconds).
const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`MongoObjStorage`](crate::MongoObjStorage).
///
/// Transactions need a replica set or a sharded cluster. A standalone server
/// serves every other operation.
///
/// # Example
///
/// ```
/// use fimidx_storage_mongo::MongoConfig;
///
/// let config = MongoConfig::builder()
///     .uri("mongodb://localhost:27017/?replicaSet=rs0")
///     .database("fimidx")
///     .build()?;
/// assert_eq!(config.collection(), "objs");
/// # Ok::<(), fimidx_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MongoConfig {
    /// Connection string.
    pub(crate) uri: String,

    /// Database holding the collection.
    pub(crate) database: String,

    /// Collection holding every object.
    #[serde(default = "default_collection")]
    pub(crate) collection: String,

    /// Name reported to the server in the handshake.
    #[serde(default)]
    pub(crate) app_name: Option<String>,

    /// Connection timeout.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,

    /// How long to wait for a usable server before failing an operation.
    #[serde(with = "humantime_serde", default = "default_server_selection_timeout")]
    pub(crate) server_selection_timeout: Duration,

    /// Backend-agnostic settings.
    #[serde(default)]
    pub(crate) storage: StorageConfig,
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_owned()
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_server_selection_timeout() -> Duration {
    DEFAULT_SERVER_SELECTION_TIMEOUT
}

#[bon::bon]
impl MongoConfig {
    /// Creates a new configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Empty`] if `uri`, `database` or `collection` is
    /// empty, and [`ConfigError::Invalid`] if `uri` is not a MongoDB
    /// connection string.
    #[builder]
    pub fn new(
        #[builder(into)] uri: String,
        #[builder(into)] database: String,
        #[builder(into, default = DEFAULT_COLLECTION.to_owned())] collection: String,
        #[builder(into)] app_name: Option<String>,
        #[builder(default = DEFAULT_CONNECT_TIMEOUT)] connect_timeout: Duration,
        #[builder(default = DEFAULT_SERVER_SELECTION_TIMEOUT)] server_selection_timeout: Duration,
        #[builder(default)] storage: StorageConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            uri,
            database,
            collection,
            app_name,
            connect_timeout,
            server_selection_timeout,
            storage,
        };
        config.validate()?;
        Ok(config)
    }
}

impl MongoConfig {
    /// Re-checks the invariants, for values that came through serde.
    ///
    /// # Errors
    ///
    /// See [`MongoConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.is_empty() {
            return Err(ConfigError::Empty { field: "uri" });
        }
        if !self.uri.starts_with("mongodb://") && !self.uri.starts_with("mongodb+srv://") {
            return Err(ConfigError::Invalid {
                field: "uri",
                reason: "expected a mongodb:// or mongodb+srv:// connection string".into(),
            });
        }
        if self.database.is_empty() {
            return Err(ConfigError::Empty { field: "database" });
        }
        if self.collection.is_empty() {
            return Err(ConfigError::Empty { field: "collection" });
        }
        self.storage.validate()
    }

    /// Returns the connection string.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the handshake application name, if set.
    #[must_use]
    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the server selection timeout.
    #[must_use]
    pub fn server_selection_timeout(&self) -> Duration {
        self.server_selection_timeout
    }

    /// Returns the backend-agnostic settings.
    #[must_use]
    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config = MongoConfig::builder()
            .uri("mongodb://localhost:27017")
            .database("fimidx")
            .build()
            .unwrap();

        assert_eq!(config.collection(), DEFAULT_COLLECTION);
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.server_selection_timeout(), DEFAULT_SERVER_SELECTION_TIMEOUT);
        assert!(config.app_name().is_none());
        assert_eq!(config.storage(), &StorageConfig::default());
    }

    #[test]
    fn rejects_empty_database() {
        let err = MongoConfig::builder()
            .uri("mongodb://localhost:27017")
            .database("")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::Empty { field: "database" });
    }

    #[test]
    fn rejects_foreign_scheme() {
        let err = MongoConfig::builder()
            .uri("postgres://localhost/fimidx")
            .database("fimidx")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "uri", .. }));
    }

    #[test]
    fn deserializes_with_humantime_durations() {
        let config: MongoConfig = serde_json::from_value(serde_json::json!({
            "uri": "mongodb+srv://cluster.example.net",
            "database": "fimidx",
            "collection": "objects",
            "connect_timeout": "2s",
            "storage": {"batch_size": 50}
        }))
        .unwrap();

        assert_eq!(config.collection(), "objects");
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.storage().batch_size(), 50);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_value::<MongoConfig>(serde_json::json!({
            "uri": "mongodb://localhost",
            "database": "fimidx",
            "pool": 4
        }));
        assert!(result.is_err());
    }
}
