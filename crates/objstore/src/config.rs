//! Deployment-level storage configuration.

use fimidx_storage::{ConfigError, StorageConfig};
#[cfg(feature = "mongo")]
use fimidx_storage_mongo::MongoConfig;
#[cfg(feature = "postgres")]
use fimidx_storage_postgres::PostgresConfig;
use serde::{Deserialize, Serialize};

/// Which backend to run and how to reach it.
///
/// Deserializes from the `storage` section of a deployment config, with a
/// `type` tag naming the backend and that backend's settings alongside it:
///
/// ```
/// use fimidx_objstore::StoreConfig;
///
/// let config: StoreConfig = serde_json::from_str(
///     r#"{ "type": "memory", "storage": { "default_limit": 25 } }"#,
/// )?;
/// assert_eq!(config.kind(), "memory");
/// assert_eq!(config.storage().default_limit(), 25);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
#[non_exhaustive]
pub enum StoreConfig {
    /// Process-local storage. Nothing survives a restart.
    Memory {
        /// Backend-agnostic settings.
        #[serde(default)]
        storage: StorageConfig,
    },
    /// MongoDB collection.
    #[cfg(feature = "mongo")]
    Mongo(MongoConfig),
    /// PostgreSQL table.
    #[cfg(feature = "postgres")]
    Postgres(PostgresConfig),
}

impl StoreConfig {
    /// Memory storage with the given settings.
    #[must_use]
    pub fn memory(storage: StorageConfig) -> Self {
        Self::Memory { storage }
    }

    /// The `type` tag of this configuration.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            #[cfg(feature = "mongo")]
            Self::Mongo(_) => "mongo",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres",
        }
    }

    /// Backend-agnostic settings, wherever the backend keeps them.
    #[must_use]
    pub fn storage(&self) -> &StorageConfig {
        match self {
            Self::Memory { storage } => storage,
            #[cfg(feature = "mongo")]
            Self::Mongo(config) => config.storage(),
            #[cfg(feature = "postgres")]
            Self::Postgres(config) => config.storage(),
        }
    }

    /// Validates the selected backend's settings.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Memory { storage } => storage.validate(),
            #[cfg(feature = "mongo")]
            Self::Mongo(config) => config.validate(),
            #[cfg(feature = "postgres")]
            Self::Postgres(config) => config.validate(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::memory(StorageConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[test]
    fn default_is_memory() {
        let config = StoreConfig::default();
        assert_eq!(config.kind(), "memory");
        assert_eq!(config.storage(), &StorageConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn memory_settings_are_optional() {
        let config: StoreConfig = serde_json::from_value(json!({"type": "memory"})).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[rstest]
    #[case::unknown_type(json!({"type": "sqlite"}))]
    #[case::missing_type(json!({"storage": {}}))]
    #[case::capitalized_type(json!({"type": "Memory"}))]
    #[case::unknown_memory_setting(json!({"type": "memory", "storage": {"ttl": "1h"}}))]
    fn malformed_configs_are_rejected(#[case] value: serde_json::Value) {
        assert!(serde_json::from_value::<StoreConfig>(value).is_err());
    }

    #[test]
    fn memory_validation_checks_storage_settings() {
        let config: StoreConfig =
            serde_json::from_value(json!({"type": "memory", "storage": {"batch_size": 0}}))
                .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::BelowMinimum { .. })));
    }

    #[cfg(feature = "mongo")]
    #[test]
    fn mongo_settings_sit_beside_the_tag() {
        let config: StoreConfig = serde_json::from_value(json!({
            "type": "mongo",
            "uri": "mongodb://localhost:27017",
            "database": "fimidx",
            "connect_timeout": "3s",
        }))
        .unwrap();

        assert_eq!(config.kind(), "mongo");
        let StoreConfig::Mongo(mongo) = &config else { panic!("expected mongo, got {config:?}") };
        assert_eq!(mongo.database(), "fimidx");
        assert_eq!(mongo.connect_timeout(), Duration::from_secs(3));
    }

    #[cfg(feature = "mongo")]
    #[test]
    fn mongo_unknown_fields_are_rejected() {
        let result = serde_json::from_value::<StoreConfig>(json!({
            "type": "mongo",
            "uri": "mongodb://localhost:27017",
            "database": "fimidx",
            "pool": 3,
        }));
        assert!(result.is_err());
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn postgres_validation_reaches_backend_rules() {
        let config: StoreConfig = serde_json::from_value(json!({
            "type": "postgres",
            "url": "mysql://localhost/fimidx",
        }))
        .unwrap();

        assert_eq!(config.kind(), "postgres");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "url", .. })));
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn postgres_storage_settings_are_exposed() {
        let config: StoreConfig = serde_json::from_value(json!({
            "type": "postgres",
            "url": "postgres://localhost/fimidx",
            "storage": {"cleanup_retention": "1h"},
        }))
        .unwrap();
        assert_eq!(config.storage().cleanup_retention(), Duration::from_secs(3600));
    }
}
