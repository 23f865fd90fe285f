//! The [`ObjStore`] enum: one type over every backend.

use async_trait::async_trait;
use fimidx_storage::{
    BulkDeleteParams, BulkUpdateParams, BulkUpsertParams, BulkUpsertResult, CleanupResult,
    DeleteParams, DeleteResult, HealthReport, Identity, MemoryObjStorage, Obj, ObjStorage,
    ReadParams, ReadResult, StorageConfig, StorageResult, TransactionalStorage, UpdateParams,
    UpdateResult, UpsertBatch, UpsertScope,
};
#[cfg(feature = "mongo")]
use fimidx_storage_mongo::MongoObjStorage;
#[cfg(feature = "postgres")]
use fimidx_storage_postgres::PostgresObjStorage;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::StoreConfig;

/// Forwards an expression to whichever backend `$store` holds.
macro_rules! dispatch {
    ($store:expr, |$inner:ident| $body:expr) => {
        match $store {
            ObjStore::Memory($inner) => $body,
            #[cfg(feature = "mongo")]
            ObjStore::Mongo($inner) => $body,
            #[cfg(feature = "postgres")]
            ObjStore::Postgres($inner) => $body,
        }
    };
}

/// Object storage picked at runtime.
///
/// Every call is a `match` onto the concrete backend, so the enum costs no
/// boxing and keeps each backend's own transaction semantics.
///
/// # Cloning
///
/// Clones share the underlying store: the same map for memory, the same
/// client or pool otherwise.
#[derive(Clone)]
#[non_exhaustive]
pub enum ObjStore {
    /// [`MemoryObjStorage`].
    Memory(MemoryObjStorage),
    /// [`MongoObjStorage`].
    #[cfg(feature = "mongo")]
    Mongo(MongoObjStorage),
    /// [`PostgresObjStorage`].
    #[cfg(feature = "postgres")]
    Postgres(PostgresObjStorage),
}

impl ObjStore {
    /// Builds the backend `config` selects, connecting and preparing indexes
    /// or tables where the backend has them.
    ///
    /// # Errors
    ///
    /// Returns [`Validation`](fimidx_storage::StorageError::Validation) for a
    /// bad configuration, or the backend's connection error.
    pub async fn connect(config: StoreConfig) -> StorageResult<Self> {
        config.validate()?;
        let store = match config {
            StoreConfig::Memory { storage } => Self::Memory(MemoryObjStorage::with_config(storage)),
            #[cfg(feature = "mongo")]
            StoreConfig::Mongo(config) => Self::Mongo(MongoObjStorage::connect(config).await?),
            #[cfg(feature = "postgres")]
            StoreConfig::Postgres(config) => {
                Self::Postgres(PostgresObjStorage::connect(config).await?)
            },
        };
        info!(backend = store.kind(), "Object store ready");
        Ok(store)
    }

    /// An empty memory store with default settings.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryObjStorage::new())
    }

    /// Returns `true` for the memory backend.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }

    /// The backend's `type` tag, as in [`StoreConfig`].
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            #[cfg(feature = "mongo")]
            Self::Mongo(_) => "mongo",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres",
        }
    }
}

impl From<MemoryObjStorage> for ObjStore {
    fn from(storage: MemoryObjStorage) -> Self {
        Self::Memory(storage)
    }
}

#[cfg(feature = "mongo")]
impl From<MongoObjStorage> for ObjStore {
    fn from(storage: MongoObjStorage) -> Self {
        Self::Mongo(storage)
    }
}

#[cfg(feature = "postgres")]
impl From<PostgresObjStorage> for ObjStore {
    fn from(storage: PostgresObjStorage) -> Self {
        Self::Postgres(storage)
    }
}

#[async_trait]
impl ObjStorage for ObjStore {
    fn config(&self) -> &StorageConfig {
        dispatch!(self, |s| s.config())
    }

    async fn create(&self, objs: Vec<Obj>) -> StorageResult<Vec<Obj>> {
        dispatch!(self, |s| s.create(objs).await)
    }

    async fn read(&self, params: ReadParams) -> StorageResult<ReadResult> {
        dispatch!(self, |s| s.read(params).await)
    }

    async fn update(&self, params: UpdateParams) -> StorageResult<UpdateResult> {
        dispatch!(self, |s| s.update(params).await)
    }

    async fn delete(&self, params: DeleteParams) -> StorageResult<DeleteResult> {
        dispatch!(self, |s| s.delete(params).await)
    }

    async fn cleanup_deleted_objs(&self) -> StorageResult<CleanupResult> {
        dispatch!(self, |s| s.cleanup_deleted_objs().await)
    }

    async fn health_check(&self) -> StorageResult<HealthReport> {
        dispatch!(self, |s| s.health_check().await)
    }

    async fn find_by_identity(
        &self,
        scope: &UpsertScope,
        keys: &[String],
        identities: &[Identity],
    ) -> StorageResult<Vec<Obj>> {
        dispatch!(self, |s| s.find_by_identity(scope, keys, identities).await)
    }

    async fn write_upsert_batch(&self, batch: UpsertBatch) -> StorageResult<()> {
        dispatch!(self, |s| s.write_upsert_batch(batch).await)
    }

    async fn bulk_upsert(&self, params: BulkUpsertParams) -> StorageResult<BulkUpsertResult> {
        dispatch!(self, |s| s.bulk_upsert(params).await)
    }

    async fn bulk_update(&self, params: BulkUpdateParams) -> StorageResult<UpdateResult> {
        dispatch!(self, |s| s.bulk_update(params).await)
    }

    async fn bulk_delete(&self, params: BulkDeleteParams) -> StorageResult<DeleteResult> {
        dispatch!(self, |s| s.bulk_delete(params).await)
    }
}

#[async_trait]
impl TransactionalStorage for ObjStore {
    async fn with_transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send,
        F: for<'tx> FnOnce(&'tx dyn ObjStorage) -> BoxFuture<'tx, StorageResult<T>> + Send,
    {
        dispatch!(self, |s| s.with_transaction(f).await)
    }
}

impl std::fmt::Debug for ObjStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(s) => f.debug_struct("ObjStore::Memory").field("objs", &s.len()).finish(),
            #[cfg(feature = "mongo")]
            Self::Mongo(s) => f
                .debug_struct("ObjStore::Mongo")
                .field("database", &s.mongo_config().database())
                .field("collection", &s.mongo_config().collection())
                .finish(),
            #[cfg(feature = "postgres")]
            Self::Postgres(s) => f
                .debug_struct("ObjStore::Postgres")
                .field("table", &s.postgres_config().table())
                .finish(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use fimidx_storage::{
        ObjQuery, StorageError,
        testutil::{make_member_record, make_obj, record, seed, unique_app_id},
    };
    use serde_json::json;

    use super::*;

    fn members(app: &str) -> ReadParams {
        ReadParams::builder().query(ObjQuery::for_app(app)).tag("member").build()
    }

    #[tokio::test]
    async fn memory_store_via_enum() {
        let store = ObjStore::memory();
        assert!(store.is_memory());
        assert_eq!(store.kind(), "memory");

        let app = unique_app_id("enum");
        let obj = make_obj(&app, "member", record(json!({"name": "ada"})));
        store.create(vec![obj.clone()]).await.expect("create failed");

        let page = store.read(members(&app)).await.expect("read failed");
        assert_eq!(page.objs, vec![obj]);
    }

    #[tokio::test]
    async fn connect_builds_memory_from_config() {
        let storage = StorageConfig::builder().default_limit(7).build().unwrap();
        let store = ObjStore::connect(StoreConfig::memory(storage)).await.unwrap();
        assert!(store.is_memory());
        assert_eq!(store.config().default_limit(), 7);
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let config: StoreConfig =
            serde_json::from_value(json!({"type": "memory", "storage": {"default_limit": 0}}))
                .unwrap();
        let err = ObjStore::connect(config).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn clones_share_objects() {
        let store = ObjStore::memory();
        let clone = store.clone();
        let app = unique_app_id("clone");

        seed(&store, &app, "member", (0..2).map(make_member_record)).await;
        let page = clone.read(members(&app)).await.unwrap();
        assert_eq!(page.objs.len(), 2);
    }

    #[tokio::test]
    async fn transactions_reach_the_backend() {
        let store = ObjStore::memory();
        let app = unique_app_id("tx");

        let err = store
            .with_transaction(|tx| {
                let app = app.clone();
                Box::pin(async move {
                    seed(tx, &app, "member", (0..2).map(make_member_record)).await;
                    Err::<(), _>(StorageError::validation("stop"))
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));
        assert!(store.read(members(&app)).await.unwrap().objs.is_empty());
    }

    #[tokio::test]
    async fn health_check_reports_memory() {
        let report = ObjStore::memory().health_check().await.expect("health check failed");
        assert_eq!(report.backend, "memory");
    }

    #[test]
    fn debug_names_the_variant() {
        let debug = format!("{:?}", ObjStore::memory());
        assert_eq!(debug, "ObjStore::Memory { objs: 0 }");
    }
}
