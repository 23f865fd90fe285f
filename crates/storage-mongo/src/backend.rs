//! [`ObjStorage`] over a MongoDB collection.

use std::{fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use fimidx_storage::{
    CleanupResult, DeleteParams, DeleteResult, HealthReport, Identity, Lifecycle, Obj, ObjFilter,
    ObjStorage, ReadParams, ReadResult, StorageConfig, StorageError, StorageResult,
    TransactionalStorage, UpdateParams, UpdateResult, UpsertBatch, UpsertScope, merge_records,
    obj, sort::resolve_sort,
};
use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, ClientSession, Collection, IndexModel,
    bson::{Bson, Document, doc},
    options::{ClientOptions, FindOptions},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::MongoConfig,
    document::{
        ID, RECORD, document_to_obj, obj_to_document, record_to_document, to_bson_datetime,
        value_to_bson,
    },
    error::{MongoStorageError, driver_error_to_storage_error},
    filter::{compile_filter, compile_sort},
};

/// Runs a driver action inside the handle's transaction, if it has one.
macro_rules! with_session {
    ($storage:expr, $action:expr) => {
        match &$storage.session {
            Some(session) => {
                let mut session = session.lock().await;
                $action.session(&mut *session).await
            },
            None => $action.await,
        }
        .map_err(driver_error_to_storage_error)
    };
}

/// Index keys for the collection.
fn index_models() -> Vec<IndexModel> {
    [
        doc! { "appId": 1, "groupId": 1, "tag": 1, "createdAt": -1 },
        doc! { "appId": 1, "tag": 1, "updatedAt": -1 },
        doc! { "appId": 1, "tag": 1, "deletedAt": 1 },
        doc! { "appId": 1, "createdBy": 1 },
        doc! { "appId": 1, "updatedBy": 1 },
        // Indexing workers poll for objects changed since their last pass.
        doc! { "shouldIndex": 1, "updatedAt": 1 },
        doc! { "deletedAt": 1 },
    ]
    .into_iter()
    .map(|keys| IndexModel::builder().keys(keys).build())
    .collect()
}

fn count(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// MongoDB-backed object storage.
///
/// Every object lives in one collection; the object id is the `_id`.
///
/// # Cloning
///
/// Clones share the driver's connection pool.
///
/// # Transactions
///
/// [`with_transaction`](TransactionalStorage::with_transaction) starts a
/// client session and hands the closure a handle bound to it. Commits that
/// hit a write conflict surface as
/// [`TransactionAborted`](StorageError::TransactionAborted).
///
/// `create`, `update` and `write_upsert_batch` read before they write, so
/// each runs in its own transaction unless the handle already has one. The
/// deployment must be a replica set or a sharded cluster.
#[derive(Clone)]
pub struct MongoObjStorage {
    client: Client,
    collection: Collection<Document>,
    config: MongoConfig,
    session: Option<Arc<Mutex<ClientSession>>>,
}

impl fmt::Debug for MongoObjStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoObjStorage")
            .field("database", &self.config.database())
            .field("collection", &self.config.collection())
            .field("in_transaction", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl MongoObjStorage {
    /// Connects to the deployment and makes sure the collection's indexes
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns [`Validation`](StorageError::Validation) for a bad
    /// configuration, or a driver error mapped to [`StorageError`].
    pub async fn connect(config: MongoConfig) -> StorageResult<Self> {
        config.validate().map_err(MongoStorageError::from)?;
        let mut options =
            ClientOptions::parse(config.uri()).await.map_err(driver_error_to_storage_error)?;
        options.connect_timeout = Some(config.connect_timeout());
        options.server_selection_timeout = Some(config.server_selection_timeout());
        if let Some(app_name) = config.app_name() {
            options.app_name = Some(app_name.to_owned());
        }
        let client = Client::with_options(options).map_err(driver_error_to_storage_error)?;

        let storage = Self::from_client(client, config);
        storage.ensure_indexes().await?;
        info!(
            database = storage.config.database(),
            collection = storage.config.collection(),
            "Connected to MongoDB"
        );
        Ok(storage)
    }

    /// Wraps an existing client. No indexes are created.
    #[must_use]
    pub fn from_client(client: Client, config: MongoConfig) -> Self {
        let collection = client.database(config.database()).collection(config.collection());
        Self { client, collection, config, session: None }
    }

    /// Returns the backend configuration.
    #[must_use]
    pub fn mongo_config(&self) -> &MongoConfig {
        &self.config
    }

    /// Creates the scope, timestamp, audit and soft-delete indexes.
    /// Existing indexes are left alone.
    ///
    /// # Errors
    ///
    /// Returns the driver error mapped to [`StorageError`].
    pub async fn ensure_indexes(&self) -> StorageResult<()> {
        self.collection
            .create_indexes(index_models())
            .await
            .map_err(driver_error_to_storage_error)?;
        Ok(())
    }

    async fn find(&self, filter: Document, options: FindOptions) -> StorageResult<Vec<Obj>> {
        let docs: Vec<Document> = match &self.session {
            Some(session) => {
                let mut session = session.lock().await;
                let mut cursor = self
                    .collection
                    .find(filter)
                    .with_options(options)
                    .session(&mut *session)
                    .await
                    .map_err(driver_error_to_storage_error)?;
                cursor.stream(&mut session).try_collect().await
            },
            None => {
                let cursor = self
                    .collection
                    .find(filter)
                    .with_options(options)
                    .await
                    .map_err(driver_error_to_storage_error)?;
                cursor.try_collect().await
            },
        }
        .map_err(driver_error_to_storage_error)?;

        docs.into_iter().map(|d| document_to_obj(d).map_err(StorageError::from)).collect()
    }

    async fn insert(&self, objs: &[Obj]) -> StorageResult<()> {
        if objs.is_empty() {
            return Ok(());
        }
        let docs: Vec<Document> = objs.iter().map(obj_to_document).collect();
        with_session!(self, self.collection.insert_many(docs).ordered(true))?;
        Ok(())
    }

    /// Merges `params.update` into every live object `filter` matches.
    async fn merge_matches(
        &self,
        filter: &ObjFilter,
        params: &UpdateParams,
    ) -> StorageResult<UpdateResult> {
        let options = FindOptions::builder().sort(doc! { ID: 1 }).build();
        let matches = self.find(compile_filter(filter), options).await?;

        let now = to_bson_datetime(obj::now());
        let mut updated_count = 0;
        for existing in matches {
            let merged = merge_records(&existing.obj_record, &params.update, params.update_way);
            let change = doc! {
                "$set": {
                    RECORD: record_to_document(&merged),
                    "updatedAt": now,
                    "updatedBy": params.by.as_str(),
                    "updatedByType": params.by_type.as_str(),
                }
            };
            let target = doc! { ID: existing.id.as_str(), "deletedAt": Bson::Null };
            let result = with_session!(self, self.collection.update_one(target, change))?;
            updated_count += count(result.matched_count);
        }
        Ok(UpdateResult { updated_count })
    }

    /// Runs `f` on a handle bound to a new transaction and commits when it
    /// succeeds. A handle that is already inside a transaction runs `f` on
    /// itself, joining it.
    async fn in_transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send,
        F: for<'tx> FnOnce(&'tx Self) -> BoxFuture<'tx, StorageResult<T>> + Send,
    {
        if self.session.is_some() {
            return f(self).await;
        }

        let mut session =
            self.client.start_session().await.map_err(driver_error_to_storage_error)?;
        session.start_transaction().await.map_err(|e| {
            StorageError::transaction_aborted_with_source("failed to start transaction", e)
        })?;
        let session = Arc::new(Mutex::new(session));
        let handle = Self { session: Some(Arc::clone(&session)), ..self.clone() };

        let outcome = f(&handle).await;
        let mut session = session.lock().await;
        match outcome {
            Ok(value) => {
                session.commit_transaction().await.map_err(|e| {
                    warn!(error = %e, "Transaction commit failed");
                    StorageError::transaction_aborted_with_source("commit failed", e)
                })?;
                debug!("Transaction committed");
                Ok(value)
            },
            Err(err) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    warn!(error = %abort_err, "Failed to abort transaction");
                }
                debug!(error = %err, "Transaction body failed, aborted");
                Err(err)
            },
        }
    }
}

#[async_trait]
impl ObjStorage for MongoObjStorage {
    fn config(&self) -> &StorageConfig {
        self.config.storage()
    }

    #[tracing::instrument(skip_all, fields(count = objs.len()))]
    async fn create(&self, objs: Vec<Obj>) -> StorageResult<Vec<Obj>> {
        if objs.is_empty() {
            return Ok(objs);
        }
        let mut incoming = std::collections::HashSet::new();
        if let Some(dup) = objs.iter().find(|o| !incoming.insert(o.id.as_str())) {
            return Err(StorageError::conflict(format!("object {} already exists", dup.id)));
        }
        self.in_transaction(move |tx| {
            Box::pin(async move {
                let ids: Vec<&str> = objs.iter().map(|o| o.id.as_str()).collect();
                let existing =
                    with_session!(tx, tx.collection.count_documents(doc! { ID: { "$in": ids } }))?;
                if existing > 0 {
                    return Err(StorageError::conflict(format!(
                        "{existing} object ids already exist"
                    )));
                }
                tx.insert(&objs).await?;
                Ok(objs)
            })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn read(&self, params: ReadParams) -> StorageResult<ReadResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, params.lifecycle, &params.fields)?
                .after(params.after_id.as_deref());
        let keys = resolve_sort(&params.sort, &params.fields);
        let limit = params.limit.unwrap_or(self.config().default_limit());
        let offset = match params.after_id {
            Some(_) => 0,
            None => params.page.unwrap_or(0).saturating_mul(limit),
        };

        // One extra document tells whether another page exists.
        let options = FindOptions::builder()
            .sort(compile_sort(&keys))
            .skip(u64::try_from(offset).unwrap_or(u64::MAX))
            .limit(i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX))
            .build();

        let mut objs = self.find(compile_filter(&filter), options).await?;
        let has_more = objs.len() > limit;
        objs.truncate(limit);
        Ok(ReadResult { objs, has_more })
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn update(&self, params: UpdateParams) -> StorageResult<UpdateResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, Lifecycle::Live, &params.fields)?;
        self.in_transaction(move |tx| {
            Box::pin(async move { tx.merge_matches(&filter, &params).await })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn delete(&self, params: DeleteParams) -> StorageResult<DeleteResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, Lifecycle::Live, &params.fields)?;
        let change = doc! {
            "$set": {
                "deletedAt": to_bson_datetime(obj::now()),
                "deletedBy": params.deleted_by.as_str(),
                "deletedByType": params.deleted_by_type.as_str(),
            }
        };
        let result =
            with_session!(self, self.collection.update_many(compile_filter(&filter), change))?;
        Ok(DeleteResult { deleted_count: count(result.modified_count) })
    }

    #[tracing::instrument(skip_all)]
    async fn cleanup_deleted_objs(&self) -> StorageResult<CleanupResult> {
        let cutoff = obj::retention_cutoff(self.config().cleanup_retention());
        let expired = doc! { "deletedAt": { "$lte": to_bson_datetime(cutoff) } };
        let result = with_session!(self, self.collection.delete_many(expired))?;
        let cleaned_count = count(result.deleted_count);
        debug!(cleaned_count, "Purged soft-deleted objects");
        Ok(CleanupResult { cleaned_count })
    }

    async fn health_check(&self) -> StorageResult<HealthReport> {
        let start = Instant::now();
        self.client
            .database(self.config.database())
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StorageError::backend_unavailable_with_source("MongoDB ping failed", e))?;
        Ok(HealthReport::new("mongo", start.elapsed())
            .with_detail("database", self.config.database())
            .with_detail("collection", self.config.collection()))
    }

    #[tracing::instrument(skip_all, fields(tag = %scope.tag, count = identities.len()))]
    async fn find_by_identity(
        &self,
        scope: &UpsertScope,
        keys: &[String],
        identities: &[Identity],
    ) -> StorageResult<Vec<Obj>> {
        if identities.is_empty() || keys.is_empty() {
            return Ok(Vec::new());
        }
        let any_identity: Vec<Bson> = identities
            .iter()
            .map(|identity| {
                let all_keys: Vec<Bson> = keys
                    .iter()
                    .zip(identity.values())
                    .map(|(key, value)| {
                        Bson::Document(
                            doc! { format!("{RECORD}.{key}"): { "$eq": value_to_bson(value) } },
                        )
                    })
                    .collect();
                Bson::Document(doc! { "$and": all_keys })
            })
            .collect();
        let filter = doc! {
            "appId": scope.app_id.as_str(),
            "groupId": scope.group_id.as_str(),
            "tag": scope.tag.as_str(),
            "deletedAt": Bson::Null,
            "$or": any_identity,
        };
        let options = FindOptions::builder().sort(doc! { "createdAt": 1, ID: 1 }).build();
        self.find(filter, options).await
    }

    #[tracing::instrument(
        skip_all,
        fields(inserts = batch.inserts.len(), replacements = batch.replacements.len())
    )]
    async fn write_upsert_batch(&self, batch: UpsertBatch) -> StorageResult<()> {
        self.in_transaction(move |tx| {
            Box::pin(async move {
                tx.insert(&batch.inserts).await?;
                for obj in &batch.replacements {
                    let target = doc! { ID: obj.id.as_str() };
                    let replacement = obj_to_document(obj);
                    let result =
                        with_session!(tx, tx.collection.replace_one(target, replacement))?;
                    if result.matched_count == 0 {
                        return Err(StorageError::not_found(format!("object {}", obj.id)));
                    }
                }
                Ok(())
            })
        })
        .await
    }
}

#[async_trait]
impl TransactionalStorage for MongoObjStorage {
    #[tracing::instrument(skip_all)]
    async fn with_transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send,
        F: for<'tx> FnOnce(&'tx dyn ObjStorage) -> BoxFuture<'tx, StorageResult<T>> + Send,
    {
        self.in_transaction(|handle| f(handle)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn indexed_fields() -> Vec<String> {
        index_models().iter().flat_map(|m| m.keys.keys().cloned().collect::<Vec<_>>()).collect()
    }

    #[test]
    fn indexes_cover_timestamps_audit_and_indexing_flag() {
        let fields = indexed_fields();
        let wanted =
            ["createdAt", "updatedAt", "deletedAt", "createdBy", "updatedBy", "shouldIndex"];
        for field in wanted {
            assert!(fields.iter().any(|f| f == field), "{field} is not indexed");
        }
    }

    #[test]
    fn index_keys_are_distinct() {
        let models = index_models();
        let keys: std::collections::HashSet<String> =
            models.iter().map(|m| m.keys.to_string()).collect();
        assert_eq!(keys.len(), models.len());
    }
}
