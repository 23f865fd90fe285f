//! The object storage contract.
//!
//! [`ObjStorage`] is the one interface every backend implements. Callers
//! build an [`ObjQuery`], pick a tag and invoke it; the backend consults the
//! [`FieldIndex`] they pass along to translate paths into native filters.
//!
//! Bulk writes (`bulk_upsert`, `bulk_update`, `bulk_delete`) are provided
//! methods. They run the shared pipeline in [`bulk`](crate::bulk) on top of
//! the plain operations plus two backend primitives,
//! [`find_by_identity`](ObjStorage::find_by_identity) and
//! [`write_upsert_batch`](ObjStorage::write_upsert_batch), so every backend
//! resolves conflicts and merges the same way.
//!
//! # Implementing a Backend
//!
//! 1. Implement [`ObjStorage`], compiling [`ObjFilter`](crate::plan::ObjFilter)
//!    into native filters
//! 2. Implement [`TransactionalStorage`] with a handle that is itself an
//!    [`ObjStorage`]
//! 3. Map driver errors to [`StorageError`](crate::StorageError)
//! 4. Run the [`conformance`](crate::conformance) suite against it
//!
//! See [`MemoryObjStorage`](crate::MemoryObjStorage) for the reference
//! implementation.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    bulk::{self, Identity, UpsertBatch, UpsertScope},
    config::StorageConfig,
    error::StorageResult,
    field::FieldIndex,
    health::HealthReport,
    merge::UpdateWay,
    obj::Obj,
    plan::Lifecycle,
    query::ObjQuery,
    sort::SortField,
    value::ObjRecord,
};

/// Parameters of [`ObjStorage::read`].
#[derive(Debug, Clone, bon::Builder)]
pub struct ReadParams {
    /// What to match.
    pub query: ObjQuery,
    /// Entity tag.
    #[builder(into)]
    pub tag: String,
    /// 0-based page index. Ignored when `after_id` is set.
    pub page: Option<usize>,
    /// Page size. Defaults to [`StorageConfig::default_limit`].
    pub limit: Option<usize>,
    /// Sort entries, resolved through [`resolve_sort`](crate::sort::resolve_sort).
    #[builder(default)]
    pub sort: Vec<SortField>,
    /// Field index used for translation.
    #[builder(default)]
    pub fields: FieldIndex,
    /// Which soft-delete states to return.
    #[builder(default)]
    pub lifecycle: Lifecycle,
    /// Keyset cursor: only objects with an id greater than this one.
    #[builder(into)]
    pub after_id: Option<String>,
}

/// Outcome of [`ObjStorage::read`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    /// The requested page.
    pub objs: Vec<Obj>,
    /// Whether more matches exist past this page.
    pub has_more: bool,
}

/// Parameters of [`ObjStorage::update`].
#[derive(Debug, Clone, bon::Builder)]
pub struct UpdateParams {
    /// What to match. Only live objects are updated.
    pub query: ObjQuery,
    /// Entity tag.
    #[builder(into)]
    pub tag: String,
    /// Payload applied to every match.
    pub update: ObjRecord,
    /// Updating actor.
    #[builder(into)]
    pub by: String,
    /// Kind of updating actor.
    #[builder(into)]
    pub by_type: String,
    /// Merge strategy.
    #[builder(default)]
    pub update_way: UpdateWay,
    /// Field index used for translation.
    #[builder(default)]
    pub fields: FieldIndex,
}

/// Outcome of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    /// Number of objects changed.
    pub updated_count: usize,
}

/// Parameters of [`ObjStorage::delete`].
#[derive(Debug, Clone, bon::Builder)]
pub struct DeleteParams {
    /// What to match. Only live objects are deleted.
    pub query: ObjQuery,
    /// Entity tag.
    #[builder(into)]
    pub tag: String,
    /// Deleting actor.
    #[builder(into)]
    pub deleted_by: String,
    /// Kind of deleting actor.
    #[builder(into)]
    pub deleted_by_type: String,
    /// Field index used for translation.
    #[builder(default)]
    pub fields: FieldIndex,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    /// Number of objects soft-deleted.
    pub deleted_count: usize,
}

/// Outcome of [`ObjStorage::cleanup_deleted_objs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    /// Number of objects physically removed.
    pub cleaned_count: usize,
}

/// What a bulk upsert does with an item whose identity already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    /// Report the item in `failed_items` and keep going.
    #[default]
    Fail,
    /// Report the item in `ignored_items`.
    Ignore,
    /// Replace the record of the oldest match.
    Replace,
}

/// Parameters of [`ObjStorage::bulk_upsert`].
#[derive(Debug, Clone, bon::Builder)]
pub struct BulkUpsertParams {
    /// Records to write.
    pub items: Vec<ObjRecord>,
    /// Record paths forming an item's identity. Empty means always insert.
    #[builder(default)]
    pub conflict_on_keys: Vec<String>,
    /// Conflict strategy.
    #[builder(default)]
    pub on_conflict: OnConflict,
    /// Entity tag.
    #[builder(into)]
    pub tag: String,
    /// Tenant scope.
    #[builder(into)]
    pub app_id: String,
    /// Sub-tenant scope.
    #[builder(into)]
    pub group_id: String,
    /// Creating (or replacing) actor.
    #[builder(into)]
    pub created_by: String,
    /// Kind of creating actor.
    #[builder(into)]
    pub created_by_type: String,
    /// Reindex flag of new objects.
    #[builder(default = true)]
    pub should_index: bool,
    /// Index allow-list of new objects.
    pub fields_to_index: Option<Vec<String>>,
    /// Chunk size. Defaults to [`StorageConfig::batch_size`].
    pub batch_size: Option<usize>,
}

/// An item a bulk upsert refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    /// The rejected record.
    pub item: ObjRecord,
    /// Why it was rejected.
    pub reason: String,
}

/// Outcome of [`ObjStorage::bulk_upsert`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpsertResult {
    /// Objects inserted.
    pub new_objs: Vec<Obj>,
    /// Objects whose record was replaced.
    pub updated_objs: Vec<Obj>,
    /// Items skipped under [`OnConflict::Ignore`].
    pub ignored_items: Vec<ObjRecord>,
    /// Items refused under [`OnConflict::Fail`].
    pub failed_items: Vec<FailedItem>,
}

/// Parameters of [`ObjStorage::bulk_update`].
#[derive(Debug, Clone, bon::Builder)]
pub struct BulkUpdateParams {
    /// What to match.
    pub query: ObjQuery,
    /// Entity tag.
    #[builder(into)]
    pub tag: String,
    /// Payload applied to every match.
    pub update: ObjRecord,
    /// Updating actor.
    #[builder(into)]
    pub by: String,
    /// Kind of updating actor.
    #[builder(into)]
    pub by_type: String,
    /// Merge strategy.
    #[builder(default)]
    pub update_way: UpdateWay,
    /// Chunk size. Defaults to [`StorageConfig::batch_size`].
    pub batch_size: Option<usize>,
    /// Field index used for translation.
    #[builder(default)]
    pub fields: FieldIndex,
}

/// Parameters of [`ObjStorage::bulk_delete`].
#[derive(Debug, Clone, bon::Builder)]
pub struct BulkDeleteParams {
    /// What to match.
    pub query: ObjQuery,
    /// Entity tag.
    #[builder(into)]
    pub tag: String,
    /// Deleting actor.
    #[builder(into)]
    pub deleted_by: String,
    /// Kind of deleting actor.
    #[builder(into)]
    pub deleted_by_type: String,
    /// Chunk size. Defaults to [`StorageConfig::batch_size`].
    pub batch_size: Option<usize>,
    /// When `false`, only the first chunk is deleted.
    #[builder(default = true)]
    pub delete_many: bool,
    /// Field index used for translation.
    #[builder(default)]
    pub fields: FieldIndex,
}

/// Multi-tenant, schema-less object storage.
///
/// Implementations must be thread-safe and must not serialize unrelated
/// operations behind an in-process lock.
///
/// # Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`create`](ObjStorage::create) | Insert envelopes |
/// | [`read`](ObjStorage::read) | Filtered, sorted, paged read |
/// | [`update`](ObjStorage::update) | Merge a payload into every live match |
/// | [`delete`](ObjStorage::delete) | Soft-delete every live match |
/// | [`bulk_upsert`](ObjStorage::bulk_upsert) | Chunked insert with conflict resolution |
/// | [`bulk_update`](ObjStorage::bulk_update) | Chunked update |
/// | [`bulk_delete`](ObjStorage::bulk_delete) | Chunked soft-delete |
/// | [`cleanup_deleted_objs`](ObjStorage::cleanup_deleted_objs) | Purge old soft-deleted objects |
/// | [`health_check`](ObjStorage::health_check) | Verify backend availability |
#[async_trait]
pub trait ObjStorage: Send + Sync {
    /// Returns the shared storage settings.
    fn config(&self) -> &StorageConfig;

    /// Inserts fully formed envelopes and returns them as stored.
    ///
    /// # Errors
    ///
    /// Returns [`Conflict`](crate::StorageError::Conflict) if any id already
    /// exists. Nothing is inserted in that case.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn create(&self, objs: Vec<Obj>) -> StorageResult<Vec<Obj>>;

    /// Reads one page of matches.
    ///
    /// # Errors
    ///
    /// Returns [`Validation`](crate::StorageError::Validation) for a bad meta
    /// query operand, or a backend error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn read(&self, params: ReadParams) -> StorageResult<ReadResult>;

    /// Applies `update` to every live match.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn update(&self, params: UpdateParams) -> StorageResult<UpdateResult>;

    /// Soft-deletes every live match. Already deleted objects are untouched.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, params: DeleteParams) -> StorageResult<DeleteResult>;

    /// Physically removes objects deleted longer ago than the configured
    /// retention.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn cleanup_deleted_objs(&self) -> StorageResult<CleanupResult>;

    /// Checks that the backend answers.
    ///
    /// # Errors
    ///
    /// Returns [`BackendUnavailable`](crate::StorageError::BackendUnavailable)
    /// when it does not.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<HealthReport>;

    /// Finds live objects in `scope` whose record carries one of the
    /// `identities` at `keys`.
    ///
    /// Matches are returned oldest first (`created_at`, then `id`).
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn find_by_identity(
        &self,
        scope: &UpsertScope,
        keys: &[String],
        identities: &[Identity],
    ) -> StorageResult<Vec<Obj>>;

    /// Writes one resolved bulk-upsert chunk: inserts first, then full-object
    /// replacements by id.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn write_upsert_batch(&self, batch: UpsertBatch) -> StorageResult<()>;

    /// Inserts items, resolving identity conflicts chunk by chunk.
    ///
    /// The outcome does not depend on the batch size: items inserted by an
    /// earlier chunk of the same call conflict with later ones.
    ///
    /// # Errors
    ///
    /// Returns [`Validation`](crate::StorageError::Validation) for a zero
    /// batch size, or the first backend error. Chunks written before the
    /// error stay written.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn bulk_upsert(&self, params: BulkUpsertParams) -> StorageResult<BulkUpsertResult> {
        bulk::bulk_upsert(self, params).await
    }

    /// Updates every live match, one id-ordered chunk at a time.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn bulk_update(&self, params: BulkUpdateParams) -> StorageResult<UpdateResult> {
        bulk::bulk_update(self, params).await
    }

    /// Soft-deletes live matches, one id-ordered chunk at a time.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn bulk_delete(&self, params: BulkDeleteParams) -> StorageResult<DeleteResult> {
        bulk::bulk_delete(self, params).await
    }
}

/// Storage that can run a closure atomically.
#[async_trait]
pub trait TransactionalStorage: ObjStorage {
    /// Runs `f` against a transactional handle.
    ///
    /// Everything `f` does through the handle commits together when it
    /// returns `Ok`. An `Err` from `f` rolls everything back and is returned
    /// unchanged. Calls made on `self` while `f` runs are not part of the
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionAborted`](crate::StorageError::TransactionAborted)
    /// when the backend aborts or fails to commit.
    ///
    /// # Example
    ///
    /// ```
    /// use fimidx_storage::{
    ///     MemoryObjStorage, Obj, ObjRecord, ObjStorage, StorageError, TransactionalStorage,
    /// };
    ///
    /// # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    /// # rt.block_on(async {
    /// let storage = MemoryObjStorage::new();
    /// let obj = Obj::builder()
    ///     .app_id("app")
    ///     .group_id("group")
    ///     .tag("member")
    ///     .obj_record(ObjRecord::new())
    ///     .created_by("user-1")
    ///     .created_by_type("user")
    ///     .build();
    ///
    /// let created = storage
    ///     .with_transaction(move |tx| Box::pin(async move { tx.create(vec![obj]).await }))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(created.len(), 1);
    /// # });
    /// ```
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn with_transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send,
        F: for<'tx> FnOnce(&'tx dyn ObjStorage) -> BoxFuture<'tx, StorageResult<T>> + Send;
}
