//! In-memory object storage.
//!
//! This module provides [`MemoryObjStorage`], an implementation of
//! [`ObjStorage`] that keeps every object in a [`BTreeMap`] keyed by id. It
//! evaluates queries with [`ObjFilter::matches`], so it doubles as the
//! reference semantics the database backends are tested against.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`]; the lock is never held across an await
//! - **Snapshot transactions**: a transaction works on a private copy and commits optimistically
//! - **Conflict detection**: commit aborts if another writer touched the same objects
//!
//! # Example
//!
//! ```
//! use fimidx_storage::{MemoryObjStorage, Obj, ObjQuery, ObjRecord, ObjStorage, ReadParams};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let storage = MemoryObjStorage::new();
//! let obj = Obj::builder()
//!     .app_id("app")
//!     .group_id("group")
//!     .tag("member")
//!     .obj_record(ObjRecord::new())
//!     .created_by("user-1")
//!     .created_by_type("user")
//!     .build();
//! storage.create(vec![obj]).await.unwrap();
//!
//! let page = storage
//!     .read(ReadParams::builder().query(ObjQuery::for_app("app")).tag("member").build())
//!     .await
//!     .unwrap();
//! assert_eq!(page.objs.len(), 1);
//! # });
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - Reads scan every object
//! - A transaction copies the whole store when it starts

use std::{cmp::Ordering, collections::BTreeMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use fail::fail_point;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    backend::{
        CleanupResult, DeleteParams, DeleteResult, ObjStorage, ReadParams, ReadResult,
        TransactionalStorage, UpdateParams, UpdateResult,
    },
    bulk::{Identity, UpsertBatch, UpsertScope},
    config::StorageConfig,
    error::{StorageError, StorageResult},
    health::HealthReport,
    merge::merge_records,
    obj::{self, Obj},
    plan::{Lifecycle, ObjFilter, meta_value_of},
    sort::{SortDirection, SortKey, SortTarget, resolve_sort},
    value::{Value, get_path},
};

#[derive(Debug, Clone)]
struct Entry {
    obj: Obj,
    version: u64,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    objs: BTreeMap<String, Entry>,
    next_version: u64,
}

impl MemoryState {
    fn put(&mut self, obj: Obj) {
        self.next_version += 1;
        let version = self.next_version;
        self.objs.insert(obj.id.clone(), Entry { obj, version });
    }

    fn version_of(&self, id: &str) -> Option<u64> {
        self.objs.get(id).map(|e| e.version)
    }
}

/// In-memory object storage.
///
/// # Cloning
///
/// `MemoryObjStorage` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying objects.
#[derive(Debug, Clone)]
pub struct MemoryObjStorage {
    state: Arc<RwLock<MemoryState>>,
    config: StorageConfig,
}

impl MemoryObjStorage {
    /// Creates an empty store with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    /// Creates an empty store with the given settings.
    #[must_use]
    pub fn with_config(config: StorageConfig) -> Self {
        Self { state: Arc::new(RwLock::new(MemoryState::default())), config }
    }

    /// Number of stored objects, soft-deleted ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().objs.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().objs.is_empty()
    }

    fn matching(&self, filter: &ObjFilter) -> Vec<Obj> {
        self.state
            .read()
            .objs
            .values()
            .filter(|e| filter.matches(&e.obj))
            .map(|e| e.obj.clone())
            .collect()
    }

    /// Applies a committed transaction's changes if nothing it touched moved.
    fn commit(&self, base: &MemoryState, staged: MemoryState) -> StorageResult<usize> {
        let mut live = self.state.write();

        let touched: Vec<&String> = staged
            .objs
            .iter()
            .filter(|(id, e)| base.version_of(id) != Some(e.version))
            .map(|(id, _)| id)
            .chain(base.objs.keys().filter(|id| !staged.objs.contains_key(*id)))
            .collect();

        if let Some(id) = touched.iter().find(|id| live.version_of(id) != base.version_of(id)) {
            return Err(StorageError::transaction_aborted(format!(
                "object {id} was modified concurrently"
            )));
        }

        for id in &touched {
            match staged.objs.get(*id) {
                Some(entry) => live.put(entry.obj.clone()),
                None => {
                    live.objs.remove(*id);
                },
            }
        }
        Ok(touched.len())
    }
}

impl Default for MemoryObjStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn compare_objs(a: &Obj, b: &Obj, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ordering = match &key.target {
            SortTarget::Envelope(field) => {
                meta_value_of(a, *field).cmp(&meta_value_of(b, *field))
            },
            SortTarget::Record { path } => {
                Value::sort_cmp(get_path(&a.obj_record, path), get_path(&b.obj_record, path))
            },
        };
        let ordering = match key.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl ObjStorage for MemoryObjStorage {
    fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[tracing::instrument(skip_all, fields(count = objs.len()))]
    async fn create(&self, objs: Vec<Obj>) -> StorageResult<Vec<Obj>> {
        let mut state = self.state.write();
        let mut incoming = std::collections::HashSet::new();
        for obj in &objs {
            if state.objs.contains_key(&obj.id) || !incoming.insert(obj.id.as_str()) {
                return Err(StorageError::conflict(format!("object {} already exists", obj.id)));
            }
        }
        for obj in &objs {
            state.put(obj.clone());
        }
        Ok(objs)
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn read(&self, params: ReadParams) -> StorageResult<ReadResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, params.lifecycle, &params.fields)?
                .after(params.after_id.as_deref());
        let keys = resolve_sort(&params.sort, &params.fields);
        let limit = params.limit.unwrap_or(self.config.default_limit());
        let offset = match params.after_id {
            Some(_) => 0,
            None => params.page.unwrap_or(0).saturating_mul(limit),
        };

        let mut objs = self.matching(&filter);
        objs.sort_by(|a, b| compare_objs(a, b, &keys));
        let has_more = objs.len() > offset.saturating_add(limit);
        let objs = objs.into_iter().skip(offset).take(limit).collect();
        Ok(ReadResult { objs, has_more })
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn update(&self, params: UpdateParams) -> StorageResult<UpdateResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, Lifecycle::Live, &params.fields)?;
        let now = obj::now();
        let mut state = self.state.write();
        let updated: Vec<Obj> = state
            .objs
            .values()
            .filter(|e| filter.matches(&e.obj))
            .map(|e| {
                let mut obj = e.obj.clone();
                obj.obj_record = merge_records(&obj.obj_record, &params.update, params.update_way);
                obj.touch(&params.by, &params.by_type, now);
                obj
            })
            .collect();
        let updated_count = updated.len();
        for obj in updated {
            state.put(obj);
        }
        Ok(UpdateResult { updated_count })
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn delete(&self, params: DeleteParams) -> StorageResult<DeleteResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, Lifecycle::Live, &params.fields)?;
        let now = obj::now();
        let mut state = self.state.write();
        let deleted: Vec<Obj> = state
            .objs
            .values()
            .filter(|e| filter.matches(&e.obj))
            .filter_map(|e| {
                let mut obj = e.obj.clone();
                obj.mark_deleted(&params.deleted_by, &params.deleted_by_type, now).then_some(obj)
            })
            .collect();
        let deleted_count = deleted.len();
        for obj in deleted {
            state.put(obj);
        }
        Ok(DeleteResult { deleted_count })
    }

    #[tracing::instrument(skip_all)]
    async fn cleanup_deleted_objs(&self) -> StorageResult<CleanupResult> {
        let cutoff = obj::retention_cutoff(self.config.cleanup_retention());
        let mut state = self.state.write();
        let before = state.objs.len();
        state.objs.retain(|_, e| e.obj.deleted_at.is_none_or(|at| at > cutoff));
        let cleaned_count = before - state.objs.len();
        debug!(cleaned_count, "Purged soft-deleted objects");
        Ok(CleanupResult { cleaned_count })
    }

    async fn health_check(&self) -> StorageResult<HealthReport> {
        let start = Instant::now();
        let count = self.len();
        Ok(HealthReport::new("memory", start.elapsed()).with_detail("objs", count.to_string()))
    }

    #[tracing::instrument(skip_all, fields(tag = %scope.tag, count = identities.len()))]
    async fn find_by_identity(
        &self,
        scope: &UpsertScope,
        keys: &[String],
        identities: &[Identity],
    ) -> StorageResult<Vec<Obj>> {
        let wanted: std::collections::HashSet<&Identity> = identities.iter().collect();
        let mut found: Vec<Obj> = self
            .state
            .read()
            .objs
            .values()
            .map(|e| &e.obj)
            .filter(|o| {
                !o.is_deleted()
                    && o.app_id == scope.app_id
                    && o.group_id == scope.group_id
                    && o.tag == scope.tag
                    && Identity::of(&o.obj_record, keys).is_some_and(|id| wanted.contains(&id))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    #[tracing::instrument(
        skip_all,
        fields(inserts = batch.inserts.len(), replacements = batch.replacements.len())
    )]
    async fn write_upsert_batch(&self, batch: UpsertBatch) -> StorageResult<()> {
        let mut state = self.state.write();
        if let Some(dup) = batch.inserts.iter().find(|o| state.objs.contains_key(&o.id)) {
            return Err(StorageError::conflict(format!("object {} already exists", dup.id)));
        }
        for obj in batch.inserts {
            state.put(obj);
        }
        for obj in batch.replacements {
            if !state.objs.contains_key(&obj.id) {
                return Err(StorageError::not_found(format!("object {}", obj.id)));
            }
            state.put(obj);
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalStorage for MemoryObjStorage {
    #[tracing::instrument(skip_all)]
    async fn with_transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send,
        F: for<'tx> FnOnce(&'tx dyn ObjStorage) -> BoxFuture<'tx, StorageResult<T>> + Send,
    {
        let base = self.state.read().clone();
        let snapshot = Self {
            state: Arc::new(RwLock::new(base.clone())),
            config: self.config.clone(),
        };

        let value = match f(&snapshot).await {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "Transaction body failed, discarding snapshot");
                return Err(err);
            },
        };

        fail_point!("memory-before-commit", |_| {
            Err(StorageError::transaction_aborted("injected failure before commit"))
        });

        let staged = snapshot.state.read().clone();
        match self.commit(&base, staged) {
            Ok(touched) => {
                debug!(touched, "Transaction committed");
                Ok(value)
            },
            Err(err) => {
                warn!(error = %err, "Transaction commit aborted");
                Err(err)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        backend::BulkUpsertParams,
        query::{ObjQuery, PartQuery, Predicate},
        sort::SortField,
        value::{ObjRecord, record_from_json},
    };

    fn rec(json: serde_json::Value) -> ObjRecord {
        record_from_json(json).expect("record")
    }

    fn obj(record: serde_json::Value) -> Obj {
        Obj::builder()
            .app_id("app")
            .group_id("g")
            .tag("member")
            .obj_record(rec(record))
            .created_by("u1")
            .created_by_type("user")
            .build()
    }

    fn read_all(query: ObjQuery) -> ReadParams {
        ReadParams::builder().query(query).tag("member").build()
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids_atomically() {
        let storage = MemoryObjStorage::new();
        let first = obj(json!({"n": 1}));
        storage.create(vec![first.clone()]).await.expect("create");

        let fresh = obj(json!({"n": 2}));
        let err = storage.create(vec![fresh, first]).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn read_pages_with_has_more() {
        let storage = MemoryObjStorage::new();
        storage
            .create((0..5).map(|i| obj(json!({"n": i}))).collect())
            .await
            .expect("create");
        let mut params = read_all(ObjQuery::for_app("app"));
        params.limit = Some(2);
        params.page = Some(2);
        let last = storage.read(params.clone()).await.expect("read");
        assert_eq!(last.objs.len(), 1);
        assert!(!last.has_more);
        params.page = Some(0);
        assert!(storage.read(params).await.expect("read").has_more);
    }

    #[tokio::test]
    async fn read_sorts_by_envelope_and_breaks_ties_by_id() {
        let storage = MemoryObjStorage::new();
        let objs: Vec<Obj> = (0..4).map(|i| obj(json!({"n": i}))).collect();
        storage.create(objs.clone()).await.expect("create");

        let mut params = read_all(ObjQuery::for_app("app"));
        params.sort = vec![SortField::asc("createdBy")];
        let page = storage.read(params).await.expect("read");
        let ids: Vec<_> = page.objs.iter().map(|o| o.id.clone()).collect();
        let mut expected: Vec<_> = objs.iter().map(|o| o.id.clone()).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn update_touches_only_live_matches() {
        let storage = MemoryObjStorage::new();
        let keep = obj(json!({"status": "a"}));
        let change = obj(json!({"status": "b", "extra": 1}));
        storage.create(vec![keep.clone(), change.clone()]).await.expect("create");

        let result = storage
            .update(
                UpdateParams::builder()
                    .query(
                        ObjQuery::builder()
                            .app_id("app")
                            .part_query(PartQuery::all([Predicate::eq("status", "b")]))
                            .build(),
                    )
                    .tag("member")
                    .update(rec(json!({"status": "c"})))
                    .by("u2")
                    .by_type("user")
                    .build(),
            )
            .await
            .expect("update");
        assert_eq!(result.updated_count, 1);

        let page = storage.read(read_all(ObjQuery::for_app("app"))).await.expect("read");
        let changed = page.objs.iter().find(|o| o.id == change.id).expect("changed");
        assert_eq!(changed.obj_record, rec(json!({"status": "c", "extra": 1})));
        assert_eq!(changed.updated_by, "u2");
        assert_eq!(changed.created_at, change.created_at);
    }

    #[tokio::test]
    async fn transaction_commit_conflicts_with_concurrent_writer() {
        let storage = MemoryObjStorage::new();
        let target = obj(json!({"n": 1}));
        storage.create(vec![target.clone()]).await.expect("create");

        let outer = storage.clone();
        let err = storage
            .with_transaction(move |tx| {
                Box::pin(async move {
                    tx.update(
                        UpdateParams::builder()
                            .query(ObjQuery::for_app("app"))
                            .tag("member")
                            .update(rec(json!({"n": 2})))
                            .by("tx")
                            .by_type("user")
                            .build(),
                    )
                    .await?;
                    outer
                        .update(
                            UpdateParams::builder()
                                .query(ObjQuery::for_app("app"))
                                .tag("member")
                                .update(rec(json!({"n": 3})))
                                .by("outside")
                                .by_type("user")
                                .build(),
                        )
                        .await?;
                    Ok::<_, StorageError>(())
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TransactionAborted { .. }));

        let page = storage.read(read_all(ObjQuery::for_app("app"))).await.expect("read");
        assert_eq!(page.objs[0].obj_record, rec(json!({"n": 3})));
    }

    #[tokio::test]
    async fn cleanup_purges_only_deleted() {
        let storage = MemoryObjStorage::new();
        storage
            .create(vec![obj(json!({"n": 1})), obj(json!({"n": 2}))])
            .await
            .expect("create");
        storage
            .delete(
                DeleteParams::builder()
                    .query(
                        ObjQuery::builder()
                            .app_id("app")
                            .part_query(PartQuery::all([Predicate::eq("n", 1_i64)]))
                            .build(),
                    )
                    .tag("member")
                    .deleted_by("u1")
                    .deleted_by_type("user")
                    .build(),
            )
            .await
            .expect("delete");
        let cleaned = storage.cleanup_deleted_objs().await.expect("cleanup");
        assert_eq!(cleaned.cleaned_count, 1);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn find_by_identity_returns_oldest_first() {
        let storage = MemoryObjStorage::new();
        let t0 = obj::now();
        let older = Obj::builder()
            .app_id("app")
            .group_id("g")
            .tag("member")
            .obj_record(rec(json!({"email": "a@x.io"})))
            .created_by("u1")
            .created_by_type("user")
            .now(t0 - chrono::TimeDelta::seconds(10))
            .build();
        let newer = Obj { id: obj::new_id(), created_at: t0, ..older.clone() };
        storage.create(vec![newer.clone(), older.clone()]).await.expect("create");

        let keys = vec!["email".to_owned()];
        let identity = Identity::of(&older.obj_record, &keys).expect("identity");
        let scope =
            UpsertScope { app_id: "app".into(), group_id: "g".into(), tag: "member".into() };
        let found = storage.find_by_identity(&scope, &keys, &[identity]).await.expect("find");
        assert_eq!(
            found.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            vec![older.id.as_str(), newer.id.as_str()]
        );
    }

    #[tokio::test]
    async fn health_check_reports_object_count() {
        let storage = MemoryObjStorage::new();
        storage
            .bulk_upsert(
                BulkUpsertParams::builder()
                    .items(vec![rec(json!({"n": 1}))])
                    .tag("member")
                    .app_id("app")
                    .group_id("g")
                    .created_by("u1")
                    .created_by_type("user")
                    .build(),
            )
            .await
            .expect("upsert");
        let report = storage.health_check().await.expect("healthy");
        assert_eq!(report.backend, "memory");
        assert_eq!(report.details.get("objs").map(String::as_str), Some("1"));
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;
        use crate::backend::{BulkUpdateParams, OnConflict};

        fn arb_on_conflict() -> impl Strategy<Value = OnConflict> {
            prop_oneof![Just(OnConflict::Fail), Just(OnConflict::Ignore), Just(OnConflict::Replace)]
        }

        async fn upsert_outcome(
            keys: &[u8],
            on_conflict: OnConflict,
            batch_size: usize,
        ) -> (usize, usize, Vec<ObjRecord>, Vec<ObjRecord>, Vec<String>) {
            let storage = MemoryObjStorage::new();
            let items =
                keys.iter().enumerate().map(|(seq, key)| rec(json!({"key": key, "seq": seq})));
            let result = storage
                .bulk_upsert(
                    BulkUpsertParams::builder()
                        .items(items.collect())
                        .conflict_on_keys(vec!["key".into()])
                        .on_conflict(on_conflict)
                        .tag("member")
                        .app_id("app")
                        .group_id("g")
                        .created_by("u1")
                        .created_by_type("user")
                        .batch_size(batch_size)
                        .build(),
                )
                .await
                .expect("upsert");
            let mut params = read_all(ObjQuery::for_app("app"));
            params.limit = Some(1000);
            let mut stored: Vec<String> = storage
                .read(params)
                .await
                .expect("read")
                .objs
                .iter()
                .map(|o| crate::value::record_to_json(&o.obj_record).to_string())
                .collect();
            stored.sort();
            (
                result.new_objs.len(),
                result.updated_objs.len(),
                result.ignored_items,
                result.failed_items.into_iter().map(|f| f.item).collect(),
                stored,
            )
        }

        proptest! {
            /// Bulk upsert produces the same outcome whatever the batch size.
            #[test]
            fn bulk_upsert_is_batch_size_invariant(
                keys in proptest::collection::vec(0u8..6, 0..25),
                on_conflict in arb_on_conflict(),
                batch_size in 1usize..8,
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                let (chunked, whole) = rt.block_on(async {
                    let chunked = upsert_outcome(&keys, on_conflict, batch_size).await;
                    let whole = upsert_outcome(&keys, on_conflict, keys.len().max(1)).await;
                    (chunked, whole)
                });
                prop_assert_eq!(chunked, whole);
            }

            /// Bulk update reaches every live match exactly once.
            #[test]
            fn bulk_update_counts_every_match_once(
                flags in proptest::collection::vec(any::<bool>(), 0..30),
                batch_size in 1usize..8,
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                let expected = flags.iter().filter(|f| **f).count();
                let updated = rt.block_on(async {
                    let storage = MemoryObjStorage::new();
                    storage
                        .create(flags.iter().map(|f| obj(json!({"hit": f}))).collect())
                        .await
                        .expect("create");
                    storage
                        .bulk_update(
                            BulkUpdateParams::builder()
                                .query(
                                    ObjQuery::builder()
                                        .app_id("app")
                                        .part_query(PartQuery::all([Predicate::eq("hit", true)]))
                                        .build(),
                                )
                                .tag("member")
                                .update(rec(json!({"hit": false, "done": true})))
                                .by("bulk")
                                .by_type("system")
                                .batch_size(batch_size)
                                .build(),
                        )
                        .await
                        .expect("bulk update")
                        .updated_count
                });
                prop_assert_eq!(updated, expected);
            }
        }
    }
}
