//! The backend-agnostic bulk write pipeline.
//!
//! [`bulk_upsert`] resolves identity conflicts chunk by chunk on top of the
//! two primitives every backend provides,
//! [`find_by_identity`](ObjStorage::find_by_identity) and
//! [`write_upsert_batch`](ObjStorage::write_upsert_batch). [`bulk_update`]
//! and [`bulk_delete`] walk the matches with an [`IdChunks`] keyset cursor
//! and apply the plain operations to one chunk of ids at a time.
//!
//! Results never depend on the batch size. The upsert pipeline remembers
//! every identity it has seen during the call, so an item conflicts with one
//! inserted by an earlier chunk exactly as it would within one chunk.

use std::collections::{HashMap, HashSet};

use fail::fail_point;
use serde_json::Number;
use tracing::{debug, trace};

use crate::{
    backend::{
        BulkDeleteParams, BulkUpdateParams, BulkUpsertParams, BulkUpsertResult, DeleteParams,
        DeleteResult, FailedItem, ObjStorage, OnConflict, ReadParams, UpdateParams, UpdateResult,
    },
    error::{StorageError, StorageResult},
    field::FieldIndex,
    obj::{self, Obj},
    plan::Lifecycle,
    query::ObjQuery,
    sort::SortField,
    value::{ObjRecord, Value, get_path},
};

/// Namespace a bulk upsert writes into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpsertScope {
    /// Tenant scope.
    pub app_id: String,
    /// Sub-tenant scope.
    pub group_id: String,
    /// Entity tag.
    pub tag: String,
}

/// The values a record holds at the conflict keys, in key order.
///
/// Numbers are normalized to floats so `1` and `1.0` are the same identity,
/// matching how both databases compare them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(Vec<Value>);

impl Identity {
    /// Extracts the identity of `record`.
    ///
    /// Returns `None` when `keys` is empty or any key is missing or `null`:
    /// such items have no identity and are always inserted.
    #[must_use]
    pub fn of(record: &ObjRecord, keys: &[String]) -> Option<Self> {
        if keys.is_empty() {
            return None;
        }
        keys.iter()
            .map(|key| match get_path(record, key)? {
                Value::Null => None,
                Value::Number(n) => {
                    Some(n.as_f64().and_then(Number::from_f64).map_or(Value::Null, Value::Number))
                },
                other => Some(other.clone()),
            })
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// The key values, aligned with the conflict keys.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

/// One resolved chunk of a bulk upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertBatch {
    /// New objects, inserted first.
    pub inserts: Vec<Obj>,
    /// Full objects overwriting the stored copy with the same id, in order.
    /// The same id may appear more than once; the last write wins.
    pub replacements: Vec<Obj>,
}

impl UpsertBatch {
    /// Returns `true` if there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.replacements.is_empty()
    }
}

fn check_batch_size(batch_size: usize) -> StorageResult<usize> {
    if batch_size == 0 {
        return Err(StorageError::validation("batch_size must be at least 1, got 0"));
    }
    Ok(batch_size)
}

/// Runs a chunked bulk upsert against `storage`.
///
/// See [`ObjStorage::bulk_upsert`].
#[tracing::instrument(
    skip_all,
    fields(
        tag = %params.tag,
        app_id = %params.app_id,
        count = params.items.len(),
        batch_size = tracing::field::Empty,
    )
)]
pub async fn bulk_upsert<S: ObjStorage + ?Sized>(
    storage: &S,
    params: BulkUpsertParams,
) -> StorageResult<BulkUpsertResult> {
    let batch_size = check_batch_size(params.batch_size.unwrap_or(storage.config().batch_size()))?;
    tracing::Span::current().record("batch_size", batch_size);

    let scope = UpsertScope {
        app_id: params.app_id.clone(),
        group_id: params.group_id.clone(),
        tag: params.tag.clone(),
    };
    let keys = params.conflict_on_keys.as_slice();
    let mut known: HashMap<Identity, Obj> = HashMap::new();
    let mut result = BulkUpsertResult::default();

    for (chunk_idx, chunk) in params.items.chunks(batch_size).enumerate() {
        let identities: Vec<Option<Identity>> =
            chunk.iter().map(|item| Identity::of(item, keys)).collect();

        let mut seen = HashSet::new();
        let unknown: Vec<Identity> = identities
            .iter()
            .flatten()
            .filter(|id| !known.contains_key(*id) && seen.insert(*id))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            for existing in storage.find_by_identity(&scope, keys, &unknown).await? {
                if let Some(id) = Identity::of(&existing.obj_record, keys) {
                    known.entry(id).or_insert(existing);
                }
            }
        }

        let now = obj::now();
        let mut batch = UpsertBatch::default();
        for (item, identity) in chunk.iter().zip(identities) {
            let existing = identity.as_ref().and_then(|id| known.get_mut(id));
            let Some(existing) = existing else {
                let new_obj = Obj::builder()
                    .app_id(params.app_id.as_str())
                    .group_id(params.group_id.as_str())
                    .tag(params.tag.as_str())
                    .obj_record(item.clone())
                    .created_by(params.created_by.as_str())
                    .created_by_type(params.created_by_type.as_str())
                    .should_index(params.should_index)
                    .maybe_fields_to_index(params.fields_to_index.clone())
                    .now(now)
                    .build();
                if let Some(id) = identity {
                    known.insert(id, new_obj.clone());
                }
                batch.inserts.push(new_obj);
                continue;
            };
            match params.on_conflict {
                OnConflict::Fail => result.failed_items.push(FailedItem {
                    item: item.clone(),
                    reason: format!(
                        "an object with the same values for [{}] already exists",
                        keys.join(", ")
                    ),
                }),
                OnConflict::Ignore => result.ignored_items.push(item.clone()),
                OnConflict::Replace => {
                    existing.obj_record = item.clone();
                    existing.touch(&params.created_by, &params.created_by_type, now);
                    batch.replacements.push(existing.clone());
                },
            }
        }

        trace!(
            chunk = chunk_idx,
            inserts = batch.inserts.len(),
            replacements = batch.replacements.len(),
            "Resolved bulk upsert chunk"
        );
        if batch.is_empty() {
            continue;
        }

        fail_point!("bulk-upsert-before-write", |_| {
            Err(StorageError::internal("injected failure before bulk upsert write"))
        });
        result.new_objs.extend(batch.inserts.iter().cloned());
        result.updated_objs.extend(batch.replacements.iter().cloned());
        storage.write_upsert_batch(batch).await?;
    }

    debug!(
        new = result.new_objs.len(),
        updated = result.updated_objs.len(),
        ignored = result.ignored_items.len(),
        failed = result.failed_items.len(),
        "Bulk upsert complete"
    );
    Ok(result)
}

/// Runs a chunked bulk update against `storage`.
///
/// See [`ObjStorage::bulk_update`].
#[tracing::instrument(
    skip_all,
    fields(
        tag = %params.tag,
        app_id = %params.query.app_id,
        batch_size = tracing::field::Empty,
    )
)]
pub async fn bulk_update<S: ObjStorage + ?Sized>(
    storage: &S,
    params: BulkUpdateParams,
) -> StorageResult<UpdateResult> {
    let batch_size = check_batch_size(params.batch_size.unwrap_or(storage.config().batch_size()))?;
    tracing::Span::current().record("batch_size", batch_size);

    let mut chunks =
        IdChunks::new(params.query.clone(), params.tag.clone(), params.fields, batch_size);
    let mut updated_count = 0;
    while let Some(ids) = chunks.next_ids(storage).await? {
        fail_point!("bulk-update-chunk", |_| {
            Err(StorageError::internal("injected failure during bulk update"))
        });
        let chunk = storage
            .update(UpdateParams {
                query: params.query.scoped_to_ids(&ids),
                tag: params.tag.clone(),
                update: params.update.clone(),
                by: params.by.clone(),
                by_type: params.by_type.clone(),
                update_way: params.update_way,
                fields: FieldIndex::new(),
            })
            .await?;
        updated_count += chunk.updated_count;
    }
    debug!(updated_count, "Bulk update complete");
    Ok(UpdateResult { updated_count })
}

/// Runs a chunked bulk soft-delete against `storage`.
///
/// See [`ObjStorage::bulk_delete`].
#[tracing::instrument(
    skip_all,
    fields(
        tag = %params.tag,
        app_id = %params.query.app_id,
        batch_size = tracing::field::Empty,
    )
)]
pub async fn bulk_delete<S: ObjStorage + ?Sized>(
    storage: &S,
    params: BulkDeleteParams,
) -> StorageResult<DeleteResult> {
    let batch_size = check_batch_size(params.batch_size.unwrap_or(storage.config().batch_size()))?;
    tracing::Span::current().record("batch_size", batch_size);

    let mut chunks =
        IdChunks::new(params.query.clone(), params.tag.clone(), params.fields, batch_size);
    let mut deleted_count = 0;
    while let Some(ids) = chunks.next_ids(storage).await? {
        let chunk = storage
            .delete(DeleteParams {
                query: params.query.scoped_to_ids(&ids),
                tag: params.tag.clone(),
                deleted_by: params.deleted_by.clone(),
                deleted_by_type: params.deleted_by_type.clone(),
                fields: FieldIndex::new(),
            })
            .await?;
        deleted_count += chunk.deleted_count;
        if !params.delete_many {
            break;
        }
    }
    debug!(deleted_count, "Bulk delete complete");
    Ok(DeleteResult { deleted_count })
}

/// Restartable keyset cursor over the live matches of a query, by id.
///
/// Each step reads the next `batch_size` matches with an id greater than the
/// last one returned. Objects that stop matching after being processed are
/// never revisited, and [`cursor`](IdChunks::cursor) plus
/// [`resume`](IdChunks::resume) let an interrupted walk pick up where it
/// stopped.
#[derive(Debug, Clone)]
pub struct IdChunks {
    query: ObjQuery,
    tag: String,
    fields: FieldIndex,
    batch_size: usize,
    after_id: Option<String>,
    done: bool,
}

impl IdChunks {
    /// Creates a cursor positioned before the first match.
    #[must_use]
    pub fn new(query: ObjQuery, tag: String, fields: FieldIndex, batch_size: usize) -> Self {
        Self { query, tag, fields, batch_size: batch_size.max(1), after_id: None, done: false }
    }

    /// Repositions the cursor after `after_id`.
    #[must_use]
    pub fn resume(mut self, after_id: impl Into<String>) -> Self {
        self.after_id = Some(after_id.into());
        self.done = false;
        self
    }

    /// The last id returned, if any.
    #[must_use]
    pub fn cursor(&self) -> Option<&str> {
        self.after_id.as_deref()
    }

    /// Reads the next chunk of live matches.
    ///
    /// Returns `Ok(None)` once the matches are exhausted.
    pub async fn next_chunk<S: ObjStorage + ?Sized>(
        &mut self,
        storage: &S,
    ) -> StorageResult<Option<Vec<Obj>>> {
        if self.done {
            return Ok(None);
        }
        let page = storage
            .read(ReadParams {
                query: self.query.clone(),
                tag: self.tag.clone(),
                page: None,
                limit: Some(self.batch_size),
                sort: vec![SortField::asc("id")],
                fields: self.fields.clone(),
                lifecycle: Lifecycle::Live,
                after_id: self.after_id.clone(),
            })
            .await?;
        let Some(last) = page.objs.last() else {
            self.done = true;
            return Ok(None);
        };
        self.after_id = Some(last.id.clone());
        self.done = !page.has_more;
        Ok(Some(page.objs))
    }

    /// Like [`next_chunk`](IdChunks::next_chunk), keeping only the ids.
    pub async fn next_ids<S: ObjStorage + ?Sized>(
        &mut self,
        storage: &S,
    ) -> StorageResult<Option<Vec<String>>> {
        Ok(self.next_chunk(storage).await?.map(|objs| objs.into_iter().map(|o| o.id).collect()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{MemoryObjStorage, value::record_from_json};

    fn rec(json: serde_json::Value) -> ObjRecord {
        record_from_json(json).expect("record")
    }

    #[test]
    fn identity_requires_every_key() {
        let keys = vec!["email".to_owned(), "org.id".to_owned()];
        let full = rec(json!({"email": "a@x.io", "org": {"id": 7}}));
        let partial = rec(json!({"email": "a@x.io"}));
        let null = rec(json!({"email": null, "org": {"id": 7}}));
        assert!(Identity::of(&full, &keys).is_some());
        assert!(Identity::of(&partial, &keys).is_none());
        assert!(Identity::of(&null, &keys).is_none());
        assert!(Identity::of(&full, &[]).is_none());
    }

    #[test]
    fn identity_normalizes_numbers() {
        let keys = vec!["n".to_owned()];
        assert_eq!(
            Identity::of(&rec(json!({"n": 1})), &keys),
            Identity::of(&rec(json!({"n": 1.0})), &keys)
        );
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let storage = MemoryObjStorage::new();
        let params = BulkUpsertParams::builder()
            .items(vec![rec(json!({"a": 1}))])
            .tag("t")
            .app_id("app")
            .group_id("g")
            .created_by("u")
            .created_by_type("user")
            .batch_size(0)
            .build();
        let err = storage.bulk_upsert(params).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));
    }

    #[tokio::test]
    async fn id_chunks_walk_all_matches_and_resume() {
        let storage = MemoryObjStorage::new();
        let items = (0..7).map(|i| rec(json!({"n": i}))).collect();
        storage
            .bulk_upsert(
                BulkUpsertParams::builder()
                    .items(items)
                    .tag("t")
                    .app_id("app")
                    .group_id("g")
                    .created_by("u")
                    .created_by_type("user")
                    .build(),
            )
            .await
            .expect("seed");

        let mut chunks = IdChunks::new(ObjQuery::for_app("app"), "t".into(), FieldIndex::new(), 3);
        let first = chunks.next_ids(&storage).await.expect("read").expect("chunk");
        assert_eq!(first.len(), 3);
        let cursor = chunks.cursor().expect("cursor").to_owned();

        let mut resumed =
            IdChunks::new(ObjQuery::for_app("app"), "t".into(), FieldIndex::new(), 3)
                .resume(cursor);
        let mut rest = Vec::new();
        while let Some(ids) = resumed.next_ids(&storage).await.expect("read") {
            rest.extend(ids);
        }
        assert_eq!(rest.len(), 4);
        assert!(rest.iter().all(|id| !first.contains(id)));
        let mut sorted = rest.clone();
        sorted.sort();
        assert_eq!(rest, sorted);
    }
}
