//! Conformance test suite for [`ObjStorage`] implementations.
//!
//! This module provides async check functions that validate whether a
//! backend satisfies the storage contract. The in-memory backend, the
//! MongoDB backend and the PostgreSQL backend all run the same suite, which
//! keeps their observable semantics aligned.
//!
//! Every check works inside its own freshly generated app id, so the whole
//! suite can run against one shared, non-empty database.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each check with a backend:
//!
//! ```no_run
//! use fimidx_storage::{MemoryObjStorage, conformance};
//!
//! #[tokio::test]
//! async fn roundtrip_create_then_read() {
//!     conformance::roundtrip_create_then_read(&MemoryObjStorage::new()).await;
//! }
//! ```
//!
//! # Check Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | Round trip | create/read fidelity, scoping, paging, default sort |
//! | Soft delete | monotonic deletion, explicit deleted reads, cleanup |
//! | Conflict resolution | `fail`, `ignore`, `replace`, identity rules |
//! | Merge | update ways, array laws |
//! | Batching | results independent of `batch_size` |
//! | Transactions | commit and rollback |
//! | Array paths | any-element matching, bare objects, empty arrays, nesting |
//! | Sorting | index-gated record sort, type ranks, the `createdAt` fallback |
//! | Errors | validation and health |

use chrono::TimeDelta;
use serde_json::json;

use crate::{
    assert_validation,
    backend::{
        BulkDeleteParams, BulkUpdateParams, BulkUpsertParams, DeleteParams, ObjStorage,
        OnConflict, ReadParams, TransactionalStorage, UpdateParams,
    },
    error::StorageError,
    field::{FieldDescriptor, FieldIndex, FieldType},
    merge::UpdateWay,
    obj::{self, Obj},
    plan::Lifecycle,
    query::{MetaField, MetaOps, MetaQuery, ObjQuery, PartQuery, Predicate},
    sort::SortField,
    testutil::{
        TEST_ACTOR, TEST_ACTOR_TYPE, TEST_GROUP, make_member_record, make_obj, record, seed,
        unique_app_id,
    },
    value::ObjRecord,
};

const TAG: &str = "member";

fn matching(app_id: &str, part: PartQuery) -> ObjQuery {
    ObjQuery::builder().app_id(app_id).part_query(part).build()
}

fn read_params(query: ObjQuery) -> ReadParams {
    ReadParams::builder().query(query).tag(TAG).limit(1000).build()
}

async fn read_objs<S: ObjStorage + ?Sized>(storage: &S, params: ReadParams) -> Vec<Obj> {
    storage.read(params).await.expect("read should succeed").objs
}

async fn live_objs<S: ObjStorage + ?Sized>(storage: &S, app_id: &str) -> Vec<Obj> {
    read_objs(storage, read_params(ObjQuery::for_app(app_id))).await
}

fn sorted_ids(objs: &[Obj]) -> Vec<String> {
    let mut ids: Vec<String> = objs.iter().map(|o| o.id.clone()).collect();
    ids.sort();
    ids
}

fn name_of(obj: &Obj) -> Option<String> {
    obj.obj_record.get("name").and_then(|v| v.as_str().map(str::to_owned))
}

fn sorted_names(objs: Vec<Obj>) -> Vec<String> {
    let mut names: Vec<String> = objs.iter().filter_map(name_of).collect();
    names.sort();
    names
}

async fn names_matching<S: ObjStorage + ?Sized>(storage: &S, params: ReadParams) -> Vec<String> {
    sorted_names(read_objs(storage, params).await)
}

fn sorted_records(objs: &[Obj]) -> Vec<serde_json::Value> {
    let mut records: Vec<serde_json::Value> =
        objs.iter().map(|o| crate::value::record_to_json(&o.obj_record)).collect();
    records.sort_by_key(ToString::to_string);
    records
}

fn upsert_params(app_id: &str, items: Vec<ObjRecord>) -> BulkUpsertParams {
    BulkUpsertParams::builder()
        .items(items)
        .tag(TAG)
        .app_id(app_id)
        .group_id(TEST_GROUP)
        .created_by(TEST_ACTOR)
        .created_by_type(TEST_ACTOR_TYPE)
        .build()
}

fn update_params(query: ObjQuery, update: ObjRecord, way: UpdateWay) -> UpdateParams {
    UpdateParams::builder()
        .query(query)
        .tag(TAG)
        .update(update)
        .by("updater")
        .by_type("user")
        .update_way(way)
        .build()
}

fn delete_params(query: ObjQuery) -> DeleteParams {
    DeleteParams::builder()
        .query(query)
        .tag(TAG)
        .deleted_by("deleter")
        .deleted_by_type("user")
        .build()
}

// ============================================================================
// Round trip
// ============================================================================

/// An object reads back exactly as it was created.
pub async fn roundtrip_create_then_read<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("roundtrip");
    let original = make_obj(
        &app,
        TAG,
        record(json!({
            "name": "Ada",
            "age": 36,
            "ratio": 0.25,
            "active": true,
            "nickname": null,
            "tags": ["math", "engines"],
            "address": {"city": "London", "geo": {"lat": 51.5}},
            "reportsTo": [{"userId": "u1", "role": "lead"}],
        })),
    );
    let created = storage.create(vec![original.clone()]).await.expect("create should succeed");
    assert_eq!(created, vec![original.clone()]);

    let query = ObjQuery::builder()
        .app_id(app.as_str())
        .meta_query(MetaQuery::id_eq(&original.id))
        .build();
    let objs = read_objs(storage, read_params(query)).await;
    assert_eq!(objs, vec![original], "stored object should round-trip unchanged");
}

/// Creating an id that already exists fails and inserts nothing.
pub async fn create_duplicate_id_conflicts<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("dup");
    let first = seed(storage, &app, TAG, [make_member_record(1)]).await.remove(0);

    let fresh = make_obj(&app, TAG, make_member_record(2));
    let result = storage.create(vec![fresh, first]).await;
    assert!(matches!(result, Err(StorageError::Conflict { .. })), "got {result:?}");
    assert_eq!(live_objs(storage, &app).await.len(), 1, "a failed create must insert nothing");
}

/// Reads never cross app, group or tag boundaries.
pub async fn read_is_scoped_by_app_group_and_tag<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("scope");
    let other_app = unique_app_id("scope-other");
    let mine = seed(storage, &app, TAG, [make_member_record(1)]).await;
    seed(storage, &other_app, TAG, [make_member_record(1)]).await;
    seed(storage, &app, "permission", [make_member_record(1)]).await;
    let other_group =
        Obj { group_id: "group-2".into(), ..make_obj(&app, TAG, make_member_record(2)) };
    storage.create(vec![other_group.clone()]).await.expect("create");

    let in_group = ObjQuery::builder().app_id(app.as_str()).group_id(TEST_GROUP).build();
    assert_eq!(sorted_ids(&read_objs(storage, read_params(in_group)).await), sorted_ids(&mine));

    let whole_app = live_objs(storage, &app).await;
    assert_eq!(whole_app.len(), 2, "omitting group_id spans every group of the app");
}

/// Pages are 0-based and `has_more` reports remaining matches.
pub async fn read_pages_report_has_more<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("paging");
    seed(storage, &app, TAG, (0..5).map(make_member_record)).await;

    let mut params = read_params(ObjQuery::for_app(app.as_str()));
    params.limit = Some(2);
    let mut seen = Vec::new();
    for page in 0..3 {
        params.page = Some(page);
        let result = storage.read(params.clone()).await.expect("read");
        assert_eq!(result.has_more, page < 2, "has_more on page {page}");
        seen.extend(result.objs);
    }
    assert_eq!(seen.len(), 5);
    let mut ids = sorted_ids(&seen);
    ids.dedup();
    assert_eq!(ids.len(), 5, "pages must not overlap");
}

/// Without a sort, objects come back newest first.
pub async fn read_default_sort_is_created_at_desc<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("default-sort");
    let base = obj::now() - TimeDelta::seconds(60);
    let objs: Vec<Obj> = (0..4)
        .map(|i| {
            Obj::builder()
                .app_id(app.as_str())
                .group_id(TEST_GROUP)
                .tag(TAG)
                .obj_record(make_member_record(i))
                .created_by(TEST_ACTOR)
                .created_by_type(TEST_ACTOR_TYPE)
                .now(base + TimeDelta::seconds(i64::try_from(i).unwrap_or_default()))
                .build()
        })
        .collect();
    storage.create(objs.clone()).await.expect("create");

    let read: Vec<String> = live_objs(storage, &app).await.into_iter().map(|o| o.id).collect();
    let expected: Vec<String> = objs.iter().rev().map(|o| o.id.clone()).collect();
    assert_eq!(read, expected);
}

/// Meta queries constrain envelope fields.
pub async fn meta_query_filters_envelope<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("meta");
    let objs = seed(storage, &app, TAG, (0..3).map(make_member_record)).await;
    let picked = [objs[0].id.clone(), objs[2].id.clone()];

    let mut expected = picked.to_vec();
    expected.sort();
    let by_ids = ObjQuery::builder()
        .app_id(app.as_str())
        .meta_query(MetaQuery::id_in(picked.clone()))
        .build();
    assert_eq!(sorted_ids(&read_objs(storage, read_params(by_ids)).await), expected);

    let excluded = ObjQuery::builder()
        .app_id(app.as_str())
        .meta_query(
            MetaQuery::new()
                .with(MetaField::Id, MetaOps::new().none_of(picked.clone()))
                .with(MetaField::CreatedBy, MetaOps::new().equal(TEST_ACTOR)),
        )
        .build();
    let rest = read_objs(storage, read_params(excluded)).await;
    assert_eq!(sorted_ids(&rest), vec![objs[1].id.clone()]);

    let later = ObjQuery::builder()
        .app_id(app.as_str())
        .meta_query(MetaQuery::new().with(
            MetaField::CreatedAt,
            MetaOps::new().greater_than((objs[0].created_at + TimeDelta::days(1)).to_rfc3339()),
        ))
        .build();
    assert!(read_objs(storage, read_params(later)).await.is_empty());
}

// ============================================================================
// Soft delete
// ============================================================================

/// Deleted objects disappear from live reads and show up in deleted reads.
pub async fn delete_hides_from_live_reads<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("delete");
    let objs = seed(storage, &app, TAG, (0..3).map(make_member_record)).await;

    let result = storage
        .delete(delete_params(matching(&app, PartQuery::all([Predicate::eq("age", 1_i64)]))))
        .await
        .expect("delete");
    assert_eq!(result.deleted_count, 1);

    let live = live_objs(storage, &app).await;
    assert_eq!(sorted_ids(&live), sorted_ids(&[objs[0].clone(), objs[2].clone()]));

    let mut params = read_params(ObjQuery::for_app(app.as_str()));
    params.lifecycle = Lifecycle::Deleted;
    let deleted = read_objs(storage, params.clone()).await;
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].id, objs[1].id);
    assert!(deleted[0].deleted_at.is_some());
    assert_eq!(deleted[0].deleted_by.as_deref(), Some("deleter"));

    params.lifecycle = Lifecycle::All;
    assert_eq!(read_objs(storage, params).await.len(), 3);
}

/// Deletion is permanent: updates skip deleted objects and re-deleting is a
/// no-op that keeps the first deletion stamp.
pub async fn delete_is_monotonic<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("monotonic");
    seed(storage, &app, TAG, [make_member_record(1)]).await;

    storage.delete(delete_params(ObjQuery::for_app(app.as_str()))).await.expect("delete");
    let mut deleted_read = read_params(ObjQuery::for_app(app.as_str()));
    deleted_read.lifecycle = Lifecycle::Deleted;
    let first = read_objs(storage, deleted_read.clone()).await.remove(0);

    let updated = storage
        .update(update_params(
            ObjQuery::for_app(app.as_str()),
            record(json!({"age": 99})),
            UpdateWay::Replace,
        ))
        .await
        .expect("update");
    assert_eq!(updated.updated_count, 0, "updates never reach deleted objects");

    let again =
        storage.delete(delete_params(ObjQuery::for_app(app.as_str()))).await.expect("delete");
    assert_eq!(again.deleted_count, 0);

    let after = read_objs(storage, deleted_read).await.remove(0);
    assert_eq!(after, first, "a deleted object never changes");
}

/// Cleanup physically removes soft-deleted objects past the retention.
pub async fn cleanup_purges_deleted<S: ObjStorage + ?Sized>(storage: &S) {
    if !storage.config().cleanup_retention().is_zero() {
        return;
    }
    let app = unique_app_id("cleanup");
    let objs = seed(storage, &app, TAG, (0..2).map(make_member_record)).await;
    storage
        .delete(delete_params(matching(&app, PartQuery::all([Predicate::eq("age", 0_i64)]))))
        .await
        .expect("delete");

    let cleaned = storage.cleanup_deleted_objs().await.expect("cleanup");
    assert!(cleaned.cleaned_count >= 1);

    let mut params = read_params(ObjQuery::for_app(app.as_str()));
    params.lifecycle = Lifecycle::All;
    let remaining = read_objs(storage, params).await;
    assert_eq!(sorted_ids(&remaining), vec![objs[1].id.clone()]);
}

// ============================================================================
// Conflict resolution
// ============================================================================

/// `ignore` keeps the stored object and reports the item.
pub async fn bulk_upsert_ignore_keeps_existing<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("upsert-ignore");
    let existing = seed(storage, &app, TAG, [record(json!({"email": "a@x.io", "v": 1}))]).await;

    let mut params = upsert_params(
        &app,
        vec![
            record(json!({"email": "a@x.io", "v": 2})),
            record(json!({"email": "b@x.io", "v": 1})),
        ],
    );
    params.conflict_on_keys = vec!["email".into()];
    params.on_conflict = OnConflict::Ignore;
    let result = storage.bulk_upsert(params).await.expect("upsert");

    assert_eq!(result.new_objs.len(), 1);
    assert_eq!(result.ignored_items, vec![record(json!({"email": "a@x.io", "v": 2}))]);
    assert!(result.updated_objs.is_empty() && result.failed_items.is_empty());

    let live = live_objs(storage, &app).await;
    let kept = live.iter().find(|o| o.id == existing[0].id).expect("existing object");
    assert_eq!(kept.obj_record, existing[0].obj_record);
}

/// `replace` swaps the record of the oldest match, keeping id and creation.
pub async fn bulk_upsert_replace_keeps_identity<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("upsert-replace");
    let existing = seed(storage, &app, TAG, [record(json!({"email": "a@x.io", "name": "old"}))])
        .await
        .remove(0);

    let mut params = upsert_params(&app, vec![record(json!({"email": "a@x.io", "name": "new"}))]);
    params.conflict_on_keys = vec!["email".into()];
    params.on_conflict = OnConflict::Replace;
    params.created_by = "replacer".into();
    let result = storage.bulk_upsert(params).await.expect("upsert");

    assert!(result.new_objs.is_empty());
    assert_eq!(result.updated_objs.len(), 1);
    let stored = live_objs(storage, &app).await;
    assert_eq!(stored.len(), 1);
    let replaced = &stored[0];
    assert_eq!(replaced.id, existing.id);
    assert_eq!(replaced.created_at, existing.created_at);
    assert_eq!(replaced.created_by, existing.created_by);
    assert_eq!(replaced.updated_by, "replacer");
    assert!(replaced.updated_at >= existing.updated_at);
    assert_eq!(replaced.obj_record, record(json!({"email": "a@x.io", "name": "new"})));
    assert_eq!(&result.updated_objs[0], replaced);
}

/// `fail` reports conflicting items and still inserts the others.
pub async fn bulk_upsert_fail_reports_items<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("upsert-fail");
    seed(storage, &app, TAG, [record(json!({"email": "a@x.io", "org": 1}))]).await;

    let mut params = upsert_params(
        &app,
        vec![
            record(json!({"email": "a@x.io", "org": 1, "v": 2})),
            record(json!({"email": "a@x.io", "org": 2})),
        ],
    );
    params.conflict_on_keys = vec!["email".into(), "org".into()];
    let result = storage.bulk_upsert(params).await.expect("upsert");

    assert_eq!(result.failed_items.len(), 1);
    assert_eq!(result.failed_items[0].item, record(json!({"email": "a@x.io", "org": 1, "v": 2})));
    assert!(result.failed_items[0].reason.contains("email"));
    assert_eq!(result.new_objs.len(), 1);
    assert_eq!(live_objs(storage, &app).await.len(), 2);
}

/// Items without a full identity are always inserted.
pub async fn bulk_upsert_without_identity_inserts<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("upsert-no-identity");
    let items = vec![
        record(json!({"name": "x"})),
        record(json!({"name": "x"})),
        record(json!({"email": null, "name": "x"})),
    ];

    let no_keys = upsert_params(&app, items.clone());
    assert_eq!(storage.bulk_upsert(no_keys).await.expect("upsert").new_objs.len(), 3);

    let mut missing_key = upsert_params(&app, items);
    missing_key.conflict_on_keys = vec!["email".into()];
    missing_key.on_conflict = OnConflict::Fail;
    let result = storage.bulk_upsert(missing_key).await.expect("upsert");
    assert_eq!(result.new_objs.len(), 3);
    assert!(result.failed_items.is_empty());
    assert_eq!(live_objs(storage, &app).await.len(), 6);
}

/// A zero batch size is rejected before anything is written.
pub async fn bulk_zero_batch_size_is_validation<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("zero-batch");
    let mut params = upsert_params(&app, vec![make_member_record(1)]);
    params.batch_size = Some(0);
    let result = storage.bulk_upsert(params).await;
    assert_validation!(result);
    assert!(live_objs(storage, &app).await.is_empty());
}

// ============================================================================
// Merge
// ============================================================================

/// `replace` overwrites top-level keys and leaves the others alone.
pub async fn update_replace_is_shallow<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("update-replace");
    let obj = seed(
        storage,
        &app,
        TAG,
        [record(json!({"name": "a", "profile": {"level": 1, "bio": "x"}, "roles": ["r1"]}))],
    )
    .await
    .remove(0);

    let result = storage
        .update(update_params(
            ObjQuery::for_app(app.as_str()),
            record(json!({"profile": {"level": 2}})),
            UpdateWay::Replace,
        ))
        .await
        .expect("update");
    assert_eq!(result.updated_count, 1);

    let stored = live_objs(storage, &app).await.remove(0);
    assert_eq!(
        stored.obj_record,
        record(json!({"name": "a", "profile": {"level": 2}, "roles": ["r1"]}))
    );
    assert_eq!(stored.id, obj.id);
    assert_eq!(stored.created_at, obj.created_at);
    assert_eq!(stored.updated_by, "updater");
}

/// Deep merge laws, including the three array variants.
pub async fn update_merge_ways<S: ObjStorage + ?Sized>(storage: &S) {
    let cases = [
        (UpdateWay::Merge, json!({"p": {"a": 1, "b": 9, "c": 3}, "arr": [9], "keep": true})),
        (
            UpdateWay::MergeButReplaceArrays,
            json!({"p": {"a": 1, "b": 9, "c": 3}, "arr": [9], "keep": true}),
        ),
        (
            UpdateWay::MergeButConcatArrays,
            json!({"p": {"a": 1, "b": 9, "c": 3}, "arr": [1, 2, 9], "keep": true}),
        ),
        (
            UpdateWay::MergeButKeepArrays,
            json!({"p": {"a": 1, "b": 9, "c": 3}, "arr": [1, 2], "keep": true}),
        ),
    ];
    for (way, expected) in cases {
        let app = unique_app_id("update-merge");
        let original = record(json!({"p": {"a": 1, "b": 2}, "arr": [1, 2], "keep": true}));
        seed(storage, &app, TAG, [original]).await;
        storage
            .update(update_params(
                ObjQuery::for_app(app.as_str()),
                record(json!({"p": {"b": 9, "c": 3}, "arr": [9]})),
                way,
            ))
            .await
            .expect("update");
        let stored = live_objs(storage, &app).await.remove(0);
        assert_eq!(stored.obj_record, record(expected), "update way {}", way.as_str());
    }
}

// ============================================================================
// Batching invariance
// ============================================================================

/// Bulk upsert results do not depend on the batch size, including
/// duplicates spread across chunks.
pub async fn bulk_upsert_batching_invariance<S: ObjStorage + ?Sized>(storage: &S) {
    let items: Vec<ObjRecord> = [1, 2, 1, 3, 2, 4, 1]
        .into_iter()
        .enumerate()
        .map(|(seq, key)| record(json!({"key": key, "seq": seq})))
        .collect();

    let mut outcomes = Vec::new();
    for batch_size in [1, 2, 3, 100] {
        let app = unique_app_id("upsert-batching");
        seed(storage, &app, TAG, [record(json!({"key": 4, "seq": -1}))]).await;
        let mut params = upsert_params(&app, items.clone());
        params.conflict_on_keys = vec!["key".into()];
        params.on_conflict = OnConflict::Ignore;
        params.batch_size = Some(batch_size);
        let result = storage.bulk_upsert(params).await.expect("upsert");
        let stored = live_objs(storage, &app).await;
        outcomes.push((
            result.new_objs.len(),
            result.ignored_items.clone(),
            sorted_records(&stored),
            batch_size,
        ));
    }

    let (new, ignored, stored, _) = &outcomes[0];
    assert_eq!(*new, 3, "keys 1, 2 and 3 are new");
    assert_eq!(ignored.len(), 4);
    for (other_new, other_ignored, other_stored, batch_size) in &outcomes[1..] {
        assert_eq!(other_new, new, "new count with batch size {batch_size}");
        assert_eq!(other_ignored, ignored, "ignored items with batch size {batch_size}");
        assert_eq!(other_stored, stored, "stored records with batch size {batch_size}");
    }
}

/// Bulk update touches every live match exactly once whatever the batch size.
pub async fn bulk_update_batching_invariance<S: ObjStorage + ?Sized>(storage: &S) {
    for batch_size in [1, 3, 100] {
        let app = unique_app_id("update-batching");
        seed(storage, &app, TAG, (0..7).map(make_member_record)).await;

        let result = storage
            .bulk_update(
                BulkUpdateParams::builder()
                    .query(matching(&app, PartQuery::all([Predicate::eq("active", true)])))
                    .tag(TAG)
                    .update(record(json!({"active": false, "bumped": true})))
                    .by("bulk")
                    .by_type("system")
                    .batch_size(batch_size)
                    .build(),
            )
            .await
            .expect("bulk update");
        assert_eq!(result.updated_count, 4, "batch size {batch_size}");

        let bumped = read_objs(
            storage,
            read_params(matching(&app, PartQuery::all([Predicate::eq("bumped", true)]))),
        )
        .await;
        assert_eq!(bumped.len(), 4, "batch size {batch_size}");
        assert!(bumped.iter().all(|o| o.updated_by == "bulk"));
    }
}

/// Bulk delete honors `delete_many`.
pub async fn bulk_delete_respects_delete_many<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("bulk-delete");
    seed(storage, &app, TAG, (0..5).map(make_member_record)).await;

    let params = |delete_many: bool| {
        BulkDeleteParams::builder()
            .query(ObjQuery::for_app(app.as_str()))
            .tag(TAG)
            .deleted_by("bulk")
            .deleted_by_type("system")
            .batch_size(2)
            .delete_many(delete_many)
            .build()
    };

    let first = storage.bulk_delete(params(false)).await.expect("bulk delete");
    assert_eq!(first.deleted_count, 2, "only the first chunk");
    assert_eq!(live_objs(storage, &app).await.len(), 3);

    let rest = storage.bulk_delete(params(true)).await.expect("bulk delete");
    assert_eq!(rest.deleted_count, 3);
    assert!(live_objs(storage, &app).await.is_empty());
}

// ============================================================================
// Transactions
// ============================================================================

/// Everything done through the handle becomes visible on success.
pub async fn transaction_commits_all<S: TransactionalStorage>(storage: &S) {
    let app = unique_app_id("tx-commit");
    let existing = seed(storage, &app, TAG, [make_member_record(1)]).await.remove(0);
    let added = make_obj(&app, TAG, make_member_record(2));

    let tx_app = app.clone();
    let tx_added = added.clone();
    let count = storage
        .with_transaction(move |tx| {
            Box::pin(async move {
                tx.create(vec![tx_added]).await?;
                let updated = tx
                    .update(update_params(
                        ObjQuery::for_app(tx_app.as_str()),
                        record(json!({"touched": true})),
                        UpdateWay::Merge,
                    ))
                    .await?;
                Ok::<_, StorageError>(updated.updated_count)
            })
        })
        .await
        .expect("transaction should commit");
    assert_eq!(count, 2, "the transaction sees its own insert");

    let live = live_objs(storage, &app).await;
    assert_eq!(sorted_ids(&live), sorted_ids(&[existing, added]));
    assert!(live.iter().all(|o| o.obj_record.contains_key("touched")));
}

/// An error from the closure rolls everything back and is returned as is.
pub async fn transaction_error_rolls_back<S: TransactionalStorage>(storage: &S) {
    let app = unique_app_id("tx-rollback");
    let existing = seed(storage, &app, TAG, [make_member_record(1)]).await.remove(0);

    let tx_app = app.clone();
    let result = storage
        .with_transaction(move |tx| {
            Box::pin(async move {
                tx.create(vec![make_obj(&tx_app, TAG, make_member_record(2))]).await?;
                tx.delete(delete_params(ObjQuery::for_app(tx_app.as_str()))).await?;
                Err::<(), _>(StorageError::validation("caller aborted"))
            })
        })
        .await;
    assert!(
        matches!(&result, Err(StorageError::Validation { message }) if message == "caller aborted"),
        "the closure's error is returned unchanged, got {result:?}"
    );

    let live = live_objs(storage, &app).await;
    assert_eq!(live, vec![existing], "nothing from the failed transaction is visible");
}

// ============================================================================
// Array paths
// ============================================================================

fn reports_to_index() -> FieldIndex {
    let mut fields = FieldIndex::new();
    fields.insert(
        FieldDescriptor::builder()
            .path("reportsTo")
            .field_type(FieldType::String)
            .array_types(vec![FieldType::String])
            .build(),
    );
    fields.insert(FieldDescriptor::builder().path("reportsTo.userId").build());
    fields
}

/// Array-capable paths match any element, treat a bare object as a single
/// element, and never match an empty array.
pub async fn array_path_query_scenario<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("array-path");
    let objs = seed(
        storage,
        &app,
        TAG,
        [
            record(json!({"name": "many", "reportsTo": [{"userId": "u1"}, {"userId": "u2"}]})),
            record(json!({"name": "bare", "reportsTo": {"userId": "u1"}})),
            record(json!({"name": "empty", "reportsTo": []})),
            record(json!({"name": "other", "reportsTo": [{"userId": "u3"}]})),
        ],
    )
    .await;
    let run = |part: PartQuery| {
        let mut params = read_params(matching(&app, part));
        params.fields = reports_to_index();
        params
    };
    assert_eq!(objs.len(), 4);

    let eq =
        read_objs(storage, run(PartQuery::all([Predicate::eq("reportsTo.userId", "u1")]))).await;
    assert_eq!(sorted_names(eq), vec!["bare", "many"]);

    let one_of = read_objs(
        storage,
        run(PartQuery::all([Predicate::one_of("reportsTo.userId", ["u2", "u3"])])),
    )
    .await;
    assert_eq!(sorted_names(one_of), vec!["many", "other"]);

    let none_of = read_objs(
        storage,
        run(PartQuery::all([Predicate::none_of("reportsTo.userId", ["u1"])])),
    )
    .await;
    assert_eq!(sorted_names(none_of), vec!["other"], "an empty array never matches");

    let neq = read_objs(storage, run(PartQuery::all([Predicate::neq("reportsTo.userId", "u2")])))
        .await;
    assert_eq!(sorted_names(neq), vec!["bare", "other"]);

    let combined = read_objs(
        storage,
        run(PartQuery {
            and: vec![Predicate::eq("reportsTo.userId", "u1")],
            not: vec![Predicate::eq("name", "bare")],
            ..PartQuery::default()
        }),
    )
    .await;
    assert_eq!(sorted_names(combined), vec!["many"]);
}

/// A path with no array-capable prefix walks maps only. An array on the way
/// makes it missing, and an array at its end is compared as one value.
pub async fn unindexed_array_path_scenario<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("unindexed-array");
    seed(
        storage,
        &app,
        TAG,
        [
            record(json!({"name": "nested", "team": {"lead": "ada"}})),
            record(json!({"name": "listed", "team": [{"lead": "ada"}]})),
            record(json!({"name": "tags", "tags": ["a", "b"]})),
            record(json!({"name": "tag", "tags": "a"})),
        ],
    )
    .await;
    let run = |predicate: Predicate| read_params(matching(&app, PartQuery::all([predicate])));

    let found = names_matching(storage, run(Predicate::eq("team.lead", "ada"))).await;
    assert_eq!(found, vec!["nested"]);
    let found = names_matching(storage, run(Predicate::exists("team.lead", true))).await;
    assert_eq!(found, vec!["nested"]);
    let found = names_matching(storage, run(Predicate::exists("team.lead", false))).await;
    assert_eq!(found, vec!["listed", "tag", "tags"], "an array on the way hides the path");

    let found = names_matching(storage, run(Predicate::eq("tags", "a"))).await;
    assert_eq!(found, vec!["tag"]);
    let found = names_matching(storage, run(Predicate::neq("tags", "a"))).await;
    assert_eq!(found, vec!["tags"], "an array is never equal to one of its elements");

    let excluded = PartQuery {
        not: vec![Predicate::eq("team.lead", "ada")],
        ..PartQuery::default()
    };
    let found = names_matching(storage, read_params(matching(&app, excluded))).await;
    assert_eq!(found, vec!["listed", "tag", "tags"]);
}

/// Positive predicates under one array prefix must hold on the same element.
pub async fn element_predicates_match_one_element_scenario<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("joint-element");
    seed(
        storage,
        &app,
        TAG,
        [
            record(json!({"name": "joint", "reportsTo": [{"userId": "u1", "role": "lead"}]})),
            record(json!({"name": "split", "reportsTo": [
                {"userId": "u1", "role": "member"},
                {"userId": "u2", "role": "lead"},
            ]})),
            record(json!({"name": "bare", "reportsTo": {"userId": "u1", "role": "lead"}})),
        ],
    )
    .await;
    let run = |part: PartQuery| {
        let mut params = read_params(matching(&app, part));
        params.fields = reports_to_index();
        params
    };

    let both = PartQuery::all([
        Predicate::eq("reportsTo.userId", "u1"),
        Predicate::eq("reportsTo.role", "lead"),
    ]);
    let found = names_matching(storage, run(both)).await;
    assert_eq!(found, vec!["bare", "joint"], "u1 and lead sit on different elements of split");

    let either = PartQuery {
        or: vec![Predicate::eq("reportsTo.userId", "u2"), Predicate::eq("reportsTo.role", "lead")],
        ..PartQuery::default()
    };
    let found = names_matching(storage, run(either)).await;
    assert_eq!(found, vec!["bare", "joint", "split"]);
}

/// Range and pattern predicates on array paths hold on some element, for
/// element values and for fields inside elements.
pub async fn array_path_range_scenario<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("array-range");
    seed(
        storage,
        &app,
        TAG,
        [
            record(json!({
                "name": "a", "scores": [1, 15], "reportsTo": [{"userId": "u1", "level": 3}],
            })),
            record(json!({
                "name": "b", "scores": 12, "reportsTo": {"userId": "x9", "level": 7},
            })),
            record(json!({"name": "c", "scores": [], "reportsTo": []})),
            record(json!({
                "name": "d", "scores": [20, 30], "reportsTo": [{"userId": "u22", "level": 10}],
            })),
        ],
    )
    .await;
    let mut fields = reports_to_index();
    fields.insert(
        FieldDescriptor::builder().path("scores").array_types(vec![FieldType::Number]).build(),
    );
    let run = |predicate: Predicate| {
        let mut params = read_params(matching(&app, PartQuery::all([predicate])));
        params.fields = fields.clone();
        params
    };

    let found = names_matching(storage, run(Predicate::gt("scores", 25_i64))).await;
    assert_eq!(found, vec!["d"]);
    let found = names_matching(storage, run(Predicate::between("scores", 10_i64, 16_i64))).await;
    assert_eq!(found, vec!["a", "b"], "one element must lie inside the range");

    let found = names_matching(storage, run(Predicate::gt("reportsTo.level", 5_i64))).await;
    assert_eq!(found, vec!["b", "d"]);
    let between = Predicate::between("reportsTo.level", 3_i64, 7_i64);
    assert_eq!(names_matching(storage, run(between)).await, vec!["a", "b"]);
    let like = Predicate::like("reportsTo.userId", "^u[0-9]+$").expect("valid pattern");
    assert_eq!(names_matching(storage, run(like)).await, vec!["a", "d"]);
}

/// Paths reaching through two levels of arrays match any nested element,
/// with bare objects at either level and empty arrays reaching nothing.
pub async fn nested_array_path_scenario<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("nested-array");
    seed(
        storage,
        &app,
        TAG,
        [
            record(json!({"name": "email", "workflow": {"steps": [
                {"actions": [{"type": "email"}, {"type": "sms"}]},
                {"actions": {"type": "push"}},
            ]}})),
            record(json!({"name": "push", "workflow": {"steps": {"actions": [{"type": "push"}]}}})),
            record(json!({"name": "none", "workflow": {"steps": []}})),
            record(json!({"name": "webhook", "workflow": {"steps": [
                {"actions": []},
                {"actions": [{"type": "webhook"}]},
            ]}})),
        ],
    )
    .await;
    let fields: FieldIndex = [
        FieldDescriptor::builder()
            .path("workflow.steps")
            .array_types(vec![FieldType::String])
            .build(),
        FieldDescriptor::builder()
            .path("workflow.steps.actions")
            .array_types(vec![FieldType::String])
            .build(),
        FieldDescriptor::builder().path("workflow.steps.actions.type").build(),
    ]
    .into_iter()
    .collect();
    let run = |predicate: Predicate| {
        let mut params = read_params(matching(&app, PartQuery::all([predicate])));
        params.fields = fields.clone();
        params
    };
    let path = "workflow.steps.actions.type";

    let found = names_matching(storage, run(Predicate::eq(path, "push"))).await;
    assert_eq!(found, vec!["email", "push"]);
    let found = names_matching(storage, run(Predicate::one_of(path, ["sms", "webhook"]))).await;
    assert_eq!(found, vec!["email", "webhook"]);
    let found = names_matching(storage, run(Predicate::neq(path, "push"))).await;
    assert_eq!(found, vec!["webhook"]);
    let found = names_matching(storage, run(Predicate::exists(path, true))).await;
    assert_eq!(found, vec!["email", "push", "webhook"], "empty arrays reach nothing");
}

// ============================================================================
// Sorting
// ============================================================================

/// Record sort keys need a field descriptor; without one the read falls back
/// to `createdAt` descending.
pub async fn sort_fallback_scenario<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("sort");
    let base = obj::now() - TimeDelta::seconds(60);
    let scores = [30_i64, 10, 20];
    let objs: Vec<Obj> = scores
        .iter()
        .zip(0_i64..)
        .map(|(score, i)| {
            Obj::builder()
                .app_id(app.as_str())
                .group_id(TEST_GROUP)
                .tag(TAG)
                .obj_record(record(json!({"score": score})))
                .created_by(TEST_ACTOR)
                .created_by_type(TEST_ACTOR_TYPE)
                .now(base + TimeDelta::seconds(i))
                .build()
        })
        .collect();
    storage.create(objs.clone()).await.expect("create");
    let scores_of = |found: Vec<Obj>| -> Vec<i64> {
        found
            .iter()
            .filter_map(|o| o.obj_record.get("score").and_then(|v| v.as_f64()))
            .map(|f| f as i64)
            .collect()
    };

    let mut params = read_params(ObjQuery::for_app(app.as_str()));
    params.sort = vec![SortField::asc("objRecord.score")];
    let unindexed = read_objs(storage, params.clone()).await;
    assert_eq!(scores_of(unindexed), vec![20, 10, 30], "falls back to createdAt desc");

    let mut fields = FieldIndex::new();
    fields.insert(FieldDescriptor::builder().path("score").field_type(FieldType::Number).build());
    params.fields = fields;
    let indexed = read_objs(storage, params.clone()).await;
    assert_eq!(scores_of(indexed), vec![10, 20, 30]);

    params.sort = vec![SortField::desc("objRecord.score")];
    assert_eq!(scores_of(read_objs(storage, params.clone()).await), vec![30, 20, 10]);

    params.sort = vec![SortField::asc("createdAt")];
    assert_eq!(scores_of(read_objs(storage, params).await), vec![30, 10, 20]);
}

/// Record sort keys order by JSON type first and by value within a type,
/// whatever type the descriptor declares. Missing values sort first
/// ascending and last descending.
pub async fn sort_by_type_rank_scenario<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("sort-rank");
    seed(
        storage,
        &app,
        TAG,
        [
            record(json!({"name": "two", "priority": 2})),
            record(json!({"name": "high", "priority": "high"})),
            record(json!({"name": "one", "priority": 1})),
            record(json!({"name": "unset"})),
            record(json!({"name": "three", "priority": 3})),
        ],
    )
    .await;
    let mut params = read_params(ObjQuery::for_app(app.as_str()));
    params.fields.insert(
        FieldDescriptor::builder().path("priority").field_type(FieldType::String).build(),
    );
    let names = |objs: Vec<Obj>| -> Vec<String> { objs.iter().filter_map(name_of).collect() };

    params.sort = vec![SortField::asc("objRecord.priority")];
    assert_eq!(names(read_objs(storage, params.clone()).await), vec![
        "unset", "one", "two", "three", "high"
    ]);

    params.sort = vec![SortField::desc("objRecord.priority")];
    assert_eq!(names(read_objs(storage, params).await), vec![
        "high", "three", "two", "one", "unset"
    ]);
}

// ============================================================================
// Errors and health
// ============================================================================

/// Badly typed meta operands are rejected as validation errors.
pub async fn invalid_meta_operand_is_validation<S: ObjStorage + ?Sized>(storage: &S) {
    let app = unique_app_id("invalid-meta");
    let query = ObjQuery::builder()
        .app_id(app.as_str())
        .meta_query(MetaQuery::new().with(MetaField::CreatedAt, MetaOps::new().equal(true)))
        .build();
    let result = storage.read(read_params(query)).await;
    assert_validation!(result);
}

/// A reachable backend reports healthy.
pub async fn health_check_reports_backend<S: ObjStorage + ?Sized>(storage: &S) {
    let report = storage.health_check().await.expect("backend should be healthy");
    assert!(!report.backend.is_empty());
}

/// Run the full conformance suite against the given backend.
///
/// ```no_run
/// use fimidx_storage::{MemoryObjStorage, conformance};
///
/// #[tokio::test]
/// async fn memory_conformance() {
///     conformance::run_all(&MemoryObjStorage::new()).await;
/// }
/// ```
pub async fn run_all<S: TransactionalStorage>(storage: &S) {
    // Round trip
    roundtrip_create_then_read(storage).await;
    create_duplicate_id_conflicts(storage).await;
    read_is_scoped_by_app_group_and_tag(storage).await;
    read_pages_report_has_more(storage).await;
    read_default_sort_is_created_at_desc(storage).await;
    meta_query_filters_envelope(storage).await;

    // Soft delete
    delete_hides_from_live_reads(storage).await;
    delete_is_monotonic(storage).await;
    cleanup_purges_deleted(storage).await;

    // Conflict resolution
    bulk_upsert_ignore_keeps_existing(storage).await;
    bulk_upsert_replace_keeps_identity(storage).await;
    bulk_upsert_fail_reports_items(storage).await;
    bulk_upsert_without_identity_inserts(storage).await;
    bulk_zero_batch_size_is_validation(storage).await;

    // Merge
    update_replace_is_shallow(storage).await;
    update_merge_ways(storage).await;

    // Batching
    bulk_upsert_batching_invariance(storage).await;
    bulk_update_batching_invariance(storage).await;
    bulk_delete_respects_delete_many(storage).await;

    // Transactions
    transaction_commits_all(storage).await;
    transaction_error_rolls_back(storage).await;

    // Array paths and sorting
    array_path_query_scenario(storage).await;
    unindexed_array_path_scenario(storage).await;
    element_predicates_match_one_element_scenario(storage).await;
    array_path_range_scenario(storage).await;
    nested_array_path_scenario(storage).await;
    sort_fallback_scenario(storage).await;
    sort_by_type_rank_scenario(storage).await;

    // Errors
    invalid_meta_operand_is_validation(storage).await;
    health_check_reports_backend(storage).await;
}
