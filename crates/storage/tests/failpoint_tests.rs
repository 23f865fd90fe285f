#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p fimidx-storage --features failpoints --test failpoint_tests
//! ```

use fimidx_storage::{
    BulkUpdateParams, BulkUpsertParams, MemoryObjStorage, ObjQuery, ObjStorage, PartQuery,
    Predicate, ReadParams, StorageError, TransactionalStorage, assert_transaction_aborted,
    testutil::{TEST_ACTOR, TEST_ACTOR_TYPE, TEST_GROUP, make_member_record, record},
};
use serde_json::json;

fn upsert(items: usize, batch_size: usize) -> BulkUpsertParams {
    BulkUpsertParams::builder()
        .items((0..items).map(make_member_record).collect())
        .tag("member")
        .app_id("app")
        .group_id(TEST_GROUP)
        .created_by(TEST_ACTOR)
        .created_by_type(TEST_ACTOR_TYPE)
        .batch_size(batch_size)
        .build()
}

async fn live_count(storage: &MemoryObjStorage) -> usize {
    storage
        .read(ReadParams::builder().query(ObjQuery::for_app("app")).tag("member").build())
        .await
        .expect("read")
        .objs
        .len()
}

#[tokio::test]
async fn bulk_upsert_failure_keeps_earlier_chunks() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("bulk-upsert-before-write", "1*off->return").expect("failed to configure fail point");

    let storage = MemoryObjStorage::new();
    let result = storage.bulk_upsert(upsert(4, 2)).await;

    assert!(matches!(result, Err(StorageError::Internal { .. })), "got {result:?}");
    assert_eq!(live_count(&storage).await, 2, "the first chunk stays written");

    scenario.teardown();
}

#[tokio::test]
async fn bulk_upsert_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    // No fail point configured, the upsert should succeed normally

    let storage = MemoryObjStorage::new();
    let result = storage.bulk_upsert(upsert(4, 2)).await.expect("upsert");

    assert_eq!(result.new_objs.len(), 4);
    assert_eq!(live_count(&storage).await, 4);

    scenario.teardown();
}

#[tokio::test]
async fn bulk_update_failure_stops_after_failed_chunk() {
    let scenario = fail::FailScenario::setup();
    let storage = MemoryObjStorage::new();
    storage.bulk_upsert(upsert(5, 10)).await.expect("seed");

    fail::cfg("bulk-update-chunk", "1*off->return").expect("failed to configure fail point");
    let result = storage
        .bulk_update(
            BulkUpdateParams::builder()
                .query(ObjQuery::for_app("app"))
                .tag("member")
                .update(record(json!({"flagged": true})))
                .by("bulk")
                .by_type("system")
                .batch_size(2)
                .build(),
        )
        .await;
    assert!(result.is_err(), "bulk update should fail when fail point is active");

    let flagged = storage
        .read(
            ReadParams::builder()
                .query(
                    ObjQuery::builder()
                        .app_id("app")
                        .part_query(PartQuery::all([Predicate::eq("flagged", true)]))
                        .build(),
                )
                .tag("member")
                .build(),
        )
        .await
        .expect("read");
    assert_eq!(flagged.objs.len(), 2, "only the chunk before the failure was updated");

    scenario.teardown();
}

#[tokio::test]
async fn transaction_commit_failpoint_discards_changes() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("memory-before-commit", "return").expect("failed to configure fail point");

    let storage = MemoryObjStorage::new();
    let result = storage
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.bulk_upsert(upsert(3, 10)).await?;
                Ok::<_, StorageError>(())
            })
        })
        .await;

    assert_transaction_aborted!(result);
    assert!(storage.is_empty(), "an aborted commit writes nothing");

    scenario.teardown();
}
