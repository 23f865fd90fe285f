//! Conformance suite run against `MemoryObjStorage`.
//!
//! Each test function corresponds to a single conformance check, providing
//! fine-grained failure reporting. The `run_all` test exercises the full
//! suite against one shared store to verify the checks stay independent.

#![allow(clippy::expect_used, clippy::panic)]

use fimidx_storage::{MemoryObjStorage, conformance};

// ============================================================================
// Round trip
// ============================================================================

#[tokio::test]
async fn roundtrip_create_then_read() {
    conformance::roundtrip_create_then_read(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn create_duplicate_id_conflicts() {
    conformance::create_duplicate_id_conflicts(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn read_is_scoped_by_app_group_and_tag() {
    conformance::read_is_scoped_by_app_group_and_tag(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn read_pages_report_has_more() {
    conformance::read_pages_report_has_more(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn read_default_sort_is_created_at_desc() {
    conformance::read_default_sort_is_created_at_desc(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn meta_query_filters_envelope() {
    conformance::meta_query_filters_envelope(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Soft delete
// ============================================================================

#[tokio::test]
async fn delete_hides_from_live_reads() {
    conformance::delete_hides_from_live_reads(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn delete_is_monotonic() {
    conformance::delete_is_monotonic(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn cleanup_purges_deleted() {
    conformance::cleanup_purges_deleted(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Conflict resolution
// ============================================================================

#[tokio::test]
async fn bulk_upsert_ignore_keeps_existing() {
    conformance::bulk_upsert_ignore_keeps_existing(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn bulk_upsert_replace_keeps_identity() {
    conformance::bulk_upsert_replace_keeps_identity(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn bulk_upsert_fail_reports_items() {
    conformance::bulk_upsert_fail_reports_items(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn bulk_upsert_without_identity_inserts() {
    conformance::bulk_upsert_without_identity_inserts(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn bulk_zero_batch_size_is_validation() {
    conformance::bulk_zero_batch_size_is_validation(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Merge
// ============================================================================

#[tokio::test]
async fn update_replace_is_shallow() {
    conformance::update_replace_is_shallow(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn update_merge_ways() {
    conformance::update_merge_ways(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Batching invariance
// ============================================================================

#[tokio::test]
async fn bulk_upsert_batching_invariance() {
    conformance::bulk_upsert_batching_invariance(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn bulk_update_batching_invariance() {
    conformance::bulk_update_batching_invariance(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn bulk_delete_respects_delete_many() {
    conformance::bulk_delete_respects_delete_many(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn transaction_commits_all() {
    conformance::transaction_commits_all(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn transaction_error_rolls_back() {
    conformance::transaction_error_rolls_back(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Array paths
// ============================================================================

#[tokio::test]
async fn array_path_query_scenario() {
    conformance::array_path_query_scenario(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn unindexed_array_path_scenario() {
    conformance::unindexed_array_path_scenario(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn element_predicates_match_one_element_scenario() {
    conformance::element_predicates_match_one_element_scenario(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn array_path_range_scenario() {
    conformance::array_path_range_scenario(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn nested_array_path_scenario() {
    conformance::nested_array_path_scenario(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Sorting
// ============================================================================

#[tokio::test]
async fn sort_fallback_scenario() {
    conformance::sort_fallback_scenario(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn sort_by_type_rank_scenario() {
    conformance::sort_by_type_rank_scenario(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Errors and health
// ============================================================================

#[tokio::test]
async fn invalid_meta_operand_is_validation() {
    conformance::invalid_meta_operand_is_validation(&MemoryObjStorage::new()).await;
}

#[tokio::test]
async fn health_check_reports_backend() {
    conformance::health_check_reports_backend(&MemoryObjStorage::new()).await;
}

// ============================================================================
// Full suite
// ============================================================================

#[tokio::test]
async fn run_all_against_one_store() {
    let storage = MemoryObjStorage::new();
    conformance::run_all(&storage).await;
    assert!(!storage.is_empty());
}
