//! Integration test verifying that `#[instrument]` annotations produce
//! the expected spans and fields on `MemoryObjStorage` operations.

#![allow(clippy::expect_used)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use fimidx_storage::{
    BulkUpdateParams, BulkUpsertParams, MemoryObjStorage, ObjQuery, ObjStorage, ReadParams,
    StorageError, TransactionalStorage,
    testutil::{TEST_ACTOR, TEST_ACTOR_TYPE, TEST_GROUP, make_member_record, record},
};
use serde_json::json;
use tracing::{
    Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names and their fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct RecordedSpan {
    name: String,
    fields: BTreeMap<String, String>,
}

struct FieldVisitor<'a>(&'a mut BTreeMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }
}

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
    ids: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut recorded = RecordedSpan { name: span.name().to_owned(), ..Default::default() };
            attrs.record(&mut FieldVisitor(&mut recorded.fields));
            let mut spans = self.spans.lock().expect("lock poisoned");
            self.ids.lock().expect("lock poisoned").insert(id.into_u64(), spans.len());
            spans.push(recorded);
        }
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let Some(idx) = self.ids.lock().expect("lock poisoned").get(&id.into_u64()).copied() else {
            return;
        };
        if let Some(span) = self.spans.lock().expect("lock poisoned").get_mut(idx) {
            values.record(&mut FieldVisitor(&mut span.fields));
        }
    }
}

impl SpanCollector {
    fn find(&self, name: &str) -> Option<RecordedSpan> {
        self.spans.lock().expect("lock poisoned").iter().find(|s| s.name == name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.spans.lock().expect("lock poisoned").iter().map(|s| s.name.clone()).collect()
    }
}

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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bulk_upsert_span_records_batch_size() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = MemoryObjStorage::new();
    storage.bulk_upsert(upsert(5, 2)).await.expect("upsert should succeed");

    let span = collector.find("bulk_upsert").expect("expected a 'bulk_upsert' span");
    assert_eq!(span.fields.get("tag").map(String::as_str), Some("member"));
    assert_eq!(span.fields.get("count").map(String::as_str), Some("5"));
    assert_eq!(span.fields.get("batch_size").map(String::as_str), Some("2"));

    let names = collector.names();
    assert_eq!(
        names.iter().filter(|n| *n == "write_upsert_batch").count(),
        3,
        "one write per chunk, got: {names:?}"
    );
}

#[tokio::test]
async fn read_span_carries_scope() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = MemoryObjStorage::new();
    storage
        .read(ReadParams::builder().query(ObjQuery::for_app("app-7")).tag("log").build())
        .await
        .expect("read should succeed");

    let span = collector.find("read").expect("expected a 'read' span");
    assert_eq!(span.fields.get("tag").map(String::as_str), Some("log"));
    assert_eq!(span.fields.get("app_id").map(String::as_str), Some("app-7"));
}

#[tokio::test]
async fn bulk_update_spans_nest_chunked_updates() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = MemoryObjStorage::new();
    storage.bulk_upsert(upsert(4, 10)).await.expect("seed");
    storage
        .bulk_update(
            BulkUpdateParams::builder()
                .query(ObjQuery::for_app("app"))
                .tag("member")
                .update(record(json!({"seen": true})))
                .by("bulk")
                .by_type("system")
                .batch_size(3)
                .build(),
        )
        .await
        .expect("bulk update should succeed");

    let span = collector.find("bulk_update").expect("expected a 'bulk_update' span");
    assert_eq!(span.fields.get("batch_size").map(String::as_str), Some("3"));
    let names = collector.names();
    assert_eq!(names.iter().filter(|n| *n == "update").count(), 2, "got: {names:?}");
}

#[tokio::test]
async fn transaction_creates_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = MemoryObjStorage::new();
    storage
        .with_transaction(|tx| {
            Box::pin(async move { Ok::<_, StorageError>(tx.config().batch_size()) })
        })
        .await
        .expect("transaction should commit");

    let names = collector.names();
    assert!(
        names.iter().any(|n| n == "with_transaction"),
        "expected a 'with_transaction' span, got: {names:?}"
    );
}

#[tokio::test]
async fn cleanup_creates_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let storage = MemoryObjStorage::new();
    storage.cleanup_deleted_objs().await.expect("cleanup should succeed");

    let names = collector.names();
    assert!(
        names.iter().any(|n| n == "cleanup_deleted_objs"),
        "expected a 'cleanup_deleted_objs' span, got: {names:?}"
    );
}
