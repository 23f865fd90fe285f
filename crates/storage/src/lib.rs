//! Multi-tenant, schema-less object storage for fimidx.
//!
//! This crate defines the [`ObjStorage`] contract, the query model callers
//! use to address objects, and the backend-independent pieces every
//! implementation shares: query planning against the [`FieldIndex`], merge
//! strategies, and the chunked bulk write pipeline. Database backends live in
//! their own crates and only translate an [`ObjFilter`](plan::ObjFilter) into
//! native filters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                           │
//! │       (members, permissions, logs, monitors, ...)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    fimidx-storage                           │
//! │   ObjQuery ─► QueryPlan ─► ObjFilter     FieldIndex         │
//! │   ObjStorage trait   bulk pipeline   merge strategies       │
//! ├────────────────┬───────────────────┬────────────────────────┤
//! │MemoryObjStorage│  MongoObjStorage  │  PostgresObjStorage    │
//! │   (testing)    │ (fimidx-storage-  │ (fimidx-storage-       │
//! │                │  mongo)           │  postgres)             │
//! └────────────────┴───────────────────┴────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use fimidx_storage::{
//!     BulkUpsertParams, MemoryObjStorage, ObjQuery, ObjStorage, OnConflict, PartQuery,
//!     Predicate, ReadParams, record_from_json,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = MemoryObjStorage::new();
//!
//!     let items = vec![
//!         record_from_json(json!({"email": "ada@example.com", "role": "admin"}))?,
//!         record_from_json(json!({"email": "ada@example.com", "role": "owner"}))?,
//!     ];
//!     let result = storage
//!         .bulk_upsert(
//!             BulkUpsertParams::builder()
//!                 .items(items)
//!                 .conflict_on_keys(vec!["email".into()])
//!                 .on_conflict(OnConflict::Ignore)
//!                 .tag("member")
//!                 .app_id("app-1")
//!                 .group_id("org-1")
//!                 .created_by("user-1")
//!                 .created_by_type("user")
//!                 .build(),
//!         )
//!         .await?;
//!     assert_eq!(result.new_objs.len(), 1);
//!     assert_eq!(result.ignored_items.len(), 1);
//!
//!     let query = ObjQuery::builder()
//!         .app_id("app-1")
//!         .part_query(PartQuery::all([Predicate::eq("role", "admin")]))
//!         .build();
//!     let page = storage.read(ReadParams::builder().query(query).tag("member").build()).await?;
//!     assert_eq!(page.objs.len(), 1);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Use Case | Persistence |
//! |---------|----------|-------------|
//! | [`MemoryObjStorage`] | Testing, reference semantics | No |
//! | `MongoObjStorage` (in `fimidx-storage-mongo`) | Production | Yes |
//! | `PostgresObjStorage` (in `fimidx-storage-postgres`) | Production | Yes |
//!
//! # Error Handling
//!
//! All operations return [`StorageResult<T>`]. Backends map their driver
//! errors onto the shared [`StorageError`] taxonomy.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the [`conformance`] suite and the `testutil` module (record and
//!   object factories, assertion macros). Backend crates enable it in `[dev-dependencies]`.
//! - **`failpoints`**: Turns on `fail_point!` injection in the bulk pipeline and the in-memory
//!   transaction commit.

#![deny(unsafe_code)]

pub mod backend;
pub mod bulk;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod field;
pub mod health;
pub mod memory;
pub mod merge;
pub mod obj;
pub mod plan;
pub mod query;
pub mod sort;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod value;

pub use backend::{
    BulkDeleteParams, BulkUpdateParams, BulkUpsertParams, BulkUpsertResult, CleanupResult,
    DeleteParams, DeleteResult, FailedItem, ObjStorage, OnConflict, ReadParams, ReadResult,
    TransactionalStorage, UpdateParams, UpdateResult,
};
pub use bulk::{IdChunks, Identity, UpsertBatch, UpsertScope};
pub use config::StorageConfig;
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use field::{FieldDescriptor, FieldIndex, FieldType};
pub use health::HealthReport;
pub use memory::MemoryObjStorage;
pub use merge::{UpdateWay, merge_records};
pub use obj::Obj;
pub use plan::{Lifecycle, ObjFilter, QueryPlan};
pub use query::{
    Condition, LikePattern, MetaField, MetaOps, MetaQuery, ObjQuery, PartQuery, Predicate,
    QueryOp, TopLevelFields,
};
pub use sort::{SortDirection, SortField};
pub use value::{ObjRecord, Value, record_from_json, record_to_json};
