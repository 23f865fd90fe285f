//! PostgreSQL implementation of [`ObjStorage`](fimidx_storage::ObjStorage).
//!
//! This crate provides [`PostgresObjStorage`], which keeps every object of
//! every tenant in one table: envelope fields as columns, the record as a
//! `jsonb` document queried through `#>`, `jsonb_array_elements` and
//! `jsonpath`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 fimidx-storage (ObjStorage)                 │
//! │        ObjQuery ─► ObjFilter      bulk pipeline             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    PostgresObjStorage                       │
//! │   filter: ObjFilter ─► WHERE / ORDER BY (QueryBuilder)      │
//! │   row: Obj ◄─► ObjRow                                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                          sqlx                               │
//! │   PgPool │ Transaction<Postgres>                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! // Requires a running PostgreSQL server.
//! use fimidx_storage::{ObjQuery, ObjStorage, ReadParams};
//! use fimidx_storage_postgres::{PostgresConfig, PostgresObjStorage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PostgresConfig::builder().url("postgres://localhost/fimidx").build()?;
//!     let storage = PostgresObjStorage::connect(config).await?;
//!
//!     let page = storage
//!         .read(ReadParams::builder().query(ObjQuery::for_app("app-1")).tag("member").build())
//!         .await?;
//!     println!("{} members", page.objs.len());
//!     Ok(())
//! }
//! ```
//!
//! # Table Layout
//!
//! | Obj field | Column |
//! | --------- | ------ |
//! | `id` | `id TEXT PRIMARY KEY` |
//! | `obj_record` | `obj_record JSONB` |
//! | timestamps | `TIMESTAMPTZ` |
//! | `deleted_*` | nullable, `NULL` while live |
//! | `fields_to_index` | `TEXT[]`, `NULL` for all fields |
//!
//! # Divergences
//!
//! Comparisons on text use the `"C"` collation, so strings order by bytes as
//! they do in memory. Date fields sort as raw `jsonb`, which orders ISO
//! strings and epoch numbers correctly but puts every number before every
//! string.

#![deny(unsafe_code)]

mod backend;
mod config;
mod error;
mod filter;
mod row;
mod schema;

pub use backend::PostgresObjStorage;
pub use config::{DEFAULT_TABLE, PostgresConfig};
pub use error::{PostgresStorageError, Result};
