//! MongoDB implementation of [`ObjStorage`](fimidx_storage::ObjStorage).
//!
//! This crate provides [`MongoObjStorage`], which keeps every object of every
//! tenant in a single collection and translates the shared query model into
//! native MongoDB filters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 fimidx-storage (ObjStorage)                 │
//! │        ObjQuery ─► ObjFilter      bulk pipeline             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     MongoObjStorage                         │
//! │   filter: ObjFilter ─► query document, sort document        │
//! │   document: Obj ◄─► BSON envelope                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     mongodb driver                          │
//! │   Client │ ClientSession │ Collection<Document>             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! // Requires a running MongoDB replica set.
//! use fimidx_storage::{ObjQuery, ObjStorage, ReadParams};
//! use fimidx_storage_mongo::{MongoConfig, MongoObjStorage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MongoConfig::builder()
//!         .uri("mongodb://localhost:27017/?replicaSet=rs0")
//!         .database("fimidx")
//!         .build()?;
//!     let storage = MongoObjStorage::connect(config).await?;
//!
//!     let page = storage
//!         .read(ReadParams::builder().query(ObjQuery::for_app("app-1")).tag("member").build())
//!         .await?;
//!     println!("{} members", page.objs.len());
//!     Ok(())
//! }
//! ```
//!
//! # Document Layout
//!
//! | Obj field | Stored as |
//! | --------- | --------- |
//! | `id` | `_id` (string) |
//! | `obj_record` | `objRecord` (embedded document) |
//! | timestamps | BSON dates, millisecond precision |
//! | `deleted_*` | `null` while live |
//! | other envelope fields | camelCase keys |
//!
//! # Divergences
//!
//! MongoDB resolves dotted paths through arrays on its own. A record path
//! with no array-capable descriptor therefore still matches elements of an
//! array it crosses, where the in-memory backend would compare the array as a
//! whole. `create` checks for existing ids before inserting, but outside a
//! transaction a concurrent writer can still slip in between.

#![deny(unsafe_code)]

mod backend;
mod config;
mod document;
mod error;
mod filter;

pub use backend::MongoObjStorage;
pub use config::{DEFAULT_COLLECTION, MongoConfig};
pub use error::{MongoStorageError, Result};
