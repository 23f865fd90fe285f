//! Runtime backend selection for fimidx object storage.
//!
//! A deployment names its backend in configuration; [`ObjStore::connect`]
//! turns that [`StoreConfig`] into an [`ObjStore`], which implements
//! [`ObjStorage`](fimidx_storage::ObjStorage) and
//! [`TransactionalStorage`](fimidx_storage::TransactionalStorage) by static
//! dispatch onto the chosen backend.
//!
//! # Available Backends
//!
//! | `type` | Variant | Feature | Use Case |
//! |--------|---------|---------|----------|
//! | `memory` | [`ObjStore::Memory`] | always | Testing, development |
//! | `mongo` | `ObjStore::Mongo` | `mongo` | MongoDB deployments |
//! | `postgres` | `ObjStore::Postgres` | `postgres` | PostgreSQL deployments |
//!
//! # Usage
//!
//! ```
//! use fimidx_objstore::{ObjStore, StoreConfig};
//! use fimidx_storage::{ObjQuery, ObjStorage, ReadParams};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config: StoreConfig = serde_json::from_str(r#"{ "type": "memory" }"#)?;
//! let store = ObjStore::connect(config).await?;
//!
//! let page = store
//!     .read(ReadParams::builder().query(ObjQuery::for_app("app-1")).tag("member").build())
//!     .await?;
//! assert!(page.objs.is_empty());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

mod config;
mod store;

pub use config::StoreConfig;
pub use store::ObjStore;
