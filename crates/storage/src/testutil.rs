//! Shared test utilities for object storage testing.
//!
//! Record and object factories, seeding helpers and assertion macros used by
//! the [`conformance`](crate::conformance) suite, the integration tests of
//! every backend crate and the benchmarks. It is feature-gated behind
//! `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! fimidx-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use fimidx_storage::testutil::{make_obj, record, unique_app_id};
//! ```

use rand::{Rng, seq::SliceRandom};

use crate::{
    ObjStorage,
    error::{StorageError, StorageResult},
    obj::{self, Obj},
    value::{ObjRecord, record_from_json},
};

/// Group id used by the factories unless a test picks its own.
pub const TEST_GROUP: &str = "group-1";

/// Actor recorded as creator by the factories.
pub const TEST_ACTOR: &str = "tester";

/// Actor kind recorded by the factories.
pub const TEST_ACTOR_TYPE: &str = "user";

/// Returns an app id no other test uses, so checks can share one backend.
#[must_use]
pub fn unique_app_id(prefix: &str) -> String {
    format!("{prefix}-{}", obj::new_id())
}

/// Builds a record from a JSON object literal.
///
/// # Panics
///
/// Panics if `json` is not an object.
#[must_use]
pub fn record(json: serde_json::Value) -> ObjRecord {
    record_from_json(json).expect("test record must be a JSON object")
}

/// Builds a live object in [`TEST_GROUP`] owned by [`TEST_ACTOR`].
#[must_use]
pub fn make_obj(app_id: &str, tag: &str, obj_record: ObjRecord) -> Obj {
    Obj::builder()
        .app_id(app_id)
        .group_id(TEST_GROUP)
        .tag(tag)
        .obj_record(obj_record)
        .created_by(TEST_ACTOR)
        .created_by_type(TEST_ACTOR_TYPE)
        .build()
}

/// A deterministic member-like record: `{"name", "email", "age", "active"}`.
///
/// Names and emails are zero-padded so lexical order follows `idx`.
#[must_use]
pub fn make_member_record(idx: usize) -> ObjRecord {
    record(serde_json::json!({
        "name": format!("member-{idx:04}"),
        "email": format!("member-{idx:04}@example.com"),
        "age": idx,
        "active": idx % 2 == 0,
    }))
}

/// A random record with a nested map and an array, for fuzz-style tests.
#[must_use]
pub fn random_record<R: Rng + ?Sized>(rng: &mut R) -> ObjRecord {
    let roles = ["admin", "owner", "viewer", "editor"];
    let count = rng.gen_range(0..=roles.len());
    let picked: Vec<&str> = roles.choose_multiple(rng, count).copied().collect();
    record(serde_json::json!({
        "score": rng.gen_range(0..1000),
        "label": format!("label-{}", rng.gen_range(0..50)),
        "profile": {"level": rng.gen_range(1..=5), "verified": rng.gen_bool(0.5)},
        "roles": picked,
    }))
}

/// Inserts one object per record into `storage` and returns them.
///
/// # Panics
///
/// Panics if the create fails.
pub async fn seed<S: ObjStorage + ?Sized>(
    storage: &S,
    app_id: &str,
    tag: &str,
    records: impl IntoIterator<Item = ObjRecord>,
) -> Vec<Obj> {
    let objs: Vec<Obj> = records.into_iter().map(|r| make_obj(app_id, tag, r)).collect();
    storage.create(objs).await.expect("seeding objects failed")
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use fimidx_storage::{StorageError, StorageResult, assert_conflict};
///
/// let result: StorageResult<()> = Err(StorageError::conflict("duplicate id"));
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict { .. })),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict { .. })),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::Validation`].
#[macro_export]
macro_rules! assert_validation {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Validation { .. })),
            "expected StorageError::Validation, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::TransactionAborted`].
#[macro_export]
macro_rules! assert_transaction_aborted {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::TransactionAborted { .. })),
            "expected StorageError::TransactionAborted, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is `Ok` and return the inner value.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use fimidx_storage::{StorageResult, assert_storage_ok};
///
/// let result: StorageResult<i32> = Ok(42);
/// let value = assert_storage_ok!(result);
/// assert_eq!(value, 42);
/// ```
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}

/// Returns `true` if the result is a `Conflict` error.
pub fn is_conflict<T>(result: &StorageResult<T>) -> bool {
    matches!(result, Err(StorageError::Conflict { .. }))
}

/// Returns `true` if the result is a `NotFound` error.
pub fn is_not_found<T>(result: &StorageResult<T>) -> bool {
    matches!(result, Err(StorageError::NotFound { .. }))
}
