//! The stored object envelope.
//!
//! Every entity the product persists (apps, members, permissions, callbacks,
//! client tokens, monitors) is an [`Obj`] whose `tag` says which one it is.
//! The envelope carries tenancy, audit and soft-delete metadata around the
//! schema-less [`ObjRecord`](crate::ObjRecord).

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::ObjRecord;

/// Current time at millisecond precision.
///
/// Both backends store milliseconds at most, so truncating here keeps a
/// freshly built object equal to its stored copy.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// The instant at or before which soft-deleted objects may be purged.
///
/// Saturates to the earliest representable time for huge retentions.
#[must_use]
pub fn retention_cutoff(retention: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(retention)
        .ok()
        .and_then(|delta| now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Generates a new object id (UUID v7, time ordered).
#[must_use]
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// A persisted object.
///
/// Invariants upheld by every backend:
///
/// - `id` is unique and never reused
/// - `tag` never changes after creation
/// - once `deleted_at` is set, updates never clear it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Obj {
    /// Unique, immutable identifier.
    pub id: String,
    /// Tenant scope.
    pub app_id: String,
    /// Sub-tenant scope.
    pub group_id: String,
    /// Entity discriminator.
    pub tag: String,
    /// The schema-less payload.
    pub obj_record: ObjRecord,
    /// Server-assigned creation time.
    pub created_at: DateTime<Utc>,
    /// Server-assigned time of the last update.
    pub updated_at: DateTime<Utc>,
    /// Actor that created the object.
    pub created_by: String,
    /// Kind of the creating actor (user, system, client token, ...).
    pub created_by_type: String,
    /// Actor that last updated the object.
    pub updated_by: String,
    /// Kind of the last updating actor.
    pub updated_by_type: String,
    /// Soft-delete marker. `None` means live.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Actor that deleted the object.
    #[serde(default)]
    pub deleted_by: Option<String>,
    /// Kind of the deleting actor.
    #[serde(default)]
    pub deleted_by_type: Option<String>,
    /// Whether reindexing sweeps should pick this object up.
    pub should_index: bool,
    /// Record paths the indexer should track. `None` means all of them.
    #[serde(default)]
    pub fields_to_index: Option<Vec<String>>,
}

#[bon::bon]
impl Obj {
    /// Builds a new live object with a fresh id and timestamps.
    ///
    /// `id` and `now` can be supplied to make construction deterministic.
    #[builder]
    pub fn new(
        #[builder(into)] app_id: String,
        #[builder(into)] group_id: String,
        #[builder(into)] tag: String,
        obj_record: ObjRecord,
        #[builder(into)] created_by: String,
        #[builder(into)] created_by_type: String,
        #[builder(default = true)] should_index: bool,
        fields_to_index: Option<Vec<String>>,
        #[builder(into)] id: Option<String>,
        now: Option<DateTime<Utc>>,
    ) -> Self {
        let now = now.unwrap_or_else(self::now);
        Self {
            id: id.unwrap_or_else(new_id),
            app_id,
            group_id,
            tag,
            obj_record,
            created_at: now,
            updated_at: now,
            updated_by: created_by.clone(),
            updated_by_type: created_by_type.clone(),
            created_by,
            created_by_type,
            deleted_at: None,
            deleted_by: None,
            deleted_by_type: None,
            should_index,
            fields_to_index,
        }
    }
}

impl Obj {
    /// Returns `true` once the object has been soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Stamps the update audit fields.
    pub fn touch(&mut self, by: &str, by_type: &str, at: DateTime<Utc>) {
        self.updated_at = at;
        self.updated_by = by.to_owned();
        self.updated_by_type = by_type.to_owned();
    }

    /// Marks the object deleted. Already deleted objects are left alone.
    ///
    /// Returns `true` if the object transitioned from live to deleted.
    pub fn mark_deleted(&mut self, by: &str, by_type: &str, at: DateTime<Utc>) -> bool {
        if self.is_deleted() {
            return false;
        }
        self.deleted_at = Some(at);
        self.deleted_by = Some(by.to_owned());
        self.deleted_by_type = Some(by_type.to_owned());
        true
    }
}
