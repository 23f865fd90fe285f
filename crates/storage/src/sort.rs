//! Sort specifications and their resolution against the field index.
//!
//! Callers name sort fields loosely: `objRecord.age`, `record.age` or an
//! envelope name such as `createdAt`. [`resolve_sort`] turns that list into
//! [`SortKey`]s a backend can emit, dropping whatever it cannot sort on.

use serde::{Deserialize, Serialize};

use crate::{field::FieldIndex, query::MetaField};

const RECORD_PREFIXES: [&str; 2] = ["objRecord.", "record."];

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Smallest first. Missing values come first.
    #[default]
    Asc,
    /// Largest first. Missing values come last.
    Desc,
}

/// One caller-supplied sort entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    /// Envelope name or `objRecord.`-prefixed record path.
    pub field: String,
    /// Direction, ascending when omitted.
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortField {
    /// Ascending on `field`.
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Asc }
    }

    /// Descending on `field`.
    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Desc }
    }
}

/// What a resolved sort key orders by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortTarget {
    /// An envelope field.
    Envelope(MetaField),
    /// A record path that has a field descriptor.
    ///
    /// Values order by JSON type first (missing and `null`, then numbers,
    /// strings, objects, arrays, booleans) and by value within a type. The
    /// descriptor's declared type plays no part in the order.
    Record {
        /// Dot-notation path inside the record.
        path: String,
    },
}

/// A sort key a backend can emit directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// What to order by.
    pub target: SortTarget,
    /// In which direction.
    pub direction: SortDirection,
}

impl SortKey {
    fn envelope(field: MetaField, direction: SortDirection) -> Self {
        Self { target: SortTarget::Envelope(field), direction }
    }
}

/// Resolves caller sort entries into backend sort keys.
///
/// Record paths without a descriptor and unknown envelope names are dropped
/// with a `debug!` log. If nothing survives, objects sort by `createdAt`
/// descending. An ascending `id` key is appended as a final tiebreaker so
/// pagination is stable.
#[must_use]
pub fn resolve_sort(sort: &[SortField], fields: &FieldIndex) -> Vec<SortKey> {
    let mut keys: Vec<SortKey> = sort
        .iter()
        .filter_map(|entry| {
            let target = resolve_target(&entry.field, fields);
            if target.is_none() {
                tracing::debug!(field = %entry.field, "dropping unsortable sort field");
            }
            target.map(|target| SortKey { target, direction: entry.direction })
        })
        .collect();

    if keys.is_empty() {
        keys.push(SortKey::envelope(MetaField::CreatedAt, SortDirection::Desc));
    }
    if !keys.iter().any(|k| k.target == SortTarget::Envelope(MetaField::Id)) {
        keys.push(SortKey::envelope(MetaField::Id, SortDirection::Asc));
    }
    keys
}

fn resolve_target(field: &str, fields: &FieldIndex) -> Option<SortTarget> {
    if let Some(path) = RECORD_PREFIXES.iter().find_map(|p| field.strip_prefix(p)) {
        fields.get(path)?;
        return Some(SortTarget::Record { path: path.to_owned() });
    }
    MetaField::from_name(field).map(SortTarget::Envelope)
}
