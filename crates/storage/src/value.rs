//! Schema-less record values.
//!
//! A stored object's payload is an [`ObjRecord`]: a map of string keys to
//! [`Value`]s, nested arbitrarily. Query evaluation, merging and conflict
//! detection all pattern-match over this one enum.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::error::{StorageError, StorageResult};

/// The payload of a stored object.
pub type ObjRecord = BTreeMap<String, Value>;

/// A recursive, JSON-shaped value.
///
/// Serializes exactly like the equivalent `serde_json::Value`, so records can
/// be exchanged with JSON APIs and drivers without a custom wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    /// JSON `null`.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer or a finite float.
    Number(Number),
    /// A UTF-8 string.
    String(String),
    /// An ordered list.
    Array(Vec<Value>),
    /// A nested map with sorted keys.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
        }
    }

    /// Returns `true` for booleans, numbers and strings.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Bool(_) | Self::Number(_) | Self::String(_))
    }

    /// Returns the string slice if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number as `f64` if this is a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Returns the elements if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Equality that treats `1` and `1.0` as the same number.
    ///
    /// Both database backends compare numbers by magnitude, so query
    /// evaluation uses this instead of `==`.
    #[must_use]
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.as_f64() == b.as_f64(),
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            },
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            },
            _ => self == other,
        }
    }

    /// Orders two scalars of the same type.
    ///
    /// Returns `None` when the types differ or either side is not a scalar;
    /// range predicates never match across types.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Rank used to order values of different types when sorting.
    fn sort_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Number(_) => 1,
            Self::String(_) => 2,
            Self::Map(_) => 3,
            Self::Array(_) => 4,
            Self::Bool(_) => 5,
        }
    }

    /// Total order for sort keys. Missing values sort first, like `null`.
    #[must_use]
    pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
        let a = a.unwrap_or(&Value::Null);
        let b = b.unwrap_or(&Value::Null);
        match a.sort_rank().cmp(&b.sort_rank()) {
            Ordering::Equal => match (a, b) {
                (Self::Number(x), Self::Number(y)) => {
                    let x = x.as_f64().unwrap_or(0.0);
                    let y = y.as_f64().unwrap_or(0.0);
                    x.total_cmp(&y)
                },
                (Self::String(x), Self::String(y)) => x.cmp(y),
                (Self::Bool(x), Self::Bool(y)) => x.cmp(y),
                _ => Ordering::Equal,
            },
            other => other,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Value::from).collect())
            },
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            },
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Into::into).collect()),
            Value::Map(map) => Self::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON form and become `Null`.
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Array(value)
    }
}

impl From<ObjRecord> for Value {
    fn from(value: ObjRecord) -> Self {
        Self::Map(value)
    }
}

/// Converts a JSON object into a record.
///
/// # Errors
///
/// Returns [`StorageError::Validation`] if `json` is not an object.
pub fn record_from_json(json: serde_json::Value) -> StorageResult<ObjRecord> {
    match Value::from(json) {
        Value::Map(map) => Ok(map),
        other => Err(StorageError::validation(format!(
            "record must be a map, got {}",
            other.type_name()
        ))),
    }
}

/// Converts a record into a JSON object.
#[must_use]
pub fn record_to_json(record: &ObjRecord) -> serde_json::Value {
    serde_json::Value::Object(
        record.iter().map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone()))).collect(),
    )
}

/// Splits a dot-notation path into its segments.
#[must_use]
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Follows `path` through nested maps only.
///
/// Returns `None` as soon as a segment is missing or a non-map is crossed.
#[must_use]
pub fn get_path<'a>(record: &'a ObjRecord, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_map()?.get(segment)?;
    }
    Some(current)
}

/// Collects every value reachable at `segments`, fanning out over arrays.
///
/// Arrays met on the way are expanded element by element. When
/// `unwrap_leaf` is set, an array found at the end of the path contributes
/// its elements instead of itself.
pub fn resolve_lax<'a>(
    value: &'a Value,
    segments: &[&str],
    unwrap_leaf: bool,
    out: &mut Vec<&'a Value>,
) {
    match (segments.split_first(), value) {
        (None, Value::Array(items)) if unwrap_leaf => out.extend(items.iter()),
        (None, _) => out.push(value),
        (Some(_), Value::Array(items)) => {
            for item in items {
                resolve_lax(item, segments, unwrap_leaf, out);
            }
        },
        (Some((head, rest)), Value::Map(map)) => {
            if let Some(child) = map.get(*head) {
                resolve_lax(child, rest, unwrap_leaf, out);
            }
        },
        (Some(_), _) => {},
    }
}
