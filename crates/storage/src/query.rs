//! The backend-agnostic query model.
//!
//! A caller describes what to match with an [`ObjQuery`]: tenancy scope,
//! record predicates ([`PartQuery`]), envelope constraints ([`MetaQuery`])
//! and exact-match envelope flags ([`TopLevelFields`]). Nothing here talks to
//! a database; the backends lower these values through
//! [`plan`](crate::plan) into native filters.
//!
//! Predicates are validated when constructed. An unknown operator or a value
//! of the wrong shape is a [`StorageError::Validation`], raised before any
//! backend is touched.
//!
//! # Example
//!
//! ```
//! use fimidx_storage::query::{ObjQuery, PartQuery, Predicate};
//!
//! let query = ObjQuery::builder()
//!     .app_id("app-1")
//!     .part_query(PartQuery::all([
//!         Predicate::eq("reportsTo.userId", "user1"),
//!         Predicate::gte("age", 18_i64),
//!     ]))
//!     .build();
//! assert_eq!(query.part_query.map(|q| q.and.len()), Some(2));
//! ```

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{StorageError, StorageResult},
    value::{ObjRecord, Value},
};

/// Predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOp {
    /// Equal to a scalar.
    Eq,
    /// Present and not equal to a scalar.
    Neq,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Equal to one of a list.
    In,
    /// Present and equal to none of a list.
    NotIn,
    /// Inside a closed interval.
    Between,
    /// Path presence.
    Exists,
    /// Regular expression match on strings.
    Like,
}

impl QueryOp {
    /// Every operator, in declaration order.
    pub const ALL: [QueryOp; 11] = [
        Self::Eq,
        Self::Neq,
        Self::Gt,
        Self::Gte,
        Self::Lt,
        Self::Lte,
        Self::In,
        Self::NotIn,
        Self::Between,
        Self::Exists,
        Self::Like,
    ];

    /// The wire name of the operator.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Between => "between",
            Self::Exists => "exists",
            Self::Like => "like",
        }
    }
}

impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryOp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| StorageError::validation(format!("unknown query operator '{s}'")))
    }
}

/// A validated operator together with its operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Equal to the value.
    Eq(Value),
    /// Present and not equal to the value.
    Neq(Value),
    /// Greater than the value.
    Gt(Value),
    /// Greater than or equal to the value.
    Gte(Value),
    /// Less than the value.
    Lt(Value),
    /// Less than or equal to the value.
    Lte(Value),
    /// Equal to one of the values.
    In(Vec<Value>),
    /// Present and equal to none of the values.
    NotIn(Vec<Value>),
    /// Inside `[low, high]`, both ends inclusive.
    Between(Value, Value),
    /// Presence (`true`) or absence (`false`) of the path.
    Exists(bool),
    /// Unanchored regular expression match.
    Like(LikePattern),
}

/// A `like` pattern, compiled once when the condition is validated.
///
/// Equality and `Debug` go by the source text.
#[derive(Clone)]
pub struct LikePattern {
    source: String,
    regex: regex::Regex,
}

impl LikePattern {
    /// Compiles `source`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] if `source` is not a valid
    /// regular expression.
    pub fn new(source: impl Into<String>) -> StorageResult<Self> {
        let source = source.into();
        let regex = regex::Regex::new(&source)
            .map_err(|e| StorageError::validation(format!("invalid 'like' pattern: {e}")))?;
        Ok(Self { source, regex })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns `true` if the pattern matches anywhere in `text`.
    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for LikePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.source, f)
    }
}

impl Condition {
    /// Validates `value` against the shape `op` requires.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] when the operand has the wrong
    /// shape or a `like` pattern is not a valid regular expression.
    pub fn parse(op: QueryOp, value: Value) -> StorageResult<Self> {
        let shape_err = |expected: &str, got: &Value| {
            StorageError::validation(format!(
                "operator '{op}' expects {expected}, got {}",
                got.type_name()
            ))
        };
        match op {
            QueryOp::Eq | QueryOp::Neq => {
                if !(value.is_scalar() || value == Value::Null) {
                    return Err(shape_err("a scalar", &value));
                }
                Ok(if op == QueryOp::Eq { Self::Eq(value) } else { Self::Neq(value) })
            },
            QueryOp::Gt | QueryOp::Gte | QueryOp::Lt | QueryOp::Lte => {
                if !value.is_scalar() {
                    return Err(shape_err("a scalar", &value));
                }
                Ok(match op {
                    QueryOp::Gt => Self::Gt(value),
                    QueryOp::Gte => Self::Gte(value),
                    QueryOp::Lt => Self::Lt(value),
                    _ => Self::Lte(value),
                })
            },
            QueryOp::In | QueryOp::NotIn => {
                let Value::Array(items) = value else {
                    return Err(shape_err("an array", &value));
                };
                if let Some(bad) = items.iter().find(|v| !v.is_scalar()) {
                    return Err(shape_err("an array of scalars", bad));
                }
                Ok(if op == QueryOp::In { Self::In(items) } else { Self::NotIn(items) })
            },
            QueryOp::Between => match value {
                Value::Array(items) if items.len() == 2 => {
                    let mut items = items.into_iter();
                    match (items.next(), items.next()) {
                        (Some(low), Some(high)) if low.compare(&high).is_some() => {
                            Ok(Self::Between(low, high))
                        },
                        _ => Err(StorageError::validation(
                            "operator 'between' expects two scalars of the same type",
                        )),
                    }
                },
                other => Err(shape_err("an array of two values", &other)),
            },
            QueryOp::Exists => match value {
                Value::Bool(b) => Ok(Self::Exists(b)),
                other => Err(shape_err("a boolean", &other)),
            },
            QueryOp::Like => match value {
                Value::String(pattern) => Ok(Self::Like(LikePattern::new(pattern)?)),
                other => Err(shape_err("a string", &other)),
            },
        }
    }

    /// The operator of this condition.
    #[must_use]
    pub fn op(&self) -> QueryOp {
        match self {
            Self::Eq(_) => QueryOp::Eq,
            Self::Neq(_) => QueryOp::Neq,
            Self::Gt(_) => QueryOp::Gt,
            Self::Gte(_) => QueryOp::Gte,
            Self::Lt(_) => QueryOp::Lt,
            Self::Lte(_) => QueryOp::Lte,
            Self::In(_) => QueryOp::In,
            Self::NotIn(_) => QueryOp::NotIn,
            Self::Between(..) => QueryOp::Between,
            Self::Exists(_) => QueryOp::Exists,
            Self::Like(_) => QueryOp::Like,
        }
    }

    /// The operand in its wire shape.
    #[must_use]
    pub fn operand(&self) -> Value {
        match self {
            Self::Eq(v)
            | Self::Neq(v)
            | Self::Gt(v)
            | Self::Gte(v)
            | Self::Lt(v)
            | Self::Lte(v) => v.clone(),
            Self::In(items) | Self::NotIn(items) => Value::Array(items.clone()),
            Self::Between(low, high) => Value::Array(vec![low.clone(), high.clone()]),
            Self::Exists(b) => Value::Bool(*b),
            Self::Like(pattern) => Value::String(pattern.as_str().to_owned()),
        }
    }

    /// Returns `true` for conditions that must hold on some single value.
    ///
    /// Negative conditions (`neq`, `not_in`) and `exists` look at all the
    /// values a path resolves to at once, so they are never grouped into an
    /// any-element match.
    #[must_use]
    pub fn is_element_wise(&self) -> bool {
        !matches!(self, Self::Neq(_) | Self::NotIn(_) | Self::Exists(_))
    }
}

/// Untyped predicate, as it arrives from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPredicate {
    /// Dot-notation record path.
    pub field: String,
    /// Operator name.
    pub op: String,
    /// Operand.
    pub value: serde_json::Value,
}

/// A validated `{field, op, value}` predicate over a record path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPredicate", into = "RawPredicate")]
pub struct Predicate {
    /// Dot-notation record path.
    pub field: String,
    /// What the value at `field` must satisfy.
    pub condition: Condition,
}

impl Predicate {
    /// Creates a predicate from an already validated condition.
    #[must_use]
    pub fn new(field: impl Into<String>, condition: Condition) -> Self {
        Self { field: field.into(), condition }
    }

    /// Validates and builds a predicate from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] for an empty field, an unknown
    /// operator or a badly shaped operand.
    pub fn parse(
        field: impl Into<String>,
        op: &str,
        value: impl Into<Value>,
    ) -> StorageResult<Self> {
        let field = field.into();
        if field.is_empty() {
            return Err(StorageError::validation("predicate field must not be empty"));
        }
        let op = op.parse::<QueryOp>()?;
        Ok(Self { field, condition: Condition::parse(op, value.into())? })
    }

    /// `field == value`.
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Eq(value.into()))
    }

    /// `field != value`, requiring the field to be present.
    #[must_use]
    pub fn neq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Neq(value.into()))
    }

    /// `field > value`.
    #[must_use]
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Gt(value.into()))
    }

    /// `field >= value`.
    #[must_use]
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Gte(value.into()))
    }

    /// `field < value`.
    #[must_use]
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Lt(value.into()))
    }

    /// `field <= value`.
    #[must_use]
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Lte(value.into()))
    }

    /// `field` equals one of `values`.
    #[must_use]
    pub fn one_of<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(field, Condition::In(values.into_iter().map(Into::into).collect()))
    }

    /// `field` is present and equals none of `values`.
    #[must_use]
    pub fn none_of<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(field, Condition::NotIn(values.into_iter().map(Into::into).collect()))
    }

    /// `low <= field <= high`.
    #[must_use]
    pub fn between(
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Self::new(field, Condition::Between(low.into(), high.into()))
    }

    /// Presence check on `field`.
    #[must_use]
    pub fn exists(field: impl Into<String>, present: bool) -> Self {
        Self::new(field, Condition::Exists(present))
    }

    /// Regular expression match on `field`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] if `pattern` does not compile.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> StorageResult<Self> {
        Ok(Self::new(field, Condition::parse(QueryOp::Like, Value::String(pattern.into()))?))
    }
}

impl TryFrom<RawPredicate> for Predicate {
    type Error = StorageError;

    fn try_from(raw: RawPredicate) -> Result<Self, Self::Error> {
        Self::parse(raw.field, &raw.op, Value::from(raw.value))
    }
}

impl From<Predicate> for RawPredicate {
    fn from(predicate: Predicate) -> Self {
        Self {
            op: predicate.condition.op().as_str().to_owned(),
            value: predicate.condition.operand().into(),
            field: predicate.field,
        }
    }
}

/// Record predicates combined with AND, OR and NOT.
///
/// An object matches when every `and` predicate holds, at least one `or`
/// predicate holds (if any are given) and no `not` predicate holds. The three
/// parts are independent constraints, combined conjunctively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartQuery {
    /// All must match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub and: Vec<Predicate>,
    /// At least one must match, when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or: Vec<Predicate>,
    /// None may match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not: Vec<Predicate>,
}

impl PartQuery {
    /// A query where every predicate must match.
    #[must_use]
    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self { and: predicates.into_iter().collect(), ..Self::default() }
    }

    /// A query where at least one predicate must match.
    #[must_use]
    pub fn any(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self { or: predicates.into_iter().collect(), ..Self::default() }
    }

    /// A query where no predicate may match.
    #[must_use]
    pub fn none(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Self { not: predicates.into_iter().collect(), ..Self::default() }
    }

    /// Returns `true` if no predicate is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.and.is_empty() && self.or.is_empty() && self.not.is_empty()
    }
}

/// Envelope fields that can be constrained or sorted on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum MetaField {
    /// Object id.
    Id,
    /// Creation time.
    CreatedAt,
    /// Last update time.
    UpdatedAt,
    /// Creating actor.
    CreatedBy,
    /// Last updating actor.
    UpdatedBy,
    /// Kind of creating actor.
    CreatedByType,
    /// Kind of last updating actor.
    UpdatedByType,
    /// Soft-delete time.
    DeletedAt,
    /// Deleting actor.
    DeletedBy,
    /// Kind of deleting actor.
    DeletedByType,
}

impl MetaField {
    /// Every envelope field.
    pub const ALL: [MetaField; 10] = [
        Self::Id,
        Self::CreatedAt,
        Self::UpdatedAt,
        Self::CreatedBy,
        Self::UpdatedBy,
        Self::CreatedByType,
        Self::UpdatedByType,
        Self::DeletedAt,
        Self::DeletedBy,
        Self::DeletedByType,
    ];

    /// Field name in the stored document.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::CreatedAt => "createdAt",
            Self::UpdatedAt => "updatedAt",
            Self::CreatedBy => "createdBy",
            Self::UpdatedBy => "updatedBy",
            Self::CreatedByType => "createdByType",
            Self::UpdatedByType => "updatedByType",
            Self::DeletedAt => "deletedAt",
            Self::DeletedBy => "deletedBy",
            Self::DeletedByType => "deletedByType",
        }
    }

    /// Column name in the relational table.
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::CreatedBy => "created_by",
            Self::UpdatedBy => "updated_by",
            Self::CreatedByType => "created_by_type",
            Self::UpdatedByType => "updated_by_type",
            Self::DeletedAt => "deleted_at",
            Self::DeletedBy => "deleted_by",
            Self::DeletedByType => "deleted_by_type",
        }
    }

    /// Looks a field up by its document name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }

    /// Returns `true` for timestamp fields.
    #[must_use]
    pub fn is_timestamp(self) -> bool {
        matches!(self, Self::CreatedAt | Self::UpdatedAt | Self::DeletedAt)
    }
}

/// Operator map applied to one envelope field.
///
/// Operands stay untyped until [`MetaQuery::predicates`] normalizes them:
/// timestamp fields accept ISO-8601 strings or epoch milliseconds, every
/// other field takes strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaOps {
    /// Equal to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<serde_json::Value>,
    /// Not equal to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neq: Option<serde_json::Value>,
    /// Greater than.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<serde_json::Value>,
    /// Greater than or equal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<serde_json::Value>,
    /// Less than.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<serde_json::Value>,
    /// Less than or equal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<serde_json::Value>,
    /// One of.
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub in_list: Option<Vec<serde_json::Value>>,
    /// None of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_in: Option<Vec<serde_json::Value>>,
}

impl MetaOps {
    /// An empty operator map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an `eq` constraint.
    #[must_use]
    pub fn equal(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.eq = Some(value.into());
        self
    }

    /// Adds a `neq` constraint.
    #[must_use]
    pub fn not_equal(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.neq = Some(value.into());
        self
    }

    /// Adds a `gt` constraint.
    #[must_use]
    pub fn greater_than(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.gt = Some(value.into());
        self
    }

    /// Adds a `gte` constraint.
    #[must_use]
    pub fn at_least(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.gte = Some(value.into());
        self
    }

    /// Adds an `lt` constraint.
    #[must_use]
    pub fn less_than(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.lt = Some(value.into());
        self
    }

    /// Adds an `lte` constraint.
    #[must_use]
    pub fn at_most(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.lte = Some(value.into());
        self
    }

    /// Adds an `in` constraint.
    #[must_use]
    pub fn one_of<V: Into<serde_json::Value>>(
        mut self,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.in_list = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a `not_in` constraint.
    #[must_use]
    pub fn none_of<V: Into<serde_json::Value>>(
        mut self,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.not_in = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Typed operand of a meta predicate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetaValue {
    /// Text fields: ids and actors.
    Text(String),
    /// Timestamp fields.
    Time(DateTime<Utc>),
}

/// A normalized comparison against one envelope field.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaCmp {
    /// Equal to.
    Eq(MetaValue),
    /// Not equal to. Absent values count as not equal.
    Neq(MetaValue),
    /// Greater than.
    Gt(MetaValue),
    /// Greater than or equal.
    Gte(MetaValue),
    /// Less than.
    Lt(MetaValue),
    /// Less than or equal.
    Lte(MetaValue),
    /// One of.
    In(Vec<MetaValue>),
    /// None of. Absent values count as none of.
    NotIn(Vec<MetaValue>),
}

/// A single normalized envelope constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaPredicate {
    /// The constrained field.
    pub field: MetaField,
    /// The comparison it must satisfy.
    pub cmp: MetaCmp,
}

/// Constraints on envelope metadata, keyed by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaQuery(pub BTreeMap<MetaField, MetaOps>);

impl MetaQuery {
    /// An empty meta query.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the operator map for `field`.
    #[must_use]
    pub fn with(mut self, field: MetaField, ops: MetaOps) -> Self {
        self.0.insert(field, ops);
        self
    }

    /// Shorthand for `id == id`.
    #[must_use]
    pub fn id_eq(id: impl Into<String>) -> Self {
        Self::new().with(MetaField::Id, MetaOps::new().equal(id.into()))
    }

    /// Shorthand for `id in ids`.
    #[must_use]
    pub fn id_in<S: Into<String>>(ids: impl IntoIterator<Item = S>) -> Self {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        Self::new().with(MetaField::Id, MetaOps::new().one_of(ids))
    }

    /// Returns `true` if no field is constrained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|ops| *ops == MetaOps::default())
    }

    /// Normalizes every operator into a typed predicate.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] when an operand does not fit the
    /// field: a non-string for a text field, or an unparseable timestamp.
    pub fn predicates(&self) -> StorageResult<Vec<MetaPredicate>> {
        let mut out = Vec::new();
        for (&field, ops) in &self.0 {
            let one = |v: &serde_json::Value| meta_value(field, v);
            let many = |vs: &[serde_json::Value]| vs.iter().map(one).collect::<StorageResult<_>>();
            let mut push = |cmp| out.push(MetaPredicate { field, cmp });
            if let Some(v) = &ops.eq {
                push(MetaCmp::Eq(one(v)?));
            }
            if let Some(v) = &ops.neq {
                push(MetaCmp::Neq(one(v)?));
            }
            if let Some(v) = &ops.gt {
                push(MetaCmp::Gt(one(v)?));
            }
            if let Some(v) = &ops.gte {
                push(MetaCmp::Gte(one(v)?));
            }
            if let Some(v) = &ops.lt {
                push(MetaCmp::Lt(one(v)?));
            }
            if let Some(v) = &ops.lte {
                push(MetaCmp::Lte(one(v)?));
            }
            if let Some(vs) = &ops.in_list {
                push(MetaCmp::In(many(vs)?));
            }
            if let Some(vs) = &ops.not_in {
                push(MetaCmp::NotIn(many(vs)?));
            }
        }
        Ok(out)
    }
}

fn meta_value(field: MetaField, value: &serde_json::Value) -> StorageResult<MetaValue> {
    let invalid = || {
        StorageError::validation(format!(
            "invalid value {value} for meta field '{}'",
            field.as_str()
        ))
    };
    if field.is_timestamp() {
        let time = match value {
            serde_json::Value::String(s) => {
                DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)).ok()
            },
            serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
            _ => None,
        };
        time.map(MetaValue::Time).ok_or_else(invalid)
    } else {
        value.as_str().map(|s| MetaValue::Text(s.to_owned())).ok_or_else(invalid)
    }
}

/// Exact-match constraints on envelope scalars outside the meta query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopLevelFields {
    /// Match on the reindex flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_index: Option<bool>,
}

/// Everything a read, update or delete matches against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct ObjQuery {
    /// Tenant scope.
    #[builder(into)]
    pub app_id: String,
    /// Sub-tenant scope. `None` spans every group of the app.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Record predicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_query: Option<PartQuery>,
    /// Envelope constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_query: Option<MetaQuery>,
    /// Envelope flag constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_level_fields: Option<TopLevelFields>,
}

impl ObjQuery {
    /// A query matching every object of an app.
    #[must_use]
    pub fn for_app(app_id: impl Into<String>) -> Self {
        Self { app_id: app_id.into(), ..Self::default() }
    }

    /// Same scope, restricted to the given ids.
    #[must_use]
    pub fn scoped_to_ids(&self, ids: &[String]) -> Self {
        Self {
            app_id: self.app_id.clone(),
            group_id: self.group_id.clone(),
            meta_query: Some(MetaQuery::id_in(ids.iter().cloned())),
            ..Self::default()
        }
    }
}

/// Returns `true` if `value` looks like a `{field, op, value}` predicate.
#[must_use]
pub fn is_part_query_item(value: &serde_json::Value) -> bool {
    value.as_object().is_some_and(|map| {
        map.contains_key("field") && map.contains_key("op") && map.contains_key("value")
    })
}

/// Returns `true` if `value` is a list of predicates.
#[must_use]
pub fn is_part_query_list(value: &serde_json::Value) -> bool {
    value.as_array().is_some_and(|items| items.iter().all(is_part_query_item))
}

/// Returns `true` if `value` looks like an `{and?, or?, not?}` query.
#[must_use]
pub fn is_logical_query(value: &serde_json::Value) -> bool {
    value.as_object().is_some_and(|map| {
        map.contains_key("and") || map.contains_key("or") || map.contains_key("not")
    })
}

/// Turns a flat map into an all-`eq` predicate list.
#[must_use]
pub fn record_to_eq_predicates<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Vec<Predicate>
where
    K: Into<String>,
    V: Into<Value>,
{
    entries.into_iter().map(|(field, value)| Predicate::eq(field, value)).collect()
}

/// Flattens a nested record into dot-notation `eq` predicates.
///
/// Maps and arrays are walked; array elements are addressed by index
/// (`tags.0`). Every leaf becomes one predicate.
#[must_use]
pub fn flatten_to_eq_predicates(record: &ObjRecord) -> Vec<Predicate> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<Predicate>) {
        match value {
            Value::Map(map) => {
                for (key, child) in map {
                    walk(&format!("{prefix}.{key}"), child, out);
                }
            },
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    walk(&format!("{prefix}.{i}"), child, out);
                }
            },
            leaf => out.push(Predicate::eq(prefix, leaf.clone())),
        }
    }

    let mut out = Vec::new();
    for (key, value) in record {
        walk(key, value, &mut out);
    }
    out
}
