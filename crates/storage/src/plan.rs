//! Lowering of an [`ObjQuery`] into backend-ready clauses.
//!
//! Every backend starts from the same [`ObjFilter`]. Compilation validates
//! the meta query, consults the [`FieldIndex`] once per predicate and decides
//! how each path is matched:
//!
//! - [`Clause::Scalar`]: no array-capable prefix is known, the value at the
//!   path is compared directly.
//! - [`Clause::Element`]: the path crosses an array-capable prefix and the
//!   condition is positive. Some element under the prefix must satisfy every
//!   item of the clause. A bare object (or scalar) stored at the prefix counts
//!   as a one-element array, so both shapes match.
//! - [`Clause::Spread`]: the path crosses an array and the condition is
//!   negative or a presence check. It looks at every value the path reaches
//!   across all elements.
//!
//! Positive `and` predicates that share a prefix are grouped into one element
//! clause; `or` and `not` predicates always lower one clause each.
//!
//! [`ObjFilter::matches`] evaluates a filter against an in-memory [`Obj`].
//! It is the reference semantics the database compilers follow.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::StorageResult,
    field::FieldIndex,
    obj::Obj,
    query::{Condition, MetaCmp, MetaField, MetaPredicate, MetaValue, ObjQuery, Predicate},
    value::{ObjRecord, Value, resolve_lax, split_path},
};

/// Which soft-delete states a read returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Only objects with no `deleted_at`.
    #[default]
    Live,
    /// Only soft-deleted objects.
    Deleted,
    /// Both.
    All,
}

impl Lifecycle {
    /// Returns `true` if an object in the given state is visible.
    #[must_use]
    pub fn admits(self, deleted: bool) -> bool {
        match self {
            Self::Live => !deleted,
            Self::Deleted => deleted,
            Self::All => true,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Deleted => "deleted",
            Self::All => "all",
        })
    }
}

/// One condition inside an element clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementItem {
    /// Path below the array prefix. `None` compares the element itself.
    pub sub_path: Option<String>,
    /// What the element value must satisfy.
    pub condition: Condition,
}

/// A lowered record predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Direct comparison of the value at `path`.
    Scalar {
        /// Record path, traversing maps only.
        path: String,
        /// Condition on the value.
        condition: Condition,
    },
    /// Some element under `prefix` satisfies all `items` at once.
    Element {
        /// Array-capable prefix.
        prefix: String,
        /// Conditions one element must satisfy jointly.
        items: Vec<ElementItem>,
    },
    /// Negative or presence condition over every value `path` reaches.
    Spread {
        /// Full record path, crossing arrays.
        path: String,
        /// One of `Neq`, `NotIn` or `Exists`.
        condition: Condition,
    },
}

/// Record clauses, combined the same way as the predicates they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    /// All must match.
    pub and: Vec<Clause>,
    /// At least one must match, when non-empty.
    pub or: Vec<Clause>,
    /// None may match.
    pub not: Vec<Clause>,
}

impl QueryPlan {
    /// Lowers record predicates using the field index.
    #[must_use]
    pub fn lower(
        and: &[Predicate],
        or: &[Predicate],
        not: &[Predicate],
        fields: &FieldIndex,
    ) -> Self {
        let mut plan = Self::default();

        for predicate in and {
            match lower_one(predicate, fields) {
                Clause::Element { prefix, items } => {
                    let grouped = plan.and.iter_mut().find_map(|clause| match clause {
                        Clause::Element { prefix: p, items: existing } if *p == prefix => {
                            Some(existing)
                        },
                        _ => None,
                    });
                    match grouped {
                        Some(existing) => existing.extend(items),
                        None => plan.and.push(Clause::Element { prefix, items }),
                    }
                },
                clause => plan.and.push(clause),
            }
        }
        plan.or = or.iter().map(|p| lower_one(p, fields)).collect();
        plan.not = not.iter().map(|p| lower_one(p, fields)).collect();
        plan
    }

    /// Returns `true` if there are no record clauses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.and.is_empty() && self.or.is_empty() && self.not.is_empty()
    }

    /// Evaluates the plan against a record.
    #[must_use]
    pub fn matches(&self, record: &ObjRecord) -> bool {
        self.and.iter().all(|c| c.matches(record))
            && (self.or.is_empty() || self.or.iter().any(|c| c.matches(record)))
            && !self.not.iter().any(|c| c.matches(record))
    }
}

fn lower_one(predicate: &Predicate, fields: &FieldIndex) -> Clause {
    let path = predicate.field.as_str();
    let condition = predicate.condition.clone();
    let Some(split) = fields.array_split(path) else {
        if fields.get(path).is_none() {
            tracing::debug!(path, "no field descriptor, matching as scalar");
        }
        return Clause::Scalar { path: path.to_owned(), condition };
    };
    if condition.is_element_wise() {
        Clause::Element {
            prefix: split.prefix.to_owned(),
            items: vec![ElementItem { sub_path: split.rest.map(str::to_owned), condition }],
        }
    } else {
        Clause::Spread { path: path.to_owned(), condition }
    }
}

impl Clause {
    /// Evaluates the clause against a record.
    #[must_use]
    pub fn matches(&self, record: &ObjRecord) -> bool {
        match self {
            Self::Scalar { path, condition } => {
                let value = crate::value::get_path(record, path);
                match condition {
                    Condition::Exists(present) => value.is_some() == *present,
                    _ => value.is_some_and(|v| condition_holds(condition, v)),
                }
            },
            Self::Element { prefix, items } => {
                let Some(at_prefix) = crate::value::get_path(record, prefix) else {
                    return false;
                };
                let elements = match at_prefix {
                    Value::Array(elements) => elements.as_slice(),
                    bare => std::slice::from_ref(bare),
                };
                elements.iter().any(|element| {
                    items.iter().all(|item| match &item.sub_path {
                        None => condition_holds(&item.condition, element),
                        Some(sub) => {
                            let mut reached = Vec::new();
                            resolve_lax(element, &split_path(sub), true, &mut reached);
                            reached.into_iter().any(|v| condition_holds(&item.condition, v))
                        },
                    })
                })
            },
            Self::Spread { path, condition } => match condition {
                Condition::Exists(present) => {
                    !lax_values(record, path, false).is_empty() == *present
                },
                _ => {
                    let values = lax_values(record, path, true);
                    !values.is_empty() && values.into_iter().all(|v| condition_holds(condition, v))
                },
            },
        }
    }
}

fn lax_values<'a>(record: &'a ObjRecord, path: &str, unwrap_leaf: bool) -> Vec<&'a Value> {
    let segments = split_path(path);
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first()
        && let Some(value) = record.get(*head)
    {
        resolve_lax(value, rest, unwrap_leaf, &mut out);
    }
    out
}

/// Tests a single value against a condition.
///
/// `Exists` is always true here: presence is decided by the caller.
#[must_use]
pub fn condition_holds(condition: &Condition, value: &Value) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};

    match condition {
        Condition::Eq(expected) => value.loose_eq(expected),
        Condition::Neq(expected) => !value.loose_eq(expected),
        Condition::Gt(bound) => value.compare(bound) == Some(Greater),
        Condition::Gte(bound) => matches!(value.compare(bound), Some(Greater | Equal)),
        Condition::Lt(bound) => value.compare(bound) == Some(Less),
        Condition::Lte(bound) => matches!(value.compare(bound), Some(Less | Equal)),
        Condition::In(list) => list.iter().any(|v| value.loose_eq(v)),
        Condition::NotIn(list) => !list.iter().any(|v| value.loose_eq(v)),
        Condition::Between(low, high) => {
            matches!(value.compare(low), Some(Greater | Equal))
                && matches!(value.compare(high), Some(Less | Equal))
        },
        Condition::Exists(_) => true,
        Condition::Like(pattern) => value.as_str().is_some_and(|s| pattern.is_match(s)),
    }
}

/// A fully validated filter: scope, lifecycle, envelope and record clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjFilter {
    /// Tenant scope.
    pub app_id: String,
    /// Sub-tenant scope, when restricted.
    pub group_id: Option<String>,
    /// Entity tag.
    pub tag: String,
    /// Soft-delete visibility.
    pub lifecycle: Lifecycle,
    /// Normalized envelope constraints.
    pub meta: Vec<MetaPredicate>,
    /// Required `should_index` value.
    pub should_index: Option<bool>,
    /// Lowered record clauses.
    pub plan: QueryPlan,
}

impl ObjFilter {
    /// Validates and lowers a query.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`](crate::StorageError::Validation)
    /// if the meta query holds operands that do not fit their fields.
    pub fn compile(
        query: &ObjQuery,
        tag: &str,
        lifecycle: Lifecycle,
        fields: &FieldIndex,
    ) -> StorageResult<Self> {
        let meta = match &query.meta_query {
            Some(meta) => meta.predicates()?,
            None => Vec::new(),
        };
        let plan = match &query.part_query {
            Some(part) => QueryPlan::lower(&part.and, &part.or, &part.not, fields),
            None => QueryPlan::default(),
        };
        Ok(Self {
            app_id: query.app_id.clone(),
            group_id: query.group_id.clone(),
            tag: tag.to_owned(),
            lifecycle,
            meta,
            should_index: query.top_level_fields.as_ref().and_then(|t| t.should_index),
            plan,
        })
    }

    /// Restricts the filter to ids greater than `after_id`, for keyset paging.
    #[must_use]
    pub fn after(mut self, after_id: Option<&str>) -> Self {
        if let Some(after_id) = after_id {
            self.meta.push(MetaPredicate {
                field: MetaField::Id,
                cmp: MetaCmp::Gt(MetaValue::Text(after_id.to_owned())),
            });
        }
        self
    }

    /// Evaluates the whole filter against an object.
    #[must_use]
    pub fn matches(&self, obj: &Obj) -> bool {
        obj.app_id == self.app_id
            && self.group_id.as_ref().is_none_or(|g| *g == obj.group_id)
            && obj.tag == self.tag
            && self.lifecycle.admits(obj.is_deleted())
            && self.should_index.is_none_or(|flag| flag == obj.should_index)
            && self.meta.iter().all(|p| meta_holds(p, obj))
            && self.plan.matches(&obj.obj_record)
    }
}

/// Reads an envelope field as a typed meta value.
#[must_use]
pub fn meta_value_of(obj: &Obj, field: MetaField) -> Option<MetaValue> {
    let text = |s: &str| Some(MetaValue::Text(s.to_owned()));
    match field {
        MetaField::Id => text(&obj.id),
        MetaField::CreatedAt => Some(MetaValue::Time(obj.created_at)),
        MetaField::UpdatedAt => Some(MetaValue::Time(obj.updated_at)),
        MetaField::CreatedBy => text(&obj.created_by),
        MetaField::UpdatedBy => text(&obj.updated_by),
        MetaField::CreatedByType => text(&obj.created_by_type),
        MetaField::UpdatedByType => text(&obj.updated_by_type),
        MetaField::DeletedAt => obj.deleted_at.map(MetaValue::Time),
        MetaField::DeletedBy => obj.deleted_by.as_deref().and_then(text),
        MetaField::DeletedByType => obj.deleted_by_type.as_deref().and_then(text),
    }
}

fn meta_holds(predicate: &MetaPredicate, obj: &Obj) -> bool {
    let actual = meta_value_of(obj, predicate.field);
    match (&predicate.cmp, actual) {
        (MetaCmp::Neq(expected), actual) => actual.as_ref() != Some(expected),
        (MetaCmp::NotIn(list), actual) => actual.is_none_or(|a| !list.contains(&a)),
        (_, None) => false,
        (MetaCmp::Eq(expected), Some(a)) => a == *expected,
        (MetaCmp::Gt(bound), Some(a)) => a > *bound,
        (MetaCmp::Gte(bound), Some(a)) => a >= *bound,
        (MetaCmp::Lt(bound), Some(a)) => a < *bound,
        (MetaCmp::Lte(bound), Some(a)) => a <= *bound,
        (MetaCmp::In(list), Some(a)) => list.contains(&a),
    }
}
