//! Compilation of [`ObjFilter`] and sort keys into MongoDB documents.
//!
//! Record paths live under `objRecord.`. How a clause compiles depends on its
//! shape in the [`QueryPlan`](fimidx_storage::QueryPlan):
//!
//! | Clause | Compiled form |
//! |--------|---------------|
//! | `Scalar` | `{path: {op: value}}`, plus `$exists: true` where absence must not match |
//! | `Element` | `$or` of an `$elemMatch` over the array and the same conditions on a bare value |
//! | `Spread` | `{path: {$ne/$nin, $exists: true, $not: {$size: 0}}}` over the dotted path |
//!
//! Mongo reads a dotted path through arrays, which a scalar path must not
//! do, so scalar clauses also require that no array sits on the way and
//! compare an array at the end as a whole.
//!
//! `or` clauses become one `$or`, `not` clauses one `$nor`. Everything else
//! is collected into a top-level `$and` so repeated paths never collide.

use fimidx_storage::{
    Lifecycle, MetaField, ObjFilter, Value,
    plan::{Clause, ElementItem},
    query::{Condition, MetaCmp, MetaPredicate, MetaValue},
    sort::{SortDirection, SortKey, SortTarget},
    value::split_path,
};
use mongodb::bson::{Bson, Document, doc};

use crate::document::{ID, RECORD, to_bson_datetime, value_to_bson};

/// Builds the full query document for a filter.
pub(crate) fn compile_filter(filter: &ObjFilter) -> Document {
    let mut query = doc! { "appId": filter.app_id.as_str(), "tag": filter.tag.as_str() };
    if let Some(group_id) = &filter.group_id {
        query.insert("groupId", group_id.as_str());
    }
    if let Some(should_index) = filter.should_index {
        query.insert("shouldIndex", should_index);
    }

    let mut and: Vec<Bson> = Vec::new();
    match filter.lifecycle {
        Lifecycle::Live => and.push(doc! { "deletedAt": Bson::Null }.into()),
        Lifecycle::Deleted => and.push(doc! { "deletedAt": { "$ne": Bson::Null } }.into()),
        Lifecycle::All => {},
    }
    and.extend(filter.meta.iter().map(|p| Bson::Document(meta_clause(p))));
    and.extend(filter.plan.and.iter().map(|c| Bson::Document(record_clause(c))));
    if !filter.plan.or.is_empty() {
        let any: Vec<Bson> = filter.plan.or.iter().map(|c| record_clause(c).into()).collect();
        and.push(doc! { "$or": any }.into());
    }
    if !filter.plan.not.is_empty() {
        let none: Vec<Bson> = filter.plan.not.iter().map(|c| record_clause(c).into()).collect();
        and.push(doc! { "$nor": none }.into());
    }
    if !and.is_empty() {
        query.insert("$and", and);
    }
    query
}

/// Field name of an envelope field in the stored document.
pub(crate) fn meta_path(field: MetaField) -> &'static str {
    match field {
        MetaField::Id => ID,
        other => other.as_str(),
    }
}

fn record_path(path: &str) -> String {
    format!("{RECORD}.{path}")
}

fn meta_bson(value: &MetaValue) -> Bson {
    match value {
        MetaValue::Text(text) => Bson::String(text.clone()),
        MetaValue::Time(at) => Bson::DateTime(to_bson_datetime(*at)),
    }
}

fn meta_list(values: &[MetaValue]) -> Vec<Bson> {
    values.iter().map(meta_bson).collect()
}

fn meta_clause(predicate: &MetaPredicate) -> Document {
    let op = match &predicate.cmp {
        MetaCmp::Eq(v) => doc! { "$eq": meta_bson(v) },
        MetaCmp::Neq(v) => doc! { "$ne": meta_bson(v) },
        MetaCmp::Gt(v) => doc! { "$gt": meta_bson(v) },
        MetaCmp::Gte(v) => doc! { "$gte": meta_bson(v) },
        MetaCmp::Lt(v) => doc! { "$lt": meta_bson(v) },
        MetaCmp::Lte(v) => doc! { "$lte": meta_bson(v) },
        MetaCmp::In(vs) => doc! { "$in": meta_list(vs) },
        MetaCmp::NotIn(vs) => doc! { "$nin": meta_list(vs) },
    };
    doc! { meta_path(predicate.field): op }
}

fn bson_list(values: &[Value]) -> Vec<Bson> {
    values.iter().map(value_to_bson).collect()
}

/// Operator document for a condition.
///
/// With `present`, conditions that Mongo would also satisfy with a missing
/// field (`$eq: null`, `$ne`, `$nin`) additionally require the field.
fn condition_ops(condition: &Condition, present: bool) -> Document {
    let mut ops = match condition {
        Condition::Eq(v) => doc! { "$eq": value_to_bson(v) },
        Condition::Neq(v) => doc! { "$ne": value_to_bson(v) },
        Condition::Gt(v) => doc! { "$gt": value_to_bson(v) },
        Condition::Gte(v) => doc! { "$gte": value_to_bson(v) },
        Condition::Lt(v) => doc! { "$lt": value_to_bson(v) },
        Condition::Lte(v) => doc! { "$lte": value_to_bson(v) },
        Condition::In(vs) => doc! { "$in": bson_list(vs) },
        Condition::NotIn(vs) => doc! { "$nin": bson_list(vs) },
        Condition::Between(low, high) => {
            doc! { "$gte": value_to_bson(low), "$lte": value_to_bson(high) }
        },
        Condition::Exists(flag) => doc! { "$exists": *flag },
        Condition::Like(pattern) => doc! { "$regex": pattern.as_str() },
    };
    let absent_matches = matches!(
        condition,
        Condition::Eq(Value::Null) | Condition::Neq(_) | Condition::NotIn(_)
    );
    if present && absent_matches {
        ops.insert("$exists", true);
    }
    ops
}

/// Returns `true` if the condition compares against an array operand.
fn has_array_operand(condition: &Condition) -> bool {
    let is_array = |v: &Value| matches!(v, Value::Array(_));
    match condition {
        Condition::Eq(v)
        | Condition::Neq(v)
        | Condition::Gt(v)
        | Condition::Gte(v)
        | Condition::Lt(v)
        | Condition::Lte(v) => is_array(v),
        Condition::In(vs) | Condition::NotIn(vs) => vs.iter().any(is_array),
        Condition::Between(low, high) => is_array(low) || is_array(high),
        Condition::Exists(_) | Condition::Like(_) => false,
    }
}

/// Stored paths of every proper prefix of a record path.
fn proper_prefixes(path: &str) -> Vec<String> {
    let segments = split_path(path);
    (1..segments.len()).map(|n| record_path(&segments[..n].join("."))).collect()
}

/// Requires that no array sits at any of `prefixes`, then `clause`.
fn through_maps(prefixes: Vec<String>, clause: Document) -> Document {
    if prefixes.is_empty() {
        return clause;
    }
    let mut all: Vec<Bson> = prefixes
        .into_iter()
        .map(|p| doc! { p: { "$not": { "$type": "array" } } }.into())
        .collect();
    all.push(clause.into());
    doc! { "$and": all }
}

/// A path with no array-capable prefix. It walks maps only: an array met on
/// the way makes the path missing, and an array at the end is one value
/// rather than a set of elements.
fn scalar_clause(path: &str, condition: &Condition) -> Document {
    let field = record_path(path);
    let prefixes = proper_prefixes(path);
    if matches!(condition, Condition::Exists(false)) {
        if prefixes.is_empty() {
            return doc! { field: { "$exists": false } };
        }
        let mut missing: Vec<Bson> =
            prefixes.into_iter().map(|p| doc! { p: { "$type": "array" } }.into()).collect();
        missing.push(doc! { field: { "$exists": false } }.into());
        return doc! { "$or": missing };
    }

    let mut ops = condition_ops(condition, true);
    let leaf = match condition {
        Condition::Exists(_) => doc! { field: ops },
        _ if has_array_operand(condition) => doc! { field: ops },
        Condition::Neq(_) | Condition::NotIn(_) => {
            doc! { "$or": [ { field.as_str(): { "$type": "array" } }, { field.as_str(): ops } ] }
        },
        _ => {
            ops.insert("$not", doc! { "$type": "array" });
            doc! { field: ops }
        },
    };
    through_maps(prefixes, leaf)
}

fn record_clause(clause: &Clause) -> Document {
    match clause {
        Clause::Scalar { path, condition } => scalar_clause(path, condition),
        Clause::Element { prefix, items } => {
            through_maps(proper_prefixes(prefix), element_clause(&record_path(prefix), items))
        },
        Clause::Spread { path, condition } => {
            let mut ops = condition_ops(condition, false);
            if !matches!(condition, Condition::Exists(_)) {
                ops.insert("$exists", true);
                ops.insert("$not", doc! { "$size": 0 });
            }
            doc! { record_path(path): ops }
        },
    }
}

/// Some element of the array at `prefix`, or the bare value there, meets
/// every item.
fn element_clause(prefix: &str, items: &[ElementItem]) -> Document {
    let mut on_fields = Document::new();
    let mut on_element = Document::new();
    let mut collided = Vec::new();
    let mut on_bare: Vec<Bson> =
        vec![doc! { prefix: { "$exists": true, "$not": { "$type": "array" } } }.into()];

    for item in items {
        match &item.sub_path {
            Some(sub) => {
                let ops = condition_ops(&item.condition, true);
                on_bare.push(doc! { format!("{prefix}.{sub}"): ops.clone() }.into());
                merge_ops(&mut on_fields, sub, ops, &mut collided);
            },
            None => {
                for (op, operand) in condition_ops(&item.condition, false) {
                    if on_element.contains_key(&op) {
                        collided.push(doc! { op: operand });
                    } else {
                        on_element.insert(op, operand);
                    }
                }
                on_bare.push(doc! { prefix: condition_ops(&item.condition, true) }.into());
            },
        }
    }

    // An $elemMatch holds either field conditions or operators on the element
    // itself, and each key once. Anything else gets its own $elemMatch.
    let on_array: Vec<Bson> = [on_fields, on_element]
        .into_iter()
        .filter(|ops| !ops.is_empty())
        .chain(collided)
        .map(|ops| doc! { prefix: { "$elemMatch": ops } }.into())
        .collect();
    doc! { "$or": [ { "$and": on_array }, { "$and": on_bare } ] }
}

fn merge_ops(target: &mut Document, sub: &str, ops: Document, collided: &mut Vec<Document>) {
    if !target.contains_key(sub) {
        target.insert(sub, ops);
        return;
    }
    if let Some(Bson::Document(existing)) = target.get_mut(sub)
        && ops.keys().all(|k| !existing.contains_key(k))
    {
        for (op, operand) in ops {
            existing.insert(op, operand);
        }
        return;
    }
    collided.push(doc! { sub: ops });
}

/// Builds the sort document. The key list already ends with the id
/// tiebreaker.
pub(crate) fn compile_sort(keys: &[SortKey]) -> Document {
    keys.iter()
        .map(|key| {
            let path = match &key.target {
                SortTarget::Envelope(field) => meta_path(*field).to_owned(),
                SortTarget::Record { path } => record_path(path),
            };
            let direction = match key.direction {
                SortDirection::Asc => 1_i32,
                SortDirection::Desc => -1_i32,
            };
            (path, Bson::Int32(direction))
        })
        .collect()
}
