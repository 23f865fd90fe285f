//! Compilation of [`ObjFilter`] and sort keys into SQL.
//!
//! Everything is appended to a [`QueryBuilder`], so operands always travel as
//! bind parameters. Record paths are bound as `text[]` for `#>`/`#>>` or as a
//! `jsonpath` string when a clause must cross arrays.
//!
//! | Clause | Compiled form |
//! |--------|---------------|
//! | `Scalar` | condition on `obj_record #> path`, SQL `NULL` when missing |
//! | `Element` | `EXISTS` over `jsonb_array_elements`, a bare value wrapped as one element |
//! | `Spread` | every value `jsonb_path_query` reaches satisfies the condition |
//!
//! Each record clause is wrapped in `COALESCE(.., FALSE)` so `NOT` over a
//! missing path never turns into `NULL`. Text comparisons and sorts use the
//! `"C"` collation to order by bytes.

use fimidx_storage::{
    Identity, Lifecycle, MetaField, ObjFilter, UpsertScope, Value,
    plan::{Clause, ElementItem},
    query::{Condition, MetaCmp, MetaPredicate, MetaValue},
    sort::{SortDirection, SortKey, SortTarget},
    value::split_path,
};
use sqlx::{Postgres, QueryBuilder, types::Json};

/// Byte-order collation for text comparisons.
const BYTE_ORDER: &str = " COLLATE \"C\"";

/// Where a condition reads its value from.
#[derive(Debug, Clone, Copy)]
enum Operand<'a> {
    /// `obj_record #> path`, SQL `NULL` when the path is missing.
    Path(&'a str),
    /// A subquery column that always holds a `jsonb` value.
    Alias(&'static str),
}

impl Operand<'_> {
    fn push_json(self, b: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::Path(path) => {
                b.push("(obj_record #> ").push_bind(segments(path)).push(")");
            },
            Self::Alias(alias) => {
                b.push(alias);
            },
        }
    }

    fn push_text(self, b: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::Path(path) => {
                b.push("(obj_record #>> ").push_bind(segments(path)).push(")");
            },
            Self::Alias(alias) => {
                b.push("(").push(alias).push(" #>> '{}')");
            },
        }
    }

    fn push_typeof(self, b: &mut QueryBuilder<'_, Postgres>) {
        b.push("jsonb_typeof(");
        self.push_json(b);
        b.push(")");
    }
}

fn segments(path: &str) -> Vec<String> {
    split_path(path).into_iter().map(str::to_owned).collect()
}

fn json(value: &Value) -> Json<serde_json::Value> {
    Json(serde_json::Value::from(value.clone()))
}

/// Builds a lax `jsonpath` for a dotted path.
///
/// Lax mode steps through arrays met on the way. `unwrap_leaf` appends
/// `[*]` so an array at the end yields its elements.
pub(crate) fn json_path(path: &str, unwrap_leaf: bool) -> String {
    let mut out = String::from("lax $");
    for segment in split_path(path) {
        out.push_str(".\"");
        for c in segment.chars() {
            if matches!(c, '"' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
    }
    if unwrap_leaf {
        out.push_str("[*]");
    }
    out
}

// ============================================================================
// Filter
// ============================================================================

/// Appends the `WHERE` body for a filter.
pub(crate) fn push_filter(b: &mut QueryBuilder<'_, Postgres>, filter: &ObjFilter) {
    b.push("app_id = ").push_bind(filter.app_id.clone());
    b.push(" AND tag = ").push_bind(filter.tag.clone());
    if let Some(group_id) = &filter.group_id {
        b.push(" AND group_id = ").push_bind(group_id.clone());
    }
    if let Some(should_index) = filter.should_index {
        b.push(" AND should_index = ").push_bind(should_index);
    }
    match filter.lifecycle {
        Lifecycle::Live => {
            b.push(" AND deleted_at IS NULL");
        },
        Lifecycle::Deleted => {
            b.push(" AND deleted_at IS NOT NULL");
        },
        Lifecycle::All => {},
    }
    for predicate in &filter.meta {
        b.push(" AND ");
        push_meta(b, predicate);
    }
    for clause in &filter.plan.and {
        b.push(" AND ");
        push_clause(b, clause);
    }
    if !filter.plan.or.is_empty() {
        b.push(" AND (");
        push_any(b, &filter.plan.or);
        b.push(")");
    }
    if !filter.plan.not.is_empty() {
        b.push(" AND NOT (");
        push_any(b, &filter.plan.not);
        b.push(")");
    }
}

fn push_any(b: &mut QueryBuilder<'_, Postgres>, clauses: &[Clause]) {
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            b.push(" OR ");
        }
        push_clause(b, clause);
    }
}

// ============================================================================
// Envelope
// ============================================================================

fn push_meta_column(b: &mut QueryBuilder<'_, Postgres>, field: MetaField) {
    b.push(field.column());
    if !field.is_timestamp() {
        b.push(BYTE_ORDER);
    }
}

fn push_meta(b: &mut QueryBuilder<'_, Postgres>, predicate: &MetaPredicate) {
    let field = predicate.field;
    let (op, value) = match &predicate.cmp {
        MetaCmp::Eq(v) => ("=", v),
        // Absent values count as not equal.
        MetaCmp::Neq(v) => ("IS DISTINCT FROM", v),
        MetaCmp::Gt(v) => (">", v),
        MetaCmp::Gte(v) => (">=", v),
        MetaCmp::Lt(v) => ("<", v),
        MetaCmp::Lte(v) => ("<=", v),
        MetaCmp::In(values) => return push_meta_list(b, field, values, false),
        MetaCmp::NotIn(values) => return push_meta_list(b, field, values, true),
    };
    b.push("(");
    push_meta_column(b, field);
    b.push(" ").push(op).push(" ");
    match value {
        MetaValue::Text(s) => b.push_bind(s.clone()),
        MetaValue::Time(t) => b.push_bind(*t),
    };
    b.push(")");
}

fn push_meta_list(
    b: &mut QueryBuilder<'_, Postgres>,
    field: MetaField,
    values: &[MetaValue],
    negate: bool,
) {
    if values.is_empty() {
        b.push(if negate { "TRUE" } else { "FALSE" });
        return;
    }
    b.push("(");
    if negate {
        b.push(field.column()).push(" IS NULL OR ");
    }
    push_meta_column(b, field);
    b.push(if negate { " NOT IN (" } else { " IN (" });
    let mut list = b.separated(", ");
    for value in values {
        match value {
            MetaValue::Text(s) => list.push_bind(s.clone()),
            MetaValue::Time(t) => list.push_bind(*t),
        };
    }
    b.push("))");
}

// ============================================================================
// Record clauses
// ============================================================================

fn push_clause(b: &mut QueryBuilder<'_, Postgres>, clause: &Clause) {
    b.push("COALESCE(");
    match clause {
        Clause::Scalar { path, condition } => push_condition(b, Operand::Path(path), condition),
        Clause::Element { prefix, items } => push_element(b, prefix, items),
        Clause::Spread { path, condition } => push_spread(b, path, condition),
    }
    b.push(", FALSE)");
}

/// Some element under `prefix` satisfies every item. A bare value counts as a
/// one-element array.
fn push_element(b: &mut QueryBuilder<'_, Postgres>, prefix: &str, items: &[ElementItem]) {
    let at_prefix = Operand::Path(prefix);
    b.push("(");
    at_prefix.push_json(b);
    b.push(" IS NOT NULL AND EXISTS (SELECT 1 FROM jsonb_array_elements(CASE ");
    at_prefix.push_typeof(b);
    b.push(" WHEN 'array' THEN ");
    at_prefix.push_json(b);
    b.push(" ELSE jsonb_build_array(");
    at_prefix.push_json(b);
    b.push(") END) AS el(value) WHERE ");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            b.push(" AND ");
        }
        match &item.sub_path {
            None => push_condition(b, Operand::Alias("el.value"), &item.condition),
            Some(sub) => {
                b.push("EXISTS (SELECT 1 FROM jsonb_path_query(el.value, ")
                    .push_bind(json_path(sub, true))
                    .push("::jsonpath) AS sv(value) WHERE ");
                push_condition(b, Operand::Alias("sv.value"), &item.condition);
                b.push(")");
            },
        }
    }
    b.push("))");
}

/// Presence, or a negative condition every reached value must satisfy.
fn push_spread(b: &mut QueryBuilder<'_, Postgres>, path: &str, condition: &Condition) {
    if let Condition::Exists(present) = condition {
        if !present {
            b.push("NOT ");
        }
        b.push("jsonb_path_exists(obj_record, ")
            .push_bind(json_path(path, false))
            .push("::jsonpath)");
        return;
    }
    let reached = json_path(path, true);
    b.push("(jsonb_path_exists(obj_record, ")
        .push_bind(reached.clone())
        .push("::jsonpath) AND NOT EXISTS (SELECT 1 FROM jsonb_path_query(obj_record, ")
        .push_bind(reached)
        .push("::jsonpath) AS sv(value) WHERE NOT COALESCE(");
    push_condition(b, Operand::Alias("sv.value"), condition);
    b.push(", FALSE)))");
}

fn push_condition(b: &mut QueryBuilder<'_, Postgres>, operand: Operand<'_>, condition: &Condition) {
    match condition {
        Condition::Eq(expected) => {
            b.push("(");
            operand.push_json(b);
            b.push(" = ").push_bind(json(expected)).push(")");
        },
        Condition::Neq(expected) => {
            b.push("(");
            operand.push_json(b);
            b.push(" IS NOT NULL AND ");
            operand.push_json(b);
            b.push(" <> ").push_bind(json(expected)).push(")");
        },
        Condition::Gt(bound) => push_range(b, operand, ">", bound),
        Condition::Gte(bound) => push_range(b, operand, ">=", bound),
        Condition::Lt(bound) => push_range(b, operand, "<", bound),
        Condition::Lte(bound) => push_range(b, operand, "<=", bound),
        Condition::In(list) => push_list(b, operand, list, false),
        Condition::NotIn(list) => push_list(b, operand, list, true),
        Condition::Between(low, high) => {
            b.push("(");
            push_range(b, operand, ">=", low);
            b.push(" AND ");
            push_range(b, operand, "<=", high);
            b.push(")");
        },
        Condition::Exists(present) => {
            b.push("(");
            operand.push_json(b);
            b.push(if *present { " IS NOT NULL)" } else { " IS NULL)" });
        },
        Condition::Like(pattern) => {
            b.push("(CASE WHEN ");
            operand.push_typeof(b);
            b.push(" = 'string' THEN ");
            operand.push_text(b);
            b.push(" ~ ").push_bind(pattern.as_str().to_owned()).push(" ELSE FALSE END)");
        },
    }
}

/// Range comparison that only holds between values of the same type.
///
/// The `CASE` keeps the cast from running on values of another type.
fn push_range(b: &mut QueryBuilder<'_, Postgres>, operand: Operand<'_>, op: &str, bound: &Value) {
    let json_type = match bound {
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Null | Value::Array(_) | Value::Map(_) => {
            b.push("FALSE");
            return;
        },
    };
    b.push("(CASE WHEN ");
    operand.push_typeof(b);
    b.push(" = '").push(json_type).push("' THEN ");
    operand.push_text(b);
    match bound {
        Value::Number(n) => {
            b.push("::numeric ").push(op).push(" ").push_bind(n.to_string()).push("::numeric");
        },
        Value::String(s) => {
            b.push(BYTE_ORDER).push(" ").push(op).push(" ").push_bind(s.clone());
        },
        Value::Bool(flag) => {
            b.push("::boolean ").push(op).push(" ").push_bind(*flag);
        },
        Value::Null | Value::Array(_) | Value::Map(_) => {},
    }
    b.push(" ELSE FALSE END)");
}

fn push_list(
    b: &mut QueryBuilder<'_, Postgres>,
    operand: Operand<'_>,
    list: &[Value],
    negate: bool,
) {
    if list.is_empty() {
        if negate {
            b.push("(");
            operand.push_json(b);
            b.push(" IS NOT NULL)");
        } else {
            b.push("FALSE");
        }
        return;
    }
    b.push("(");
    if negate {
        operand.push_json(b);
        b.push(" IS NOT NULL AND ");
    }
    operand.push_json(b);
    b.push(if negate { " NOT IN (" } else { " IN (" });
    let mut values = b.separated(", ");
    for value in list {
        values.push_bind(json(value));
    }
    b.push("))");
}

// ============================================================================
// Identity lookup
// ============================================================================

/// Appends the `WHERE` body matching live objects in `scope` whose values at
/// `keys` equal any of `identities`.
pub(crate) fn push_identity_match(
    b: &mut QueryBuilder<'_, Postgres>,
    scope: &UpsertScope,
    keys: &[String],
    identities: &[Identity],
) {
    b.push("app_id = ").push_bind(scope.app_id.clone());
    b.push(" AND group_id = ").push_bind(scope.group_id.clone());
    b.push(" AND tag = ").push_bind(scope.tag.clone());
    b.push(" AND deleted_at IS NULL AND (");
    for (i, identity) in identities.iter().enumerate() {
        if i > 0 {
            b.push(" OR ");
        }
        b.push("(");
        for (j, (key, value)) in keys.iter().zip(identity.values()).enumerate() {
            if j > 0 {
                b.push(" AND ");
            }
            Operand::Path(key).push_json(b);
            b.push(" = ").push_bind(json(value));
        }
        b.push(")");
    }
    b.push(")");
}

// ============================================================================
// Sort
// ============================================================================

/// Appends `ORDER BY` for resolved sort keys.
///
/// Missing values sort first ascending and last descending. A record key
/// orders by JSON type rank, then by value within its type.
pub(crate) fn push_order_by(b: &mut QueryBuilder<'_, Postgres>, keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    b.push(" ORDER BY ");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        let direction = match key.direction {
            SortDirection::Asc => " ASC NULLS FIRST",
            SortDirection::Desc => " DESC NULLS LAST",
        };
        match &key.target {
            SortTarget::Envelope(field) => {
                push_meta_column(b, *field);
                b.push(direction);
            },
            SortTarget::Record { path } => push_sort_value(b, path, direction),
        }
    }
}

/// Type rank of a record value: missing and `null` first, then numbers,
/// strings, objects, arrays and booleans.
const TYPE_RANK: &str = "WHEN 'number' THEN 1 WHEN 'string' THEN 2 WHEN 'object' THEN 3 \
                         WHEN 'array' THEN 4 WHEN 'boolean' THEN 5 END, 0)";

/// Typed sort terms after the rank. Only the one matching the value's type
/// is non-`NULL`.
const TYPED_TERMS: [(&str, &str, &str); 3] =
    [("number", "::numeric", ""), ("string", "", BYTE_ORDER), ("boolean", "::boolean", "")];

fn push_sort_value(b: &mut QueryBuilder<'_, Postgres>, path: &str, direction: &str) {
    let operand = Operand::Path(path);
    b.push("COALESCE(CASE ");
    operand.push_typeof(b);
    b.push(" ").push(TYPE_RANK).push(direction);
    for (json_type, cast, collation) in TYPED_TERMS {
        b.push(", (CASE WHEN ");
        operand.push_typeof(b);
        b.push(" = '").push(json_type).push("' THEN ");
        operand.push_text(b);
        b.push(cast).push(" END)").push(collation).push(direction);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use fimidx_storage::{QueryPlan, testutil::record};
    use serde_json::json;

    use super::*;

    fn scope_filter() -> ObjFilter {
        ObjFilter {
            app_id: "app-1".into(),
            group_id: None,
            tag: "member".into(),
            lifecycle: Lifecycle::Live,
            meta: Vec::new(),
            should_index: None,
            plan: QueryPlan::default(),
        }
    }

    fn where_sql(filter: &ObjFilter) -> String {
        let mut b = QueryBuilder::<Postgres>::new("SELECT id FROM objs WHERE ");
        push_filter(&mut b, filter);
        b.sql().to_owned()
    }

    fn with_and(clause: Clause) -> ObjFilter {
        let mut filter = scope_filter();
        filter.plan.and.push(clause);
        filter
    }

    #[test]
    fn scope_and_lifecycle() {
        assert_eq!(
            where_sql(&scope_filter()),
            "SELECT id FROM objs WHERE app_id = $1 AND tag = $2 AND deleted_at IS NULL"
        );

        let mut filter = scope_filter();
        filter.group_id = Some("g".into());
        filter.should_index = Some(true);
        filter.lifecycle = Lifecycle::Deleted;
        assert_eq!(
            where_sql(&filter),
            "SELECT id FROM objs WHERE app_id = $1 AND tag = $2 AND group_id = $3 \
             AND should_index = $4 AND deleted_at IS NOT NULL"
        );

        filter.lifecycle = Lifecycle::All;
        assert!(!where_sql(&filter).contains("deleted_at"));
    }

    #[test]
    fn meta_neq_admits_missing_values() {
        let mut filter = scope_filter();
        filter.meta.push(MetaPredicate {
            field: MetaField::DeletedBy,
            cmp: MetaCmp::Neq(MetaValue::Text("u1".into())),
        });
        filter.meta.push(MetaPredicate {
            field: MetaField::DeletedByType,
            cmp: MetaCmp::NotIn(vec![MetaValue::Text("system".into())]),
        });

        let sql = where_sql(&filter);
        assert!(sql.contains("(deleted_by COLLATE \"C\" IS DISTINCT FROM $3)"), "{sql}");
        assert!(
            sql.contains(
                "(deleted_by_type IS NULL OR deleted_by_type COLLATE \"C\" NOT IN ($4))"
            ),
            "{sql}"
        );
    }

    #[test]
    fn meta_timestamps_compare_without_collation() {
        let mut filter = scope_filter();
        filter.meta.push(MetaPredicate {
            field: MetaField::CreatedAt,
            cmp: MetaCmp::Gte(MetaValue::Time(chrono::DateTime::UNIX_EPOCH)),
        });
        assert!(where_sql(&filter).ends_with("AND (created_at >= $3)"));
    }

    #[test]
    fn empty_meta_lists() {
        let mut filter = scope_filter();
        filter.meta.push(MetaPredicate { field: MetaField::Id, cmp: MetaCmp::In(Vec::new()) });
        filter.meta.push(MetaPredicate { field: MetaField::Id, cmp: MetaCmp::NotIn(Vec::new()) });
        assert!(where_sql(&filter).ends_with("AND FALSE AND TRUE"));
    }

    #[test]
    fn after_id_compares_bytes() {
        let filter = scope_filter().after(Some("0190"));
        assert!(where_sql(&filter).ends_with("AND (id COLLATE \"C\" > $3)"));
    }

    #[test]
    fn scalar_eq_reads_path() {
        let sql = where_sql(&with_and(Clause::Scalar {
            path: "address.city".into(),
            condition: Condition::Eq("Lagos".into()),
        }));
        assert!(sql.ends_with("AND COALESCE(((obj_record #> $3) = $4), FALSE)"), "{sql}");
    }

    #[test]
    fn scalar_neq_requires_presence() {
        let sql = where_sql(&with_and(Clause::Scalar {
            path: "name".into(),
            condition: Condition::Neq("a".into()),
        }));
        assert!(
            sql.contains("((obj_record #> $3) IS NOT NULL AND (obj_record #> $4) <> $5)"),
            "{sql}"
        );
    }

    #[test]
    fn range_is_guarded_by_type() {
        let sql = where_sql(&with_and(Clause::Scalar {
            path: "age".into(),
            condition: Condition::Gt(30_i64.into()),
        }));
        assert!(
            sql.contains(
                "(CASE WHEN jsonb_typeof((obj_record #> $3)) = 'number' \
                 THEN (obj_record #>> $4)::numeric > $5::numeric ELSE FALSE END)"
            ),
            "{sql}"
        );

        let sql = where_sql(&with_and(Clause::Scalar {
            path: "name".into(),
            condition: Condition::Lte("m".into()),
        }));
        assert!(sql.contains("(obj_record #>> $4) COLLATE \"C\" <= $5"), "{sql}");
    }

    #[test]
    fn range_against_null_never_matches() {
        let sql = where_sql(&with_and(Clause::Scalar {
            path: "age".into(),
            condition: Condition::Gt(Value::Null),
        }));
        assert!(sql.ends_with("AND COALESCE(FALSE, FALSE)"), "{sql}");
    }

    #[test]
    fn in_lists_bind_each_value() {
        let sql = where_sql(&with_and(Clause::Scalar {
            path: "role".into(),
            condition: Condition::In(vec!["a".into(), "b".into()]),
        }));
        assert!(sql.contains("((obj_record #> $3) IN ($4, $5))"), "{sql}");

        let sql = where_sql(&with_and(Clause::Scalar {
            path: "role".into(),
            condition: Condition::In(Vec::new()),
        }));
        assert!(sql.ends_with("COALESCE(FALSE, FALSE)"), "{sql}");
    }

    #[test]
    fn element_clause_wraps_bare_values() {
        let sql = where_sql(&with_and(Clause::Element {
            prefix: "reportsTo".into(),
            items: vec![
                ElementItem {
                    sub_path: Some("userId".into()),
                    condition: Condition::Eq("u1".into()),
                },
                ElementItem { sub_path: None, condition: Condition::Exists(true) },
            ],
        }));
        assert!(sql.contains("jsonb_array_elements(CASE jsonb_typeof("), "{sql}");
        assert!(sql.contains("ELSE jsonb_build_array((obj_record #> $6)) END) AS el(value)"));
        assert!(sql.contains(
            "EXISTS (SELECT 1 FROM jsonb_path_query(el.value, $7::jsonpath) AS sv(value) \
             WHERE (sv.value = $8))"
        ));
        assert!(sql.contains(" AND (el.value IS NOT NULL)))"), "{sql}");
    }

    #[test]
    fn spread_requires_a_reached_value() {
        let sql = where_sql(&with_and(Clause::Spread {
            path: "reportsTo.userId".into(),
            condition: Condition::NotIn(vec!["u1".into()]),
        }));
        assert!(sql.contains("(jsonb_path_exists(obj_record, $3::jsonpath) AND NOT EXISTS"));
        assert!(
            sql.contains("WHERE NOT COALESCE((sv.value IS NOT NULL AND sv.value NOT IN ($5))"),
            "{sql}"
        );

        let sql = where_sql(&with_and(Clause::Spread {
            path: "tags".into(),
            condition: Condition::Exists(false),
        }));
        assert!(
            sql.ends_with("COALESCE(NOT jsonb_path_exists(obj_record, $3::jsonpath), FALSE)"),
            "{sql}"
        );
    }

    #[test]
    fn or_and_not_groups() {
        let mut filter = scope_filter();
        let eq = |path: &str| Clause::Scalar {
            path: path.into(),
            condition: Condition::Eq(1_i64.into()),
        };
        filter.plan.or = vec![eq("a"), eq("b")];
        filter.plan.not = vec![eq("c")];

        let sql = where_sql(&filter);
        assert!(
            sql.contains(
                " AND (COALESCE(((obj_record #> $3) = $4), FALSE) \
                 OR COALESCE(((obj_record #> $5) = $6), FALSE))"
            ),
            "{sql}"
        );
        assert!(sql.ends_with(" AND NOT (COALESCE(((obj_record #> $7) = $8), FALSE))"));
    }

    #[test]
    fn json_paths_quote_segments() {
        assert_eq!(json_path("reportsTo.userId", false), "lax $.\"reportsTo\".\"userId\"");
        assert_eq!(json_path("tags", true), "lax $.\"tags\"[*]");
        assert_eq!(json_path("we\"ird\\key", false), "lax $.\"we\\\"ird\\\\key\"");
    }

    #[test]
    fn identity_match_ors_each_identity() {
        let first = record(json!({"email": "a@x", "org": 1}));
        let second = record(json!({"email": "b@x", "org": 2}));
        let keys = vec!["email".to_owned(), "org".to_owned()];
        let identities: Vec<Identity> =
            [first, second].iter().filter_map(|r| Identity::of(r, &keys)).collect();
        let scope =
            UpsertScope { app_id: "app".into(), group_id: "g".into(), tag: "member".into() };

        let mut b = QueryBuilder::<Postgres>::new("");
        push_identity_match(&mut b, &scope, &keys, &identities);
        assert_eq!(
            b.sql(),
            "app_id = $1 AND group_id = $2 AND tag = $3 AND deleted_at IS NULL AND \
             (((obj_record #> $4) = $5 AND (obj_record #> $6) = $7) OR \
             ((obj_record #> $8) = $9 AND (obj_record #> $10) = $11))"
        );
    }

    #[test]
    fn record_sort_ranks_types_before_values() {
        let keys = vec![
            SortKey {
                target: SortTarget::Record { path: "score".into() },
                direction: SortDirection::Desc,
            },
            SortKey { target: SortTarget::Envelope(MetaField::Id), direction: SortDirection::Asc },
        ];
        let mut b = QueryBuilder::<Postgres>::new("");
        push_order_by(&mut b, &keys);
        assert_eq!(
            b.sql(),
            " ORDER BY COALESCE(CASE jsonb_typeof((obj_record #> $1)) WHEN 'number' THEN 1 \
             WHEN 'string' THEN 2 WHEN 'object' THEN 3 WHEN 'array' THEN 4 \
             WHEN 'boolean' THEN 5 END, 0) DESC NULLS LAST, \
             (CASE WHEN jsonb_typeof((obj_record #> $2)) = 'number' \
             THEN (obj_record #>> $3)::numeric END) DESC NULLS LAST, \
             (CASE WHEN jsonb_typeof((obj_record #> $4)) = 'string' \
             THEN (obj_record #>> $5) END) COLLATE \"C\" DESC NULLS LAST, \
             (CASE WHEN jsonb_typeof((obj_record #> $6)) = 'boolean' \
             THEN (obj_record #>> $7)::boolean END) DESC NULLS LAST, \
             id COLLATE \"C\" ASC NULLS FIRST"
        );
    }

    #[test]
    fn string_sort_orders_by_bytes() {
        let keys = vec![SortKey {
            target: SortTarget::Record { path: "name".into() },
            direction: SortDirection::Asc,
        }];
        let mut b = QueryBuilder::<Postgres>::new("");
        push_order_by(&mut b, &keys);
        assert!(b.sql().contains("(obj_record #>> $5) END) COLLATE \"C\" ASC NULLS FIRST"));
    }
}
