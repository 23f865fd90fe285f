//! Conversion between [`Obj`] and table rows.
//!
//! The envelope maps one-to-one onto snake_case columns; the record is a
//! single `jsonb` column.

use chrono::{DateTime, Utc};
use fimidx_storage::{Obj, record_from_json, record_to_json};
use sqlx::{Postgres, query_builder::Separated, types::Json};

use crate::error::{PostgresStorageError, Result};

/// Every column, in the order [`push_obj`] binds them.
pub(crate) const COLUMNS: &str = "id, app_id, group_id, tag, obj_record, created_at, updated_at, \
     created_by, created_by_type, updated_by, updated_by_type, deleted_at, deleted_by, \
     deleted_by_type, should_index, fields_to_index";

/// Binds per row, one for each column.
pub(crate) const BINDS_PER_ROW: usize = 16;

/// Rows per `INSERT`, bounded by the protocol's 65535 bind parameters.
pub(crate) const MAX_ROWS_PER_INSERT: usize = 65_535 / BINDS_PER_ROW;

/// One row of the objects table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ObjRow {
    id: String,
    app_id: String,
    group_id: String,
    tag: String,
    obj_record: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_by: String,
    created_by_type: String,
    updated_by: String,
    updated_by_type: String,
    deleted_at: Option<DateTime<Utc>>,
    deleted_by: Option<String>,
    deleted_by_type: Option<String>,
    should_index: bool,
    fields_to_index: Option<Vec<String>>,
}

impl TryFrom<ObjRow> for Obj {
    type Error = PostgresStorageError;

    fn try_from(row: ObjRow) -> Result<Self> {
        let Json(record) = row.obj_record;
        let obj_record = record_from_json(record)
            .map_err(|e| PostgresStorageError::Row(format!("object {}: {e}", row.id)))?;
        Ok(Obj {
            id: row.id,
            app_id: row.app_id,
            group_id: row.group_id,
            tag: row.tag,
            obj_record,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by,
            created_by_type: row.created_by_type,
            updated_by: row.updated_by,
            updated_by_type: row.updated_by_type,
            deleted_at: row.deleted_at,
            deleted_by: row.deleted_by,
            deleted_by_type: row.deleted_by_type,
            should_index: row.should_index,
            fields_to_index: row.fields_to_index,
        })
    }
}

/// Binds every column of `obj` in [`COLUMNS`] order.
pub(crate) fn push_obj(mut row: Separated<'_, '_, Postgres, &'static str>, obj: &Obj) {
    row.push_bind(obj.id.clone())
        .push_bind(obj.app_id.clone())
        .push_bind(obj.group_id.clone())
        .push_bind(obj.tag.clone())
        .push_bind(Json(record_to_json(&obj.obj_record)))
        .push_bind(obj.created_at)
        .push_bind(obj.updated_at)
        .push_bind(obj.created_by.clone())
        .push_bind(obj.created_by_type.clone())
        .push_bind(obj.updated_by.clone())
        .push_bind(obj.updated_by_type.clone())
        .push_bind(obj.deleted_at)
        .push_bind(obj.deleted_by.clone())
        .push_bind(obj.deleted_by_type.clone())
        .push_bind(obj.should_index)
        .push_bind(obj.fields_to_index.clone());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use fimidx_storage::testutil::{make_obj, record};
    use serde_json::json;
    use sqlx::QueryBuilder;

    use super::*;

    fn row_of(obj: &Obj) -> ObjRow {
        ObjRow {
            id: obj.id.clone(),
            app_id: obj.app_id.clone(),
            group_id: obj.group_id.clone(),
            tag: obj.tag.clone(),
            obj_record: Json(record_to_json(&obj.obj_record)),
            created_at: obj.created_at,
            updated_at: obj.updated_at,
            created_by: obj.created_by.clone(),
            created_by_type: obj.created_by_type.clone(),
            updated_by: obj.updated_by.clone(),
            updated_by_type: obj.updated_by_type.clone(),
            deleted_at: obj.deleted_at,
            deleted_by: obj.deleted_by.clone(),
            deleted_by_type: obj.deleted_by_type.clone(),
            should_index: obj.should_index,
            fields_to_index: obj.fields_to_index.clone(),
        }
    }

    #[test]
    fn rows_convert_back_to_objects() {
        let mut obj = make_obj("app-1", "member", record(json!({"name": "ada", "level": 3})));
        obj.fields_to_index = Some(vec!["name".into()]);

        let back = Obj::try_from(row_of(&obj)).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn non_object_records_are_rejected() {
        let obj = make_obj("app-1", "member", Default::default());
        let mut row = row_of(&obj);
        row.obj_record = Json(json!([1, 2]));

        let err = Obj::try_from(row).unwrap_err();
        assert!(matches!(err, PostgresStorageError::Row(_)));
    }

    #[test]
    fn push_obj_binds_every_column() {
        let obj = make_obj("app-1", "member", Default::default());
        let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO objs (");
        builder.push(COLUMNS).push(") ");
        builder.push_values([&obj], |row, obj| push_obj(row, obj));

        let sql = builder.sql();
        assert_eq!(COLUMNS.split(", ").count(), BINDS_PER_ROW);
        assert!(sql.contains(&format!("${BINDS_PER_ROW})")), "{sql}");
        assert!(!sql.contains(&format!("${}", BINDS_PER_ROW + 1)), "{sql}");
    }
}
