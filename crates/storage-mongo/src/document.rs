//! Conversion between [`Obj`] envelopes and BSON documents.
//!
//! The envelope is stored flat with camelCase keys. The object id doubles as
//! `_id`, so the primary index enforces id uniqueness. Timestamps are BSON
//! dates so meta comparisons and sorts are chronological.

use chrono::{DateTime, Utc};
use fimidx_storage::{Obj, ObjRecord, Value};
use mongodb::bson::{self, Bson, Document, doc};
use serde_json::Number;

use crate::error::{MongoStorageError, Result};

/// Key of the object id.
pub(crate) const ID: &str = "_id";

/// Key of the record.
pub(crate) const RECORD: &str = "objRecord";

/// Converts a record value to BSON.
///
/// Integers become `Int64`. Unsigned integers past `i64::MAX` and floats
/// become `Double`.
pub(crate) fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => Bson::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(value_to_bson).collect()),
        Value::Map(map) => Bson::Document(record_to_document(map)),
    }
}

/// Converts BSON back to a record value.
///
/// Types without a JSON counterpart go through relaxed extended JSON.
pub(crate) fn bson_to_value(bson: Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Number(i.into()),
        Bson::Int64(i) => Value::Number(i.into()),
        Bson::Double(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        Bson::String(s) => Value::String(s),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_value).collect()),
        Bson::Document(doc) => Value::Map(document_to_record(doc)),
        other => Value::from(other.into_relaxed_extjson()),
    }
}

pub(crate) fn record_to_document(record: &ObjRecord) -> Document {
    record.iter().map(|(k, v)| (k.clone(), value_to_bson(v))).collect()
}

pub(crate) fn document_to_record(doc: Document) -> ObjRecord {
    doc.into_iter().map(|(k, v)| (k, bson_to_value(v))).collect()
}

pub(crate) fn to_bson_datetime(at: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(at.timestamp_millis())
}

fn from_bson_datetime(at: bson::DateTime) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(at.timestamp_millis())
        .ok_or_else(|| MongoStorageError::Document(format!("timestamp {at} out of range")))
}

fn optional_string(value: Option<&String>) -> Bson {
    value.map_or(Bson::Null, |s| Bson::String(s.clone()))
}

/// Builds the stored document for an object.
pub(crate) fn obj_to_document(obj: &Obj) -> Document {
    doc! {
        ID: obj.id.as_str(),
        "appId": obj.app_id.as_str(),
        "groupId": obj.group_id.as_str(),
        "tag": obj.tag.as_str(),
        RECORD: record_to_document(&obj.obj_record),
        "createdAt": to_bson_datetime(obj.created_at),
        "updatedAt": to_bson_datetime(obj.updated_at),
        "createdBy": obj.created_by.as_str(),
        "createdByType": obj.created_by_type.as_str(),
        "updatedBy": obj.updated_by.as_str(),
        "updatedByType": obj.updated_by_type.as_str(),
        "deletedAt": obj.deleted_at.map_or(Bson::Null, |at| Bson::DateTime(to_bson_datetime(at))),
        "deletedBy": optional_string(obj.deleted_by.as_ref()),
        "deletedByType": optional_string(obj.deleted_by_type.as_ref()),
        "shouldIndex": obj.should_index,
        "fieldsToIndex": obj.fields_to_index.as_ref().map_or(Bson::Null, |fields| {
            Bson::Array(fields.iter().cloned().map(Bson::String).collect())
        }),
    }
}

fn required_str(doc: &Document, key: &str) -> Result<String> {
    doc.get_str(key)
        .map(str::to_owned)
        .map_err(|e| MongoStorageError::Document(format!("field '{key}': {e}")))
}

fn required_time(doc: &Document, key: &str) -> Result<DateTime<Utc>> {
    let at = doc
        .get_datetime(key)
        .map_err(|e| MongoStorageError::Document(format!("field '{key}': {e}")))?;
    from_bson_datetime(*at)
}

fn nullable_str(doc: &Document, key: &str) -> Option<String> {
    match doc.get(key) {
        Some(Bson::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Reads an object back from its stored document.
pub(crate) fn document_to_obj(mut doc: Document) -> Result<Obj> {
    let obj_record = match doc.remove(RECORD) {
        Some(Bson::Document(record)) => document_to_record(record),
        Some(Bson::Null) | None => ObjRecord::new(),
        Some(other) => {
            return Err(MongoStorageError::Document(format!(
                "field '{RECORD}' holds {:?}, expected a document",
                other.element_type()
            )));
        },
    };
    let deleted_at = match doc.get("deletedAt") {
        Some(Bson::DateTime(at)) => Some(from_bson_datetime(*at)?),
        _ => None,
    };
    let fields_to_index = match doc.get("fieldsToIndex") {
        Some(Bson::Array(items)) => {
            Some(items.iter().filter_map(|b| b.as_str().map(str::to_owned)).collect())
        },
        _ => None,
    };

    Ok(Obj {
        id: required_str(&doc, ID)?,
        app_id: required_str(&doc, "appId")?,
        group_id: required_str(&doc, "groupId")?,
        tag: required_str(&doc, "tag")?,
        obj_record,
        created_at: required_time(&doc, "createdAt")?,
        updated_at: required_time(&doc, "updatedAt")?,
        created_by: required_str(&doc, "createdBy")?,
        created_by_type: required_str(&doc, "createdByType")?,
        updated_by: required_str(&doc, "updatedBy")?,
        updated_by_type: required_str(&doc, "updatedByType")?,
        deleted_at,
        deleted_by: nullable_str(&doc, "deletedBy"),
        deleted_by_type: nullable_str(&doc, "deletedByType"),
        should_index: doc.get_bool("shouldIndex").unwrap_or(true),
        fields_to_index,
    })
}
