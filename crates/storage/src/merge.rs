//! Record merge strategies used by updates and bulk updates.

use serde::{Deserialize, Serialize};

use crate::value::{ObjRecord, Value};

/// How an update payload is applied to an existing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateWay {
    /// Shallow: each top-level payload key overwrites the existing key.
    #[default]
    Replace,
    /// Deep merge. Maps merge recursively; arrays are replaced.
    Merge,
    /// Deep merge with arrays replaced, same as [`UpdateWay::Merge`].
    MergeButReplaceArrays,
    /// Deep merge with existing array elements followed by the new ones.
    MergeButConcatArrays,
    /// Deep merge where an existing array wins over the payload's.
    MergeButKeepArrays,
}

impl UpdateWay {
    /// The wire name of the strategy.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
            Self::MergeButReplaceArrays => "mergeButReplaceArrays",
            Self::MergeButConcatArrays => "mergeButConcatArrays",
            Self::MergeButKeepArrays => "mergeButKeepArrays",
        }
    }
}

/// Applies `payload` to `existing` according to `way`.
///
/// Keys absent from the payload are never touched.
#[must_use]
pub fn merge_records(existing: &ObjRecord, payload: &ObjRecord, way: UpdateWay) -> ObjRecord {
    let mut merged = existing.clone();
    apply(&mut merged, payload, way);
    merged
}

/// In-place form of [`merge_records`].
pub fn apply(target: &mut ObjRecord, payload: &ObjRecord, way: UpdateWay) {
    for (key, incoming) in payload {
        if way == UpdateWay::Replace {
            target.insert(key.clone(), incoming.clone());
            continue;
        }
        match target.get_mut(key) {
            Some(current) => merge_value(current, incoming, way),
            None => {
                target.insert(key.clone(), incoming.clone());
            },
        }
    }
}

fn merge_value(current: &mut Value, incoming: &Value, way: UpdateWay) {
    match (current, incoming) {
        (Value::Map(existing), Value::Map(payload)) => apply(existing, payload, way),
        (Value::Array(existing), Value::Array(payload)) => match way {
            UpdateWay::MergeButConcatArrays => existing.extend(payload.iter().cloned()),
            UpdateWay::MergeButKeepArrays => {},
            _ => *existing = payload.clone(),
        },
        (current, incoming) => *current = incoming.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::value::record_from_json;

    fn rec(json: serde_json::Value) -> ObjRecord {
        record_from_json(json).expect("record")
    }

    fn existing() -> ObjRecord {
        rec(json!({
            "name": "alice",
            "tags": ["a", "b"],
            "profile": {"city": "Lagos", "langs": ["en"], "age": 30},
        }))
    }

    fn payload() -> ObjRecord {
        rec(json!({
            "tags": ["c"],
            "profile": {"city": "Abuja", "langs": ["fr"]},
        }))
    }

    #[rstest]
    #[case::replace(UpdateWay::Replace, json!({
        "name": "alice",
        "tags": ["c"],
        "profile": {"city": "Abuja", "langs": ["fr"]},
    }))]
    #[case::merge(UpdateWay::Merge, json!({
        "name": "alice",
        "tags": ["c"],
        "profile": {"city": "Abuja", "langs": ["fr"], "age": 30},
    }))]
    #[case::replace_arrays(UpdateWay::MergeButReplaceArrays, json!({
        "name": "alice",
        "tags": ["c"],
        "profile": {"city": "Abuja", "langs": ["fr"], "age": 30},
    }))]
    #[case::concat_arrays(UpdateWay::MergeButConcatArrays, json!({
        "name": "alice",
        "tags": ["a", "b", "c"],
        "profile": {"city": "Abuja", "langs": ["en", "fr"], "age": 30},
    }))]
    #[case::keep_arrays(UpdateWay::MergeButKeepArrays, json!({
        "name": "alice",
        "tags": ["a", "b"],
        "profile": {"city": "Abuja", "langs": ["en"], "age": 30},
    }))]
    fn merge_modes(#[case] way: UpdateWay, #[case] expected: serde_json::Value) {
        assert_eq!(merge_records(&existing(), &payload(), way), rec(expected));
    }

    #[test]
    fn keep_arrays_still_sets_missing_arrays() {
        let merged = merge_records(
            &rec(json!({"a": 1})),
            &rec(json!({"tags": ["x"]})),
            UpdateWay::MergeButKeepArrays,
        );
        assert_eq!(merged, rec(json!({"a": 1, "tags": ["x"]})));
    }

    #[test]
    fn type_changes_overwrite() {
        let merged = merge_records(
            &rec(json!({"a": {"b": 1}, "c": [1]})),
            &rec(json!({"a": "flat", "c": {"d": 2}})),
            UpdateWay::MergeButKeepArrays,
        );
        assert_eq!(merged, rec(json!({"a": "flat", "c": {"d": 2}})));
    }

    #[test]
    fn wire_names_match_serde() {
        for way in [
            UpdateWay::Replace,
            UpdateWay::Merge,
            UpdateWay::MergeButReplaceArrays,
            UpdateWay::MergeButConcatArrays,
            UpdateWay::MergeButKeepArrays,
        ] {
            assert_eq!(serde_json::to_value(way).expect("serialize"), json!(way.as_str()));
        }
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
        ]
    }

    fn value() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-d]", inner, 0..4).prop_map(Value::Map),
            ]
        })
    }

    fn record() -> impl Strategy<Value = ObjRecord> {
        prop::collection::btree_map("[a-d]", value(), 0..5)
    }

    fn any_way() -> impl Strategy<Value = UpdateWay> {
        prop_oneof![
            Just(UpdateWay::Replace),
            Just(UpdateWay::Merge),
            Just(UpdateWay::MergeButReplaceArrays),
            Just(UpdateWay::MergeButConcatArrays),
            Just(UpdateWay::MergeButKeepArrays),
        ]
    }

    proptest! {
        #[test]
        fn untouched_keys_survive(existing in record(), payload in record(), way in any_way()) {
            let merged = merge_records(&existing, &payload, way);
            for (key, value) in &existing {
                if !payload.contains_key(key) {
                    prop_assert_eq!(merged.get(key), Some(value));
                }
            }
        }

        #[test]
        fn replace_takes_payload_keys(existing in record(), payload in record()) {
            let merged = merge_records(&existing, &payload, UpdateWay::Replace);
            for (key, value) in &payload {
                prop_assert_eq!(merged.get(key), Some(value));
            }
        }

        #[test]
        fn merge_is_idempotent(existing in record(), payload in record()) {
            let once = merge_records(&existing, &payload, UpdateWay::Merge);
            let twice = merge_records(&once, &payload, UpdateWay::Merge);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn concat_grows_arrays(existing in record(), payload in record()) {
            let merged = merge_records(&existing, &payload, UpdateWay::MergeButConcatArrays);
            for (key, incoming) in &payload {
                let pair = (existing.get(key), incoming);
                if let (Some(Value::Array(before)), Value::Array(added)) = pair {
                    let Some(Value::Array(after)) = merged.get(key) else {
                        return Err(TestCaseError::fail("array lost"));
                    };
                    prop_assert_eq!(after.len(), before.len() + added.len());
                }
            }
        }

        #[test]
        fn keep_preserves_existing_arrays(existing in record(), payload in record()) {
            let merged = merge_records(&existing, &payload, UpdateWay::MergeButKeepArrays);
            for (key, incoming) in &payload {
                let pair = (existing.get(key), incoming);
                if let (Some(before @ Value::Array(_)), Value::Array(_)) = pair {
                    prop_assert_eq!(merged.get(key), Some(before));
                }
            }
        }
    }
}
