//! The dynamic field-type index.
//!
//! An external indexing sweep discovers which record paths exist per
//! `(app, group, tag)` and what shape they have. Backends only read this
//! catalog: it decides which sort keys can be emitted and which query paths
//! cross an array. A path that is missing from the index is never an error;
//! sort keys on it are dropped and queries on it match scalars only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scalar type discovered for a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Text values.
    #[default]
    String,
    /// Numeric values.
    Number,
    /// Booleans.
    Boolean,
    /// Date-like values stored as ISO strings or epoch numbers.
    Date,
}

/// One discovered fact about a tag's record shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    /// Descriptor id assigned by the indexer.
    #[builder(into, default)]
    #[serde(default)]
    pub id: String,
    /// Dot-notation path inside the record.
    #[builder(into)]
    pub path: String,
    /// Discovered scalar type.
    #[builder(default)]
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Element types seen when this path holds an array. Empty otherwise.
    #[builder(default)]
    #[serde(default)]
    pub array_types: Vec<FieldType>,
    /// Set when the path stands for a flattened array representation.
    #[builder(default)]
    #[serde(default)]
    pub is_array_compressed: bool,
    /// Tenant scope.
    #[builder(into, default)]
    #[serde(default)]
    pub app_id: String,
    /// Sub-tenant scope.
    #[builder(into, default)]
    #[serde(default)]
    pub group_id: String,
    /// Entity tag.
    #[builder(into, default)]
    #[serde(default)]
    pub tag: String,
    /// When the indexer first saw the path.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// When the indexer last refreshed the descriptor.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FieldDescriptor {
    /// Returns `true` if records may hold an array at this path.
    #[must_use]
    pub fn is_array_capable(&self) -> bool {
        !self.array_types.is_empty() || self.is_array_compressed
    }
}

/// Where a path crosses into an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySplit<'a> {
    /// Shortest array-capable prefix of the path.
    pub prefix: &'a str,
    /// Remainder below the prefix, if the path goes deeper.
    pub rest: Option<&'a str>,
}

/// Field descriptors for one `(app, group, tag)`, keyed by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldIndex {
    fields: HashMap<String, FieldDescriptor>,
}

impl FieldIndex {
    /// Creates an empty index: no record sorting, scalar-only queries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the descriptor for its path.
    pub fn insert(&mut self, descriptor: FieldDescriptor) {
        self.fields.insert(descriptor.path.clone(), descriptor);
    }

    /// Looks up the descriptor for an exact path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FieldDescriptor> {
        self.fields.get(path)
    }

    /// Number of known paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if nothing has been indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over all descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }

    /// Finds the shortest prefix of `path` that may hold an array.
    ///
    /// The prefix can be the whole path, for example a list of tags.
    #[must_use]
    pub fn array_split<'a>(&self, path: &'a str) -> Option<ArraySplit<'a>> {
        let mut end = 0;
        loop {
            end = path[end..].find('.').map_or(path.len(), |i| end + i);
            let prefix = &path[..end];
            if self.get(prefix).is_some_and(FieldDescriptor::is_array_capable) {
                let rest = (end < path.len()).then(|| &path[end + 1..]);
                return Some(ArraySplit { prefix, rest });
            }
            if end == path.len() {
                return None;
            }
            end += 1;
        }
    }
}

impl FromIterator<FieldDescriptor> for FieldIndex {
    fn from_iter<I: IntoIterator<Item = FieldDescriptor>>(iter: I) -> Self {
        let mut index = Self::new();
        for descriptor in iter {
            index.insert(descriptor);
        }
        index
    }
}
