//! Document store boundary.
//!
//! The grouping pipeline talks to a [`Backend`] trait instead of a concrete
//! database so that the same stages run against the in-memory store in tests
//! and against a real document database in production. The trait is
//! deliberately small: insert with unique-index enforcement, filtered finds,
//! field updates and a group-by used to enumerate proto-groups.

use crate::model::DocId;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// An insert violated a unique index. Callers use this to detect that the
    /// entity already exists and re-query instead of failing.
    #[error("Duplicate key in {collection}: {key}")]
    DuplicateKey { collection: String, key: String },

    #[error("Document not found in {collection}: {id}")]
    NotFound { collection: String, id: DocId },

    #[error("Invalid document: {}", .0.to_lowercase())]
    InvalidDocument(String),

    #[error("Backend error: {}", .0.to_lowercase())]
    Backend(String),
}

impl From<crate::model::Error> for Error {
    fn from(err: crate::model::Error) -> Self {
        Error::InvalidDocument(format!("{err}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Look up a dotted path (`tags.Modality.Value`) inside a document.
pub fn path_value<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// A path value reduced to a scalar: arrays are represented by their first
/// element. Grouping keys and index keys both use this form, so an element
/// stored as `["1.2.3"]` and the plain string `"1.2.3"` key identically.
pub fn scalar_value<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    match path_value(document, path)? {
        Value::Array(items) => items.first(),
        other => Some(other),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(Value),
    Exists(bool),
}

/// Conjunction of per-path conditions, matched against documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the path to equal the value. An array at the path matches when
    /// it contains the value.
    pub fn eq(mut self, path: impl Into<String>, value: Value) -> Self {
        self.conditions.push((path.into(), Condition::Eq(value)));
        self
    }

    pub fn exists(mut self, path: impl Into<String>, exists: bool) -> Self {
        self.conditions.push((path.into(), Condition::Exists(exists)));
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.conditions.iter().all(|(path, condition)| {
            let found = path_value(document, path);
            match condition {
                Condition::Exists(exists) => {
                    let present = !matches!(found, None | Some(Value::Null));
                    present == *exists
                }
                Condition::Eq(expected) => match found {
                    Some(Value::Array(items)) => {
                        items.contains(expected) || Value::Array(items.clone()) == *expected
                    }
                    Some(actual) => actual == expected,
                    None => false,
                },
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .conditions
            .iter()
            .map(|(path, condition)| match condition {
                Condition::Eq(value) => format!("{path} == {value}"),
                Condition::Exists(exists) => format!("{path} exists == {exists}"),
            })
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// One group produced by [`Backend::group_by`]: the grouping key values and
/// the ids of all member documents. Holding ids instead of documents keeps
/// the enumeration cheap; stages fetch documents per batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoGroup {
    pub key: Vec<Value>,
    pub child_ids: Vec<DocId>,
}

/// Synchronous document store.
pub trait Backend: Send + Sync {
    /// Insert a document, assigning an id when `_id` is absent. Fails with
    /// [`Error::DuplicateKey`] when a unique index is violated.
    fn insert(&self, collection: &str, document: Value) -> Result<DocId>;

    fn find_by_id(&self, collection: &str, id: DocId) -> Result<Value>;

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>>;

    /// Set dotted-path fields on one document, creating intermediate objects
    /// as needed.
    fn update_fields(&self, collection: &str, id: DocId, fields: &[(String, Value)]) -> Result<()>;

    /// Append a value to the array at a dotted path, creating the array when
    /// the path is absent.
    fn push_field(&self, collection: &str, id: DocId, path: &str, value: Value) -> Result<()>;

    /// Create a unique index over the scalar forms of the given paths.
    /// Idempotent; fails when existing documents already collide.
    fn ensure_unique_index(&self, collection: &str, paths: &[&str]) -> Result<()>;

    /// Group the documents matching `filter` by the scalar values at
    /// `key_paths`, in a deterministic group order.
    fn group_by(&self, collection: &str, filter: &Filter, key_paths: &[&str])
        -> Result<Vec<ProtoGroup>>;

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_value_descends_objects() {
        let doc = json!({"tags": {"Modality": {"vr": "CS", "Value": ["MR"]}}});
        assert_eq!(path_value(&doc, "tags.Modality.Value"), Some(&json!(["MR"])));
        assert_eq!(path_value(&doc, "tags.Missing.Value"), None);
    }

    #[test]
    fn test_scalar_value_unwraps_arrays() {
        let doc = json!({"tags": {"Modality": {"Value": ["MR"]}}, "anon_id": "abc"});
        assert_eq!(scalar_value(&doc, "tags.Modality.Value"), Some(&json!("MR")));
        assert_eq!(scalar_value(&doc, "anon_id"), Some(&json!("abc")));
    }

    #[test]
    fn test_filter_eq_matches_array_members() {
        let doc = json!({"tags": {"Modality": {"Value": ["MR"]}}});
        assert!(Filter::new()
            .eq("tags.Modality.Value", json!("MR"))
            .matches(&doc));
        assert!(!Filter::new()
            .eq("tags.Modality.Value", json!("CT"))
            .matches(&doc));
    }

    #[test]
    fn test_filter_exists() {
        let doc = json!({"series_id": "x", "study_id": null});
        assert!(Filter::new().exists("series_id", true).matches(&doc));
        assert!(Filter::new().exists("study_id", false).matches(&doc));
        assert!(Filter::new().exists("patient_id", false).matches(&doc));
    }

    #[test]
    fn test_filter_conjunction() {
        let doc = json!({"a": 1, "b": 2});
        assert!(Filter::new().eq("a", json!(1)).eq("b", json!(2)).matches(&doc));
        assert!(!Filter::new().eq("a", json!(1)).eq("b", json!(3)).matches(&doc));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&json!({"anything": true})));
    }
}
