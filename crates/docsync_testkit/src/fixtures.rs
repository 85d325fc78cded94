//! Document, query and field fixtures.

use docsync_protocol::{Document, DocumentKey, Fields, Mutation, Query, Target, Version};
use serde_json::Value;

/// Builds document fields from a JSON object.
///
/// # Panics
///
/// Panics if `value` is not a JSON object.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        other => panic!("fields must be a JSON object, got {other}"),
    }
}

/// Builds an existing document.
pub fn doc(key: &str, version: u64, data: Value) -> Document {
    Document::new(key, Version(version), fields(data))
}

/// Builds a deleted document.
pub fn missing(key: &str, version: u64) -> Document {
    Document::missing(key, Version(version))
}

/// An unfiltered query over a collection.
pub fn query(collection: &str) -> Target {
    Target::from(Query::collection(collection))
}

/// A query over a collection ordered by a field.
pub fn ordered_query(collection: &str, field: &str) -> Target {
    Target::from(Query::collection(collection).order_by(field))
}

/// A single-document target.
pub fn doc_target(key: &str) -> Target {
    Target::Document(DocumentKey::new(key))
}

/// A `Set` mutation from a JSON object.
pub fn set(key: &str, data: Value) -> Mutation {
    Mutation::set(key, fields(data))
}

/// A `Patch` mutation from a JSON object.
pub fn patch(key: &str, data: Value) -> Mutation {
    Mutation::patch(key, fields(data))
}
