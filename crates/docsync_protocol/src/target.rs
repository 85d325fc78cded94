//! Listen targets.

use crate::model::DocumentKey;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-side subscription identifier, allocated by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// Opaque server-issued marker for resuming a target without replaying
/// its history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(pub Bytes);

impl ResumeToken {
    /// Creates a token from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static str> for ResumeToken {
    fn from(token: &'static str) -> Self {
        Self(Bytes::from_static(token.as_bytes()))
    }
}

/// An equality filter on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Field name.
    pub field: String,
    /// Required value.
    pub value: serde_json::Value,
}

/// A query over the direct children of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Collection path.
    pub collection: String,
    /// Equality filters, all of which must hold.
    pub filters: Vec<FieldFilter>,
    /// Optional field to order results by (ascending, key as tiebreak).
    pub order_by: Option<String>,
}

impl Query {
    /// Creates an unfiltered query over a collection.
    pub fn collection(path: impl AsRef<str>) -> Self {
        Self {
            collection: path.as_ref().trim_matches('/').to_string(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    /// Adds an equality filter.
    pub fn where_eq(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value,
        });
        self
    }

    /// Orders results by a field.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    /// Returns true if the query has filters that exclude documents of the
    /// collection.
    pub fn is_filtered(&self) -> bool {
        !self.filters.is_empty()
    }
}

/// What a listener watches: a query or a single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// A collection query.
    Query(Query),
    /// A single document.
    Document(DocumentKey),
}

impl Target {
    /// Returns a stable identity string.
    ///
    /// Two targets with the same canonical id share one server
    /// subscription.
    pub fn canonical_id(&self) -> String {
        match self {
            Target::Document(key) => format!("doc:{}", key.path()),
            Target::Query(query) => {
                let mut id = format!("query:{}", query.collection);
                for filter in &query.filters {
                    id.push_str(&format!("|{}=={}", filter.field, filter.value));
                }
                if let Some(order) = &query.order_by {
                    id.push_str(&format!("|order:{order}"));
                }
                id
            }
        }
    }

    /// Returns true if a document with this key could belong to the target.
    ///
    /// This is a path check only; predicates are evaluated elsewhere.
    pub fn covers(&self, key: &DocumentKey) -> bool {
        match self {
            Target::Document(target_key) => target_key == key,
            Target::Query(query) => key.collection() == query.collection,
        }
    }

    /// Returns true if the server may have excluded children of the covered
    /// path from this target's result set.
    pub fn is_filtered(&self) -> bool {
        match self {
            Target::Document(_) => false,
            Target::Query(query) => query.is_filtered(),
        }
    }

    /// Returns true if this is a single-document target.
    pub fn is_document(&self) -> bool {
        matches!(self, Target::Document(_))
    }
}

impl From<Query> for Target {
    fn from(query: Query) -> Self {
        Target::Query(query)
    }
}

impl From<DocumentKey> for Target {
    fn from(key: DocumentKey) -> Self {
        Target::Document(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_ids_distinguish_filters() {
        let plain = Target::from(Query::collection("rooms"));
        let filtered = Target::from(Query::collection("rooms").where_eq("open", json!(true)));
        assert_ne!(plain.canonical_id(), filtered.canonical_id());
        assert_eq!(
            plain.canonical_id(),
            Target::from(Query::collection("/rooms/")).canonical_id()
        );
    }

    #[test]
    fn covers_direct_children_only() {
        let target = Target::from(Query::collection("rooms"));
        assert!(target.covers(&DocumentKey::new("rooms/a")));
        assert!(!target.covers(&DocumentKey::new("rooms/a/messages/m1")));
        assert!(!target.covers(&DocumentKey::new("halls/a")));

        let doc = Target::from(DocumentKey::new("rooms/a"));
        assert!(doc.covers(&DocumentKey::new("rooms/a")));
        assert!(!doc.covers(&DocumentKey::new("rooms/b")));
    }

    #[test]
    fn filtered_flag() {
        assert!(!Target::from(Query::collection("rooms")).is_filtered());
        assert!(Target::from(Query::collection("rooms").where_eq("x", json!(1))).is_filtered());
        assert!(!Target::from(DocumentKey::new("rooms/a")).is_filtered());
    }
}
