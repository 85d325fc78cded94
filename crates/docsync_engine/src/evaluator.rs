//! Query predicate evaluation.

use docsync_protocol::{Document, Query, Target};
use serde_json::Value;
use std::cmp::Ordering;

/// Decides query membership and result order.
///
/// Implementations must be pure: the same inputs always produce the same
/// answer.
pub trait QueryEvaluator: Send + Sync {
    /// Returns true if the existing document belongs to the target's results.
    fn matches(&self, target: &Target, document: &Document) -> bool;

    /// Orders two documents of the target's results.
    fn compare(&self, target: &Target, a: &Document, b: &Document) -> Ordering;
}

/// Evaluator for collection queries with equality filters and an optional
/// single-field order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldQueryEvaluator;

impl FieldQueryEvaluator {
    fn query_matches(query: &Query, document: &Document) -> bool {
        document.key.collection() == query.collection
            && query
                .filters
                .iter()
                .all(|filter| document.field(&filter.field) == Some(&filter.value))
    }
}

impl QueryEvaluator for FieldQueryEvaluator {
    fn matches(&self, target: &Target, document: &Document) -> bool {
        if !document.exists() {
            return false;
        }
        match target {
            Target::Document(key) => &document.key == key,
            Target::Query(query) => Self::query_matches(query, document),
        }
    }

    fn compare(&self, target: &Target, a: &Document, b: &Document) -> Ordering {
        let by_field = match target {
            Target::Query(Query {
                order_by: Some(field),
                ..
            }) => compare_optional(a.field(field), b.field(field)),
            _ => Ordering::Equal,
        };
        by_field.then_with(|| a.key.cmp(&b.key))
    }
}

/// Documents without the ordering field sort first.
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by type first, then by value.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| compare_values(x, y))
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((kx, vx), (ky, vy))| kx.cmp(ky).then_with(|| compare_values(vx, vy)))
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{DocumentKey, Fields, Version};
    use serde_json::json;

    fn doc(key: &str, pairs: &[(&str, Value)]) -> Document {
        let fields: Fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Document::new(key, Version(1), fields)
    }

    #[test]
    fn collection_and_filters() {
        let evaluator = FieldQueryEvaluator;
        let open = Target::from(Query::collection("rooms").where_eq("open", json!(true)));

        assert!(evaluator.matches(&open, &doc("rooms/a", &[("open", json!(true))])));
        assert!(!evaluator.matches(&open, &doc("rooms/a", &[("open", json!(false))])));
        assert!(!evaluator.matches(&open, &doc("rooms/a", &[])));
        assert!(!evaluator.matches(&open, &doc("halls/a", &[("open", json!(true))])));
        assert!(!evaluator.matches(&open, &Document::missing("rooms/a", Version(1))));
    }

    #[test]
    fn document_target() {
        let evaluator = FieldQueryEvaluator;
        let target = Target::from(DocumentKey::new("rooms/a"));
        assert!(evaluator.matches(&target, &doc("rooms/a", &[])));
        assert!(!evaluator.matches(&target, &doc("rooms/b", &[])));
    }

    #[test]
    fn ordering_by_field_then_key() {
        let evaluator = FieldQueryEvaluator;
        let target = Target::from(Query::collection("rooms").order_by("rank"));

        let a = doc("rooms/a", &[("rank", json!(2))]);
        let b = doc("rooms/b", &[("rank", json!(1))]);
        let c = doc("rooms/c", &[("rank", json!(1))]);
        let none = doc("rooms/z", &[]);

        let mut docs = vec![a.clone(), none.clone(), c.clone(), b.clone()];
        docs.sort_by(|x, y| evaluator.compare(&target, x, y));
        let keys: Vec<_> = docs.iter().map(|d| d.key.path().to_string()).collect();
        assert_eq!(keys, vec!["rooms/z", "rooms/b", "rooms/c", "rooms/a"]);
    }

    #[test]
    fn value_order_across_types() {
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(10), &json!(9.5)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!(1)), Ordering::Greater);
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
    }
}
