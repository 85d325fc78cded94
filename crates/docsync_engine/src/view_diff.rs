//! Diffing of view cache transitions into listener-facing changes.

use crate::cache_node::CacheNode;
use crate::evaluator::QueryEvaluator;
use crate::view_cache::ViewCache;
use docsync_protocol::{Document, DocumentKey, Target};
use std::collections::BTreeMap;

/// Type of a listener-facing change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Document entered the result set.
    Added,
    /// Document contents or version changed.
    Modified,
    /// Document left the result set.
    Removed,
    /// Only the local-mutation flag changed.
    Metadata,
}

/// A single change reported to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewChange {
    /// Type of change.
    pub kind: ChangeKind,
    /// The document after the change, or before it for removals.
    pub document: Document,
}

impl ViewChange {
    /// Creates a change.
    pub fn new(kind: ChangeKind, document: Document) -> Self {
        Self { kind, document }
    }
}

/// Returns the documents a cache node reports for a target.
///
/// An uninitialized node reports nothing: it makes no claim about the
/// result set.
pub fn effective_documents<'a, E: QueryEvaluator + ?Sized>(
    cache: &'a CacheNode,
    target: &Target,
    evaluator: &E,
) -> BTreeMap<&'a DocumentKey, &'a Document> {
    if !cache.is_fully_initialized() {
        return BTreeMap::new();
    }
    cache
        .existing()
        .filter(|doc| evaluator.matches(target, doc))
        .map(|doc| (&doc.key, doc))
        .collect()
}

/// Returns the event documents of a view in result order.
pub fn sorted_documents<E: QueryEvaluator + ?Sized>(
    view: &ViewCache,
    target: &Target,
    evaluator: &E,
) -> Vec<Document> {
    let mut documents: Vec<Document> = effective_documents(view.event_cache(), target, evaluator)
        .into_values()
        .cloned()
        .collect();
    documents.sort_by(|a, b| evaluator.compare(target, a, b));
    documents
}

/// Computes the ordered changes between two views of the same target.
///
/// Returns `None` when the new event cache is not fully initialized; an
/// incomplete view is never reported, not even partially. Changes are
/// ordered by the target's result order, with removals positioned by the
/// document's old state.
pub fn compute_changes<E: QueryEvaluator + ?Sized>(
    old: &ViewCache,
    new: &ViewCache,
    target: &Target,
    evaluator: &E,
) -> Option<Vec<ViewChange>> {
    if !new.event_cache().is_fully_initialized() {
        return None;
    }

    let before = effective_documents(old.event_cache(), target, evaluator);
    let after = effective_documents(new.event_cache(), target, evaluator);

    let mut changes = Vec::new();
    for (key, doc) in &after {
        match before.get(key) {
            None => changes.push(ViewChange::new(ChangeKind::Added, (*doc).clone())),
            Some(previous) => {
                if let Some(kind) = classify(previous, doc) {
                    changes.push(ViewChange::new(kind, (*doc).clone()));
                }
            }
        }
    }
    for (key, doc) in &before {
        if !after.contains_key(key) {
            changes.push(ViewChange::new(ChangeKind::Removed, (*doc).clone()));
        }
    }

    changes.sort_by(|a, b| evaluator.compare(target, &a.document, &b.document));
    Some(changes)
}

fn classify(previous: &Document, current: &Document) -> Option<ChangeKind> {
    if !previous.same_contents(current) {
        Some(ChangeKind::Modified)
    } else if previous.has_local_mutations != current.has_local_mutations {
        Some(ChangeKind::Metadata)
    } else if previous.version != current.version {
        Some(ChangeKind::Modified)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_node::DocumentMap;
    use crate::evaluator::FieldQueryEvaluator;
    use docsync_protocol::{Fields, Query, Version};
    use serde_json::json;

    fn doc(key: &str, version: u64, rank: i64) -> Document {
        let mut fields = Fields::new();
        fields.insert("rank".into(), json!(rank));
        Document::new(key, Version(version), fields)
    }

    fn view(docs: &[Document], complete: bool) -> ViewCache {
        let map: DocumentMap = docs.iter().map(|d| (d.key.clone(), d.clone())).collect();
        ViewCache::empty()
            .update_server_snap(map.clone(), complete, false)
            .with_event_cache(CacheNode::new(map, complete, false))
    }

    fn target() -> Target {
        Target::from(Query::collection("c").order_by("rank"))
    }

    fn summary(changes: &[ViewChange]) -> Vec<(ChangeKind, String)> {
        changes
            .iter()
            .map(|c| (c.kind, c.document.key.path().to_string()))
            .collect()
    }

    #[test]
    fn incomplete_view_is_suppressed() {
        let old = view(&[], true);
        let new = view(&[doc("c/a", 1, 1)], false);
        assert!(compute_changes(&old, &new, &target(), &FieldQueryEvaluator).is_none());
    }

    #[test]
    fn first_complete_view_reports_everything_added() {
        let old = view(&[doc("c/a", 1, 1)], false);
        let new = view(&[doc("c/b", 1, 2), doc("c/a", 1, 1)], true);
        let changes = compute_changes(&old, &new, &target(), &FieldQueryEvaluator).unwrap();
        assert_eq!(
            summary(&changes),
            vec![
                (ChangeKind::Added, "c/a".to_string()),
                (ChangeKind::Added, "c/b".to_string())
            ]
        );
    }

    #[test]
    fn added_modified_removed_in_query_order() {
        let old = view(&[doc("c/a", 1, 5), doc("c/b", 1, 1), doc("c/c", 1, 3)], true);
        let new = view(&[doc("c/b", 2, 4), doc("c/c", 1, 3), doc("c/d", 1, 2)], true);
        let changes = compute_changes(&old, &new, &target(), &FieldQueryEvaluator).unwrap();
        assert_eq!(
            summary(&changes),
            vec![
                (ChangeKind::Added, "c/d".to_string()),
                (ChangeKind::Modified, "c/b".to_string()),
                (ChangeKind::Removed, "c/a".to_string()),
            ]
        );
    }

    #[test]
    fn removal_uses_old_position() {
        let old = view(&[doc("c/a", 1, 1), doc("c/b", 1, 9)], true);
        let new = view(&[doc("c/b", 2, 0)], true);
        let changes = compute_changes(&old, &new, &target(), &FieldQueryEvaluator).unwrap();
        assert_eq!(
            summary(&changes),
            vec![
                (ChangeKind::Modified, "c/b".to_string()),
                (ChangeKind::Removed, "c/a".to_string()),
            ]
        );
    }

    #[test]
    fn local_flag_flip_is_metadata() {
        let mut local = doc("c/a", 1, 1);
        local.has_local_mutations = true;
        let old = view(&[local], true);
        let new = view(&[doc("c/a", 2, 1)], true);
        let changes = compute_changes(&old, &new, &target(), &FieldQueryEvaluator).unwrap();
        assert_eq!(summary(&changes), vec![(ChangeKind::Metadata, "c/a".to_string())]);
    }

    #[test]
    fn identical_views_produce_no_changes() {
        let old = view(&[doc("c/a", 1, 1)], true);
        let new = view(&[doc("c/a", 1, 1)], true);
        let changes = compute_changes(&old, &new, &target(), &FieldQueryEvaluator).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn sorted_documents_follow_query_order() {
        let v = view(&[doc("c/a", 1, 3), doc("c/b", 1, 1), doc("c/c", 1, 2)], true);
        let keys: Vec<_> = sorted_documents(&v, &target(), &FieldQueryEvaluator)
            .into_iter()
            .map(|d| d.key.path().to_string())
            .collect();
        assert_eq!(keys, vec!["c/b", "c/c", "c/a"]);
    }
}
