//! Immutable point-in-time document sets.

use docsync_protocol::{Document, DocumentKey};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Documents of a cache node, keyed by document key.
pub type DocumentMap = BTreeMap<DocumentKey, Document>;

/// An immutable snapshot of the documents known for one target.
///
/// A cache node only stores complete documents. It additionally records
/// whether it is fully initialized (known to represent a valid state of the
/// world at one point in time, from the server or a complete client
/// overwrite) and whether the server may have excluded documents of the
/// covered path because of a predicate.
///
/// The document map is shared behind an `Arc`; cloning a node never copies
/// documents.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheNode {
    documents: Arc<DocumentMap>,
    fully_initialized: bool,
    filtered: bool,
}

impl CacheNode {
    /// Creates a node.
    pub fn new(documents: DocumentMap, fully_initialized: bool, filtered: bool) -> Self {
        Self {
            documents: Arc::new(documents),
            fully_initialized,
            filtered,
        }
    }

    /// Creates an empty, uninitialized node.
    pub fn empty() -> Self {
        Self::new(DocumentMap::new(), false, false)
    }

    /// Returns a node sharing this node's documents with different flags.
    pub fn with_flags(&self, fully_initialized: bool, filtered: bool) -> Self {
        Self {
            documents: Arc::clone(&self.documents),
            fully_initialized,
            filtered,
        }
    }

    /// Returns true if the node was initialized with server data or a
    /// complete client overwrite.
    pub fn is_fully_initialized(&self) -> bool {
        self.fully_initialized
    }

    /// Returns true if documents may be missing because of a filter.
    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// Returns true if membership queries against this node are
    /// authoritative: an absent key is known not to belong.
    pub fn is_complete(&self) -> bool {
        self.fully_initialized && !self.filtered
    }

    /// Returns true if the node knows the state of `key`.
    pub fn is_complete_for_key(&self, key: &DocumentKey) -> bool {
        self.is_complete() || self.documents.contains_key(key)
    }

    /// Returns all documents, including "does not exist" markers.
    pub fn documents(&self) -> &DocumentMap {
        &self.documents
    }

    /// Returns the documents that exist.
    pub fn existing(&self) -> impl Iterator<Item = &Document> {
        self.documents.values().filter(|doc| doc.exists())
    }

    /// Looks up a document.
    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.documents.get(key)
    }

    /// Returns the number of existing documents.
    pub fn len(&self) -> usize {
        self.existing().count()
    }

    /// Returns true if no document exists in the node.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if both nodes share the same document map allocation.
    pub fn shares_documents_with(&self, other: &CacheNode) -> bool {
        Arc::ptr_eq(&self.documents, &other.documents)
    }
}

impl Default for CacheNode {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{Fields, Version};

    fn node(keys: &[&str], fully_initialized: bool, filtered: bool) -> CacheNode {
        let documents = keys
            .iter()
            .map(|k| {
                let doc = Document::new(*k, Version(1), Fields::new());
                (doc.key.clone(), doc)
            })
            .collect();
        CacheNode::new(documents, fully_initialized, filtered)
    }

    #[test]
    fn completeness() {
        let a = DocumentKey::new("c/a");
        let z = DocumentKey::new("c/z");

        let complete = node(&["c/a"], true, false);
        assert!(complete.is_complete());
        assert!(complete.is_complete_for_key(&z));

        let filtered = node(&["c/a"], true, true);
        assert!(!filtered.is_complete());
        assert!(filtered.is_complete_for_key(&a));
        assert!(!filtered.is_complete_for_key(&z));

        let partial = node(&["c/a"], false, false);
        assert!(!partial.is_complete_for_key(&z));
    }

    #[test]
    fn missing_markers_are_not_counted() {
        let mut documents = DocumentMap::new();
        let gone = Document::missing("c/gone", Version(2));
        documents.insert(gone.key.clone(), gone);
        let node = CacheNode::new(documents, true, false);

        assert!(node.is_empty());
        assert!(node.get(&DocumentKey::new("c/gone")).is_some());
    }

    #[test]
    fn flags_share_documents() {
        let original = node(&["c/a", "c/b"], false, false);
        let flagged = original.with_flags(true, false);
        assert!(flagged.shares_documents_with(&original));
        assert!(flagged.is_fully_initialized());
        assert_eq!(flagged.len(), 2);
    }
}
