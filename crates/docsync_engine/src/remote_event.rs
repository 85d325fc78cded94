//! Snapshot-atomic batches of server changes.

use docsync_protocol::{Document, DocumentKey, ResumeToken, TargetId, Version};
use std::collections::{BTreeMap, BTreeSet};

/// Changes to one target's result set within a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Resume token delivered with the current marker.
    pub resume_token: Option<ResumeToken>,
    /// True if the target became current in this snapshot.
    pub current: bool,
    /// Documents added to or updated in the target.
    pub added_documents: BTreeSet<DocumentKey>,
    /// Documents that left the target.
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// Returns true if the change carries nothing.
    pub fn is_empty(&self) -> bool {
        !self.current
            && self.resume_token.is_none()
            && self.added_documents.is_empty()
            && self.removed_documents.is_empty()
    }
}

/// Everything the server reported up to one snapshot boundary, applied to
/// views as a single unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    /// Snapshot version closing the batch.
    pub snapshot_version: Version,
    /// Per-target changes, active targets only.
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose previous server state must be discarded before the
    /// changes are applied.
    pub target_resets: BTreeSet<TargetId>,
    /// Latest state of every document mentioned by a target change.
    pub document_updates: BTreeMap<DocumentKey, Document>,
}

impl RemoteEvent {
    /// Creates an empty event at a version.
    pub fn new(snapshot_version: Version) -> Self {
        Self {
            snapshot_version,
            ..Default::default()
        }
    }

    /// Returns true if the event changes no target.
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty() && self.target_resets.is_empty()
    }

    /// Returns every target touched by the event.
    pub fn affected_targets(&self) -> BTreeSet<TargetId> {
        self.target_changes
            .keys()
            .chain(self.target_resets.iter())
            .copied()
            .collect()
    }

    /// Records a document as added to or updated in a target.
    pub fn add_document(&mut self, target_id: TargetId, document: Document) {
        let change = self.target_changes.entry(target_id).or_default();
        change.removed_documents.remove(&document.key);
        change.added_documents.insert(document.key.clone());
        self.document_updates.insert(document.key.clone(), document);
    }

    /// Records a document as removed from a target.
    pub fn remove_document(&mut self, target_id: TargetId, key: DocumentKey) {
        let change = self.target_changes.entry(target_id).or_default();
        change.added_documents.remove(&key);
        change.removed_documents.insert(key);
    }

    /// Marks a target current.
    pub fn mark_current(&mut self, target_id: TargetId, resume_token: Option<ResumeToken>) {
        let change = self.target_changes.entry(target_id).or_default();
        change.current = true;
        if resume_token.is_some() {
            change.resume_token = resume_token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::Fields;

    #[test]
    fn add_then_remove_keeps_latest_membership() {
        let mut event = RemoteEvent::new(Version(5));
        let doc = Document::new("c/a", Version(5), Fields::new());

        event.add_document(TargetId(1), doc.clone());
        event.remove_document(TargetId(1), doc.key.clone());
        let change = &event.target_changes[&TargetId(1)];
        assert!(change.added_documents.is_empty());
        assert!(change.removed_documents.contains(&doc.key));

        event.add_document(TargetId(1), doc.clone());
        let change = &event.target_changes[&TargetId(1)];
        assert!(change.added_documents.contains(&doc.key));
        assert!(change.removed_documents.is_empty());
    }

    #[test]
    fn affected_targets_include_resets() {
        let mut event = RemoteEvent::new(Version(1));
        assert!(event.is_empty());
        event.target_resets.insert(TargetId(3));
        event.mark_current(TargetId(1), Some("t".into()));
        let affected: Vec<_> = event.affected_targets().into_iter().collect();
        assert_eq!(affected, vec![TargetId(1), TargetId(3)]);
    }
}
