//! Ordered queue of local writes awaiting the server.

use docsync_protocol::{
    BatchId, Document, DocumentKey, Mutation, MutationBatch, MutationKind, Version,
};
use std::collections::{BTreeSet, VecDeque};

/// Server status of a queued batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Not yet confirmed.
    Pending,
    /// Committed at the given version; kept until the watch stream has
    /// caught up with that version.
    Acknowledged(Version),
}

/// An entry in the mutation queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// The batch.
    pub batch: MutationBatch,
    /// Server status.
    pub status: BatchStatus,
    /// Whether the batch was written to the current stream.
    pub sent: bool,
}

impl QueueEntry {
    fn new(batch: MutationBatch) -> Self {
        Self {
            batch,
            status: BatchStatus::Pending,
            sent: false,
        }
    }

    /// Returns true if the server has not confirmed the batch.
    pub fn is_pending(&self) -> bool {
        self.status == BatchStatus::Pending
    }
}

/// Local writes in submission order.
///
/// # Invariants
///
/// - Batches are overlaid in strict submission order.
/// - A batch leaves the queue only on rejection, or after acknowledgement
///   once a remote snapshot at or past its commit version was applied.
#[derive(Debug)]
pub struct MutationQueue {
    entries: VecDeque<QueueEntry>,
    next_batch_id: u64,
}

impl MutationQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_batch_id: 1,
        }
    }

    /// Restores a queue from persisted batches.
    pub fn from_batches(batches: Vec<MutationBatch>) -> Self {
        let next_batch_id = batches
            .iter()
            .map(|batch| batch.batch_id.0 + 1)
            .max()
            .unwrap_or(1);
        let mut batches = batches;
        batches.sort_by_key(|batch| batch.batch_id);
        Self {
            entries: batches.into_iter().map(QueueEntry::new).collect(),
            next_batch_id,
        }
    }

    /// Appends a batch and returns it with its assigned id.
    pub fn append(&mut self, mutations: Vec<Mutation>) -> MutationBatch {
        let batch_id = BatchId(self.next_batch_id);
        self.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, mutations);
        self.entries.push_back(QueueEntry::new(batch.clone()));
        batch
    }

    /// Marks a batch committed. Returns the batch if it was pending.
    pub fn acknowledge(&mut self, batch_id: BatchId, commit_version: Version) -> Option<&MutationBatch> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.batch.batch_id == batch_id && entry.is_pending())?;
        entry.status = BatchStatus::Acknowledged(commit_version);
        Some(&entry.batch)
    }

    /// Removes a rejected batch.
    pub fn reject(&mut self, batch_id: BatchId) -> Option<MutationBatch> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.batch.batch_id == batch_id && entry.is_pending())?;
        self.entries.remove(idx).map(|entry| entry.batch)
    }

    /// Drops acknowledged batches whose commit version the watch stream has
    /// reached.
    pub fn release_acknowledged(&mut self, snapshot_version: Version) -> Vec<MutationBatch> {
        let mut released = Vec::new();
        self.entries.retain(|entry| match entry.status {
            BatchStatus::Acknowledged(commit) if commit <= snapshot_version => {
                released.push(entry.batch.clone());
                false
            }
            _ => true,
        });
        released
    }

    /// Returns batches to write, keeping at most `limit` unacknowledged
    /// batches on the wire.
    pub fn take_unsent(&mut self, limit: usize) -> Vec<MutationBatch> {
        let in_flight = self
            .entries
            .iter()
            .filter(|entry| entry.is_pending() && entry.sent)
            .count();
        let budget = limit.saturating_sub(in_flight);
        self.entries
            .iter_mut()
            .filter(|entry| entry.is_pending() && !entry.sent)
            .take(budget)
            .map(|entry| {
                entry.sent = true;
                entry.batch.clone()
            })
            .collect()
    }

    /// Forgets which batches were written; the next stream resends them.
    pub fn mark_all_unsent(&mut self) {
        for entry in &mut self.entries {
            entry.sent = false;
        }
    }

    /// Applies every queued write for `key` on top of `base`, in order.
    pub fn overlay(&self, key: &DocumentKey, base: Option<&Document>) -> Option<Document> {
        let mut doc = base.cloned();
        for entry in &self.entries {
            for mutation in entry.batch.mutations.iter().filter(|m| &m.key == key) {
                doc = match entry.status {
                    BatchStatus::Pending => mutation.apply_to_local_view(doc.as_ref()),
                    BatchStatus::Acknowledged(commit) => match &doc {
                        Some(current) if current.version >= commit && !current.has_local_mutations => {
                            doc
                        }
                        _ => mutation.apply_committed(doc.as_ref(), commit),
                    },
                };
            }
        }
        doc
    }

    /// Returns true if a queued write replaces the whole document, so the
    /// local state of `key` is known without the server.
    pub fn overwrites(&self, key: &DocumentKey) -> bool {
        self.entries
            .iter()
            .flat_map(|entry| entry.batch.mutations.iter())
            .any(|mutation| &mutation.key == key && mutation.kind != MutationKind::Patch)
    }

    /// Returns every key written by a queued batch.
    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.entries
            .iter()
            .flat_map(|entry| entry.batch.keys().cloned())
            .collect()
    }

    /// Returns unacknowledged batches in order.
    pub fn pending(&self) -> impl Iterator<Item = &MutationBatch> {
        self.entries
            .iter()
            .filter(|entry| entry.is_pending())
            .map(|entry| &entry.batch)
    }

    /// Returns the number of unacknowledged batches.
    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    /// Returns true if any batch awaits the server's decision.
    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(QueueEntry::is_pending)
    }

    /// Returns the total number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::Fields;
    use serde_json::json;

    fn set(key: &str, val: i64) -> Mutation {
        let mut fields = Fields::new();
        fields.insert("val".into(), json!(val));
        Mutation::set(key, fields)
    }

    #[test]
    fn append_assigns_batch_ids() {
        let mut queue = MutationQueue::new();
        assert_eq!(queue.append(vec![set("c/a", 1)]).batch_id, BatchId(1));
        assert_eq!(queue.append(vec![set("c/b", 1)]).batch_id, BatchId(2));
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn restore_continues_numbering() {
        let queue = MutationQueue::from_batches(vec![
            MutationBatch::new(BatchId(7), vec![set("c/a", 1)]),
            MutationBatch::new(BatchId(3), vec![set("c/a", 2)]),
        ]);
        let ids: Vec<_> = queue.pending().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![BatchId(3), BatchId(7)]);

        let mut queue = queue;
        assert_eq!(queue.append(vec![]).batch_id, BatchId(8));
    }

    #[test]
    fn overlay_applies_in_submission_order() {
        let mut queue = MutationQueue::new();
        queue.append(vec![set("c/a", 1)]);
        queue.append(vec![set("c/a", 2)]);

        let key = DocumentKey::new("c/a");
        let doc = queue.overlay(&key, None).unwrap();
        assert_eq!(doc.field("val"), Some(&json!(2)));
        assert!(doc.has_local_mutations);
    }

    #[test]
    fn acknowledged_overlay_until_watch_catches_up() {
        let mut queue = MutationQueue::new();
        let batch = queue.append(vec![set("c/a", 1)]);
        queue.acknowledge(batch.batch_id, Version(5)).unwrap();
        assert!(!queue.has_pending());

        let key = DocumentKey::new("c/a");
        let base = Document::new("c/a", Version(3), Fields::new());
        let doc = queue.overlay(&key, Some(&base)).unwrap();
        assert_eq!(doc.version, Version(5));
        assert!(!doc.has_local_mutations);

        let caught_up = Document::new("c/a", Version(5), Fields::new());
        assert_eq!(queue.overlay(&key, Some(&caught_up)), Some(caught_up));

        assert!(queue.release_acknowledged(Version(4)).is_empty());
        assert_eq!(queue.release_acknowledged(Version(5)).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn reject_removes_only_pending() {
        let mut queue = MutationQueue::new();
        let first = queue.append(vec![set("c/a", 1)]);
        let second = queue.append(vec![set("c/b", 1)]);
        queue.acknowledge(first.batch_id, Version(1));

        assert!(queue.reject(first.batch_id).is_none());
        assert_eq!(queue.reject(second.batch_id).map(|b| b.batch_id), Some(second.batch_id));
        assert!(queue.reject(second.batch_id).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unsent_batches_respect_in_flight_limit() {
        let mut queue = MutationQueue::new();
        for i in 0..5 {
            queue.append(vec![set("c/a", i)]);
        }
        assert_eq!(queue.take_unsent(2).len(), 2);
        assert!(queue.take_unsent(2).is_empty());

        queue.acknowledge(BatchId(1), Version(1));
        let next = queue.take_unsent(2);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].batch_id, BatchId(3));

        queue.mark_all_unsent();
        let resent: Vec<_> = queue.take_unsent(10).iter().map(|b| b.batch_id).collect();
        assert_eq!(resent, vec![BatchId(2), BatchId(3), BatchId(4), BatchId(5)]);
    }

    #[test]
    fn keys_cover_all_entries() {
        let mut queue = MutationQueue::new();
        queue.append(vec![set("c/a", 1), Mutation::delete("c/b")]);
        let keys: Vec<_> = queue.keys().into_iter().map(|k| k.path().to_string()).collect();
        assert_eq!(keys, vec!["c/a", "c/b"]);
        assert!(queue.overwrites(&DocumentKey::new("c/b")));

        queue.append(vec![Mutation::patch("c/p", Fields::new())]);
        assert!(!queue.overwrites(&DocumentKey::new("c/p")));
    }
}
