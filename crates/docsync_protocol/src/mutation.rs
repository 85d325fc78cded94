//! Local writes.

use crate::model::{Document, DocumentKey, Fields, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Document is overwritten.
    Set,
    /// Fields are merged into an existing document.
    Patch,
    /// Document is deleted.
    Delete,
}

/// A single write to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Document being written.
    pub key: DocumentKey,
    /// Write kind.
    pub kind: MutationKind,
    /// Field values (empty for deletes).
    pub data: Fields,
}

impl Mutation {
    /// Creates a full overwrite.
    pub fn set(key: impl Into<DocumentKey>, data: Fields) -> Self {
        Self {
            key: key.into(),
            kind: MutationKind::Set,
            data,
        }
    }

    /// Creates a field merge.
    pub fn patch(key: impl Into<DocumentKey>, data: Fields) -> Self {
        Self {
            key: key.into(),
            kind: MutationKind::Patch,
            data,
        }
    }

    /// Creates a delete.
    pub fn delete(key: impl Into<DocumentKey>) -> Self {
        Self {
            key: key.into(),
            kind: MutationKind::Delete,
            data: Fields::new(),
        }
    }

    /// Applies this write to the locally known state of the document.
    ///
    /// `base` is `None` when nothing is known about the document. A patch
    /// only applies to a document known to exist; otherwise the result is
    /// `base` unchanged. The returned document keeps the base version and is
    /// flagged with `has_local_mutations`.
    pub fn apply_to_local_view(&self, base: Option<&Document>) -> Option<Document> {
        let version = base.map(|doc| doc.version).unwrap_or(Version::MIN);
        let data = match self.kind {
            MutationKind::Set => Some(self.data.clone()),
            MutationKind::Delete => None,
            MutationKind::Patch => match base.and_then(|doc| doc.data.as_ref()) {
                Some(existing) => {
                    let mut merged = existing.clone();
                    merged.extend(self.data.iter().map(|(k, v)| (k.clone(), v.clone())));
                    Some(merged)
                }
                None => return base.cloned(),
            },
        };
        Some(Document {
            key: self.key.clone(),
            version,
            data,
            has_local_mutations: true,
        })
    }

    /// Applies an acknowledged write at its commit version.
    ///
    /// Used while the watch stream has not yet caught up with the commit:
    /// the result carries `commit_version` and no local-mutation flag.
    pub fn apply_committed(&self, base: Option<&Document>, commit_version: Version) -> Option<Document> {
        self.apply_to_local_view(base).map(|mut doc| {
            doc.version = commit_version;
            doc.has_local_mutations = false;
            doc
        })
    }
}

/// Identifier of a mutation batch, assigned in submission order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

/// An atomic group of writes submitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Batch ID.
    pub batch_id: BatchId,
    /// Writes, applied in order.
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    /// Creates a new batch.
    pub fn new(batch_id: BatchId, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            mutations,
        }
    }

    /// Returns the keys written by this batch.
    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.mutations.iter().map(|m| &m.key)
    }

    /// Returns true if the batch writes the given key.
    pub fn touches(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|m| &m.key == key)
    }
}
