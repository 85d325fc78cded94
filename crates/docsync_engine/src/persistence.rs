//! Persistence seam for cached views and queued writes.

use crate::error::SyncResult;
use crate::view_cache::ViewCache;
use docsync_protocol::{BatchId, MutationBatch, Status, Target, Version};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Final server decision on a mutation batch.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Committed at a version.
    Acknowledged(Version),
    /// Rejected with a status.
    Rejected(Status),
}

/// Local storage used by the sync engine.
///
/// Calls are made from the engine's single thread of control, one at a
/// time; implementations only need interior mutability.
pub trait Persistence: Send + Sync {
    /// Loads the last persisted view of a target.
    fn load_cached_view(&self, target: &Target) -> SyncResult<Option<ViewCache>>;

    /// Stores the current view of a target.
    fn persist_view(&self, target: &Target, view: &ViewCache) -> SyncResult<()>;

    /// Loads batches that never received a server decision, in submission
    /// order.
    fn load_pending_mutations(&self) -> SyncResult<Vec<MutationBatch>>;

    /// Stores a newly submitted batch.
    fn persist_mutation(&self, batch: &MutationBatch) -> SyncResult<()>;

    /// Records the server decision on a batch.
    fn persist_mutation_result(&self, batch_id: BatchId, outcome: &MutationOutcome) -> SyncResult<()>;
}

impl<P: Persistence + ?Sized> Persistence for Arc<P> {
    fn load_cached_view(&self, target: &Target) -> SyncResult<Option<ViewCache>> {
        (**self).load_cached_view(target)
    }

    fn persist_view(&self, target: &Target, view: &ViewCache) -> SyncResult<()> {
        (**self).persist_view(target, view)
    }

    fn load_pending_mutations(&self) -> SyncResult<Vec<MutationBatch>> {
        (**self).load_pending_mutations()
    }

    fn persist_mutation(&self, batch: &MutationBatch) -> SyncResult<()> {
        (**self).persist_mutation(batch)
    }

    fn persist_mutation_result(&self, batch_id: BatchId, outcome: &MutationOutcome) -> SyncResult<()> {
        (**self).persist_mutation_result(batch_id, outcome)
    }
}

/// An in-memory persistence layer.
///
/// Share it through an `Arc` to simulate a process restart with a second
/// engine.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    views: RwLock<HashMap<String, ViewCache>>,
    pending: RwLock<BTreeMap<BatchId, MutationBatch>>,
    results: RwLock<Vec<(BatchId, MutationOutcome)>>,
}

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded mutation outcomes, oldest first.
    pub fn mutation_results(&self) -> Vec<(BatchId, MutationOutcome)> {
        self.results.read().clone()
    }

    /// Returns the number of stored views.
    pub fn view_count(&self) -> usize {
        self.views.read().len()
    }
}

impl Persistence for MemoryPersistence {
    fn load_cached_view(&self, target: &Target) -> SyncResult<Option<ViewCache>> {
        Ok(self.views.read().get(&target.canonical_id()).cloned())
    }

    fn persist_view(&self, target: &Target, view: &ViewCache) -> SyncResult<()> {
        self.views
            .write()
            .insert(target.canonical_id(), view.clone());
        Ok(())
    }

    fn load_pending_mutations(&self) -> SyncResult<Vec<MutationBatch>> {
        Ok(self.pending.read().values().cloned().collect())
    }

    fn persist_mutation(&self, batch: &MutationBatch) -> SyncResult<()> {
        self.pending.write().insert(batch.batch_id, batch.clone());
        Ok(())
    }

    fn persist_mutation_result(&self, batch_id: BatchId, outcome: &MutationOutcome) -> SyncResult<()> {
        self.pending.write().remove(&batch_id);
        self.results.write().push((batch_id, outcome.clone()));
        Ok(())
    }
}
