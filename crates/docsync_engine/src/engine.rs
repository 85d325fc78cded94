//! The sync engine.
//!
//! `SyncEngine` owns every view, the mutation queue and the listener
//! registry. It is a synchronous state machine: each entry point takes
//! `&mut self`, performs one transition and pushes the resulting snapshots
//! to listener channels. I/O is left to the caller, which feeds stream
//! events in and writes [`SyncEngine::take_outbound`] out.
//!
//! ## Key Invariants
//!
//! - Listeners never see a view whose event cache is not fully initialized.
//! - A listener's first snapshot reports its whole result set as added;
//!   later snapshots report the difference to what that listener last saw.
//! - Pending writes are overlaid on server data in submission order.

use crate::cache_node::{CacheNode, DocumentMap};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::evaluator::QueryEvaluator;
use crate::mutation_queue::MutationQueue;
use crate::persistence::{MutationOutcome, Persistence};
use crate::remote_event::RemoteEvent;
use crate::view_cache::ViewCache;
use crate::view_diff::{compute_changes, effective_documents, sorted_documents, ViewChange};
use crate::watch::{StreamState, WatchEvent, WatchStreamCoordinator};
use docsync_protocol::{
    BatchId, Document, Mutation, MutationBatch, Status, StreamError, StreamEvent, StreamRequest,
    Target, TargetId, Version, WatchChange,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Handle of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A view as delivered to a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    /// The watched target.
    pub target: Target,
    /// Every document in the view, in result order.
    pub documents: Vec<Document>,
    /// Changes since the listener's previous snapshot, in result order.
    pub changes: Vec<ViewChange>,
    /// True while the view is not confirmed current by the server or
    /// includes unconfirmed local writes.
    pub from_cache: bool,
    /// True if any document carries unconfirmed local writes.
    pub has_pending_writes: bool,
}

/// Item delivered on a listener channel. An error is terminal.
pub type ListenEvent = SyncResult<ViewSnapshot>;

/// Completion of a submitted mutation batch.
///
/// Resolves to the commit version, or to the rejection. Await it, or poll
/// with [`MutationHandle::try_result`].
#[derive(Debug)]
pub struct MutationHandle {
    batch_id: BatchId,
    receiver: oneshot::Receiver<SyncResult<Version>>,
}

impl MutationHandle {
    /// The batch this handle tracks.
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Returns the outcome if it is known.
    ///
    /// Once an outcome was returned, later calls report `Shutdown`.
    pub fn try_result(&mut self) -> Option<SyncResult<Version>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SyncError::Shutdown)),
        }
    }
}

impl Future for MutationHandle {
    type Output = SyncResult<Version>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(SyncError::Shutdown)))
    }
}

/// Statistics about the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Remote snapshots applied to views.
    pub snapshots_applied: u64,
    /// Snapshots delivered to listeners.
    pub events_emitted: u64,
    /// Mutation batches submitted.
    pub mutations_submitted: u64,
    /// Mutation batches committed by the server.
    pub mutations_acknowledged: u64,
    /// Mutation batches rejected by the server.
    pub mutations_rejected: u64,
    /// Targets rejected by the server.
    pub targets_rejected: u64,
    /// Times the stream closed.
    pub stream_restarts: u64,
    /// Full resyncs after a protocol desynchronization.
    pub resyncs: u64,
}

#[derive(Debug)]
struct View {
    target: Target,
    cache: ViewCache,
    listeners: BTreeSet<ListenerId>,
}

#[derive(Debug)]
struct Listener {
    target_id: TargetId,
    sender: mpsc::UnboundedSender<ListenEvent>,
    last_seen: ViewCache,
    last_flags: Option<(bool, bool)>,
}

/// Reconciles server data, local writes and listeners.
pub struct SyncEngine<P: Persistence, E: QueryEvaluator> {
    config: SyncConfig,
    persistence: P,
    evaluator: E,
    coordinator: WatchStreamCoordinator,
    queue: MutationQueue,
    views: BTreeMap<TargetId, View>,
    listeners: BTreeMap<ListenerId, Listener>,
    next_listener_id: u64,
    write_callbacks: HashMap<BatchId, oneshot::Sender<SyncResult<Version>>>,
    last_snapshot_version: Version,
    enabled: bool,
    restart_requested: bool,
    stats: SyncStats,
}

impl<P: Persistence, E: QueryEvaluator> SyncEngine<P, E> {
    /// Creates an engine, restoring writes that never got a server
    /// decision.
    pub fn new(config: SyncConfig, persistence: P, evaluator: E) -> SyncResult<Self> {
        let queue = MutationQueue::from_batches(persistence.load_pending_mutations()?);
        if !queue.is_empty() {
            info!(batches = queue.len(), "restored pending mutations");
        }
        Ok(Self {
            coordinator: WatchStreamCoordinator::new(config.backoff.clone()),
            config,
            persistence,
            evaluator,
            queue,
            views: BTreeMap::new(),
            listeners: BTreeMap::new(),
            next_listener_id: 1,
            write_callbacks: HashMap::new(),
            last_snapshot_version: Version::MIN,
            enabled: true,
            restart_requested: false,
            stats: SyncStats::default(),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The watch stream coordinator.
    pub fn coordinator(&self) -> &WatchStreamCoordinator {
        &self.coordinator
    }

    /// Current stream state.
    pub fn stream_state(&self) -> StreamState {
        self.coordinator.state()
    }

    /// Current statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.clone()
    }

    /// Returns the cached view of a target.
    pub fn view(&self, target: &Target) -> Option<&ViewCache> {
        let target_id = self.coordinator.targets().target_id_for(target)?;
        self.views.get(&target_id).map(|view| &view.cache)
    }

    /// Returns the target a listener is attached to.
    pub fn listener_target(&self, listener_id: ListenerId) -> Option<TargetId> {
        self.listeners
            .get(&listener_id)
            .map(|listener| listener.target_id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of batches awaiting a server decision.
    pub fn pending_mutation_count(&self) -> usize {
        self.queue.pending_count()
    }

    /// Returns false while the network is disabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns true if a stream should exist: the network is enabled and
    /// something is watched or waiting to be written.
    pub fn should_connect(&self) -> bool {
        self.enabled
            && (self.coordinator.targets().has_listening_targets() || self.queue.has_pending())
    }

    /// Returns and clears a pending request to tear down the current
    /// stream after a resync.
    pub fn take_restart_request(&mut self) -> bool {
        std::mem::take(&mut self.restart_requested)
    }

    /// Registers a listener on a target.
    ///
    /// If the view is already initialized the listener receives its whole
    /// content as added before any later change.
    pub fn listen(&mut self, target: Target) -> (ListenerId, mpsc::UnboundedReceiver<ListenEvent>) {
        let target_id = self.coordinator.targets_mut().listen(target.clone());
        if !self.views.contains_key(&target_id) {
            let server_cache = self.load_server_cache(&target);
            let cache = ViewCache::new(CacheNode::empty(), server_cache);
            self.views.insert(
                target_id,
                View {
                    target,
                    cache,
                    listeners: BTreeSet::new(),
                },
            );
            self.recompute(target_id);
        }

        let listener_id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.insert(
            listener_id,
            Listener {
                target_id,
                sender,
                last_seen: ViewCache::empty(),
                last_flags: None,
            },
        );
        if let Some(view) = self.views.get_mut(&target_id) {
            view.listeners.insert(listener_id);
        }
        debug!(%listener_id, %target_id, "listener attached");

        self.dispatch(target_id);
        (listener_id, receiver)
    }

    /// Removes a listener. The target is unwatched with its last listener.
    pub fn unlisten(&mut self, listener_id: ListenerId) -> SyncResult<()> {
        let listener = self
            .listeners
            .remove(&listener_id)
            .ok_or(SyncError::UnknownListener(listener_id.0))?;
        let target_id = listener.target_id;

        let last = match self.views.get_mut(&target_id) {
            Some(view) => {
                view.listeners.remove(&listener_id);
                view.listeners.is_empty()
            }
            None => false,
        };
        debug!(%listener_id, %target_id, last, "listener detached");

        if last {
            self.persist_view(target_id);
            self.coordinator.targets_mut().unlisten(target_id);
            self.prune_views();
        }
        Ok(())
    }

    /// Queues a batch of writes and overlays it on every affected view.
    pub fn submit_mutation(&mut self, mutations: Vec<Mutation>) -> SyncResult<MutationHandle> {
        let batch = self.queue.append(mutations);
        if let Err(err) = self.persistence.persist_mutation(&batch) {
            self.queue.reject(batch.batch_id);
            return Err(err);
        }

        let (sender, receiver) = oneshot::channel();
        self.write_callbacks.insert(batch.batch_id, sender);
        self.stats.mutations_submitted += 1;
        debug!(
            batch_id = %batch.batch_id,
            mutations = batch.mutations.len(),
            "mutation submitted"
        );

        self.refresh_batches(std::slice::from_ref(&batch));
        Ok(MutationHandle {
            batch_id: batch.batch_id,
            receiver,
        })
    }

    /// Moves the stream to connecting. Returns false if one is already
    /// started.
    pub fn begin_connect(&mut self) -> bool {
        self.coordinator.begin_connect()
    }

    /// Dispatches one inbound stream event.
    ///
    /// Returns the reconnect delay when the event closed the stream.
    pub fn handle_stream_event(&mut self, event: StreamEvent, now: Instant) -> Option<Duration> {
        trace!(type_code = event.type_code(), "stream event");
        match event {
            StreamEvent::Open => self.handle_stream_open(now),
            StreamEvent::Watch(change) => self.handle_watch_change(change),
            StreamEvent::WriteAcked {
                batch_id,
                commit_version,
            } => self.handle_write_ack(batch_id, commit_version),
            StreamEvent::WriteRejected { batch_id, status } => {
                self.handle_write_reject(batch_id, status)
            }
            StreamEvent::Closed(error) => return Some(self.handle_stream_close(error, now)),
        }
        None
    }

    /// Handles the stream finishing its handshake.
    pub fn handle_stream_open(&mut self, now: Instant) {
        self.coordinator.on_open(now);
        self.queue.mark_all_unsent();
    }

    /// Handles one watch change.
    ///
    /// A protocol desynchronization triggers a full resync.
    pub fn handle_watch_change(&mut self, change: WatchChange) {
        if self.coordinator.state() != StreamState::Open {
            debug!(
                type_code = change.type_code(),
                "watch change for a closed stream dropped"
            );
            return;
        }
        match self.coordinator.handle_change(change) {
            Ok(None) => {}
            Ok(Some(WatchEvent::Snapshot(event))) => {
                if let Err(err) = self.apply_remote_event(event) {
                    warn!(error = %err, "remote event could not be applied");
                    self.resync();
                }
            }
            Ok(Some(WatchEvent::TargetsRejected(rejected))) => self.reject_targets(rejected),
            Err(err) => {
                warn!(error = %err, "watch stream desynchronized");
                self.resync();
            }
        }
        self.prune_views();
    }

    /// Applies a snapshot-atomic remote event to every affected view.
    ///
    /// Applying the same event twice changes nothing the second time.
    pub fn apply_remote_event(&mut self, event: RemoteEvent) -> SyncResult<()> {
        let targets = event.affected_targets();
        for &target_id in &targets {
            if !self.views.contains_key(&target_id) && self.coordinator.targets().is_active(target_id) {
                return Err(SyncError::Internal(format!(
                    "remote event for {target_id} without a view"
                )));
            }
        }

        for &target_id in &targets {
            let Some(view) = self.views.get_mut(&target_id) else {
                continue;
            };
            let reset = event.target_resets.contains(&target_id);
            let server = view.cache.server_cache();
            let mut documents = if reset {
                DocumentMap::new()
            } else {
                server.documents().clone()
            };

            let change = event.target_changes.get(&target_id);
            if let Some(change) = change {
                for key in &change.removed_documents {
                    documents.remove(key);
                }
                for key in &change.added_documents {
                    let Some(doc) = event.document_updates.get(key) else {
                        continue;
                    };
                    match documents.get(key) {
                        Some(existing) if existing.version > doc.version => {
                            trace!(%key, "older document version ignored");
                        }
                        _ => {
                            documents.insert(key.clone(), doc.clone());
                        }
                    }
                }
            }

            let current = change.map(|change| change.current).unwrap_or(false);
            let complete = current || (!reset && server.is_fully_initialized());
            view.cache = view
                .cache
                .update_server_snap(documents, complete, view.target.is_filtered());
        }

        self.last_snapshot_version = self.last_snapshot_version.max(event.snapshot_version);
        let released = self.queue.release_acknowledged(event.snapshot_version);
        if !released.is_empty() {
            debug!(
                batches = released.len(),
                version = %event.snapshot_version,
                "acknowledged writes caught up"
            );
        }

        let mut affected = targets;
        affected.extend(self.targets_touched_by(&released));
        for target_id in affected {
            self.recompute(target_id);
            self.persist_view(target_id);
        }
        self.stats.snapshots_applied += 1;
        Ok(())
    }

    /// Handles a write commit.
    pub fn handle_write_ack(&mut self, batch_id: BatchId, commit_version: Version) {
        let Some(batch) = self.queue.acknowledge(batch_id, commit_version).cloned() else {
            warn!(%batch_id, "ack for unknown batch ignored");
            return;
        };
        debug!(%batch_id, version = %commit_version, "mutation acknowledged");
        self.stats.mutations_acknowledged += 1;
        self.record_outcome(batch_id, MutationOutcome::Acknowledged(commit_version));
        if let Some(callback) = self.write_callbacks.remove(&batch_id) {
            if callback.send(Ok(commit_version)).is_err() {
                trace!(%batch_id, "mutation handle dropped");
            }
        }

        let mut batches = self.queue.release_acknowledged(self.last_snapshot_version);
        batches.push(batch);
        self.refresh_batches(&batches);
    }

    /// Handles a write rejection. Only the submitter of the batch sees the
    /// error; views are recomputed without the batch.
    pub fn handle_write_reject(&mut self, batch_id: BatchId, status: Status) {
        let Some(batch) = self.queue.reject(batch_id) else {
            warn!(%batch_id, "rejection for unknown batch ignored");
            return;
        };
        warn!(%batch_id, %status, "mutation rejected");
        self.stats.mutations_rejected += 1;
        self.record_outcome(batch_id, MutationOutcome::Rejected(status.clone()));
        if let Some(callback) = self.write_callbacks.remove(&batch_id) {
            if callback
                .send(Err(SyncError::MutationRejected { batch_id, status }))
                .is_err()
            {
                trace!(%batch_id, "mutation handle dropped");
            }
        }
        self.refresh_batches(std::slice::from_ref(&batch));
    }

    /// Handles the stream closing and returns the delay before
    /// reconnecting.
    pub fn handle_stream_close(&mut self, error: Option<StreamError>, now: Instant) -> Duration {
        let outcome = self.coordinator.on_close(error.as_ref(), now);
        self.queue.mark_all_unsent();
        self.stats.stream_restarts += 1;
        self.reject_targets(outcome.rejected);
        self.dispatch_all();
        self.prune_views();
        outcome.reconnect_delay
    }

    /// Closes the stream without counting a failure.
    pub fn disconnect(&mut self) {
        if !self.coordinator.state().is_started() {
            return;
        }
        self.coordinator.on_disconnect();
        self.queue.mark_all_unsent();
        self.dispatch_all();
        self.prune_views();
    }

    /// Disables the network: closes the stream and keeps it closed until
    /// [`SyncEngine::resume`].
    pub fn interrupt(&mut self) {
        if !self.enabled {
            return;
        }
        info!("network disabled");
        self.enabled = false;
        self.disconnect();
    }

    /// Re-enables the network.
    pub fn resume(&mut self) {
        if self.enabled {
            return;
        }
        info!("network enabled");
        self.enabled = true;
    }

    /// Drops all resume tokens and requests a new stream on which every
    /// listened target is re-created from scratch.
    pub fn resync(&mut self) {
        warn!(targets = self.views.len(), "full resync");
        self.coordinator.restart();
        self.queue.mark_all_unsent();
        self.restart_requested = true;
        self.stats.resyncs += 1;
        self.dispatch_all();
        self.prune_views();
    }

    /// Drains the requests to write: watch requests first, then writes up
    /// to the in-flight limit. Empty unless the stream is open.
    pub fn take_outbound(&mut self) -> Vec<StreamRequest> {
        if self.coordinator.state() != StreamState::Open {
            return Vec::new();
        }
        let mut requests: Vec<StreamRequest> = self
            .coordinator
            .take_outbound()
            .into_iter()
            .map(StreamRequest::Watch)
            .collect();
        requests.extend(
            self.queue
                .take_unsent(self.config.max_writes_in_flight)
                .into_iter()
                .map(StreamRequest::Write),
        );
        requests
    }

    fn load_server_cache(&self, target: &Target) -> CacheNode {
        match self.persistence.load_cached_view(target) {
            Ok(Some(view)) => {
                debug!(target = %target.canonical_id(), "view seeded from cache");
                view.server_cache().clone()
            }
            Ok(None) => CacheNode::empty(),
            Err(err) => {
                warn!(error = %err, "failed to load cached view");
                CacheNode::empty()
            }
        }
    }

    fn persist_view(&self, target_id: TargetId) {
        if !self.config.persist_views {
            return;
        }
        if let Some(view) = self.views.get(&target_id) {
            if !view.cache.server_cache().is_fully_initialized() {
                trace!(%target_id, "server cache incomplete, keeping persisted view");
                return;
            }
            if let Err(err) = self.persistence.persist_view(&view.target, &view.cache) {
                warn!(%target_id, error = %err, "failed to persist view");
            }
        }
    }

    fn record_outcome(&self, batch_id: BatchId, outcome: MutationOutcome) {
        if let Err(err) = self.persistence.persist_mutation_result(batch_id, &outcome) {
            warn!(%batch_id, error = %err, "failed to persist mutation result");
        }
    }

    fn targets_touched_by(&self, batches: &[MutationBatch]) -> BTreeSet<TargetId> {
        self.views
            .iter()
            .filter(|(_, view)| {
                batches
                    .iter()
                    .flat_map(MutationBatch::keys)
                    .any(|key| view.target.covers(key))
            })
            .map(|(target_id, _)| *target_id)
            .collect()
    }

    fn refresh_batches(&mut self, batches: &[MutationBatch]) {
        for target_id in self.targets_touched_by(batches) {
            self.recompute(target_id);
        }
    }

    /// Rebuilds the event cache of a view and notifies its listeners.
    fn recompute(&mut self, target_id: TargetId) {
        let Some(view) = self.views.get(&target_id) else {
            return;
        };
        let event_cache = self.overlay(&view.target, view.cache.server_cache());
        if let Some(view) = self.views.get_mut(&target_id) {
            view.cache = view.cache.with_event_cache(event_cache);
        }
        self.dispatch(target_id);
    }

    fn overlay(&self, target: &Target, server: &CacheNode) -> CacheNode {
        let keys: Vec<_> = self
            .queue
            .keys()
            .into_iter()
            .filter(|key| target.covers(key))
            .collect();
        if keys.is_empty() {
            return server.with_flags(server.is_fully_initialized(), target.is_filtered());
        }

        let mut documents = server.documents().clone();
        let mut client_complete = false;
        for key in keys {
            let overwritten = self.queue.overwrites(&key);
            if target.is_document() && overwritten {
                client_complete = true;
            }
            let base = server.get(&key);
            if base.is_none() && !overwritten && !server.is_complete_for_key(&key) {
                trace!(%key, "patch of a document the view does not know skipped");
                continue;
            }
            match self.queue.overlay(&key, base) {
                Some(doc) => {
                    documents.insert(key, doc);
                }
                None => {
                    documents.remove(&key);
                }
            }
        }
        CacheNode::new(
            documents,
            server.is_fully_initialized() || client_complete,
            target.is_filtered(),
        )
    }

    fn dispatch(&mut self, target_id: TargetId) {
        let Some(view) = self.views.get(&target_id) else {
            return;
        };
        let has_pending_writes =
            effective_documents(view.cache.event_cache(), &view.target, &self.evaluator)
                .values()
                .any(|doc| doc.has_local_mutations);
        let from_cache = has_pending_writes || !self.coordinator.targets().is_current(target_id);
        let flags = (from_cache, has_pending_writes);

        for listener_id in &view.listeners {
            let Some(listener) = self.listeners.get_mut(listener_id) else {
                continue;
            };
            let seen = listener.last_seen.event_cache();
            let event = view.cache.event_cache();
            if seen.shares_documents_with(event)
                && seen.is_fully_initialized() == event.is_fully_initialized()
                && listener.last_flags == Some(flags)
            {
                continue;
            }
            let Some(changes) =
                compute_changes(&listener.last_seen, &view.cache, &view.target, &self.evaluator)
            else {
                trace!(%listener_id, %target_id, "view not initialized, nothing emitted");
                continue;
            };
            if changes.is_empty() && listener.last_flags == Some(flags) {
                continue;
            }

            let snapshot = ViewSnapshot {
                target: view.target.clone(),
                documents: sorted_documents(&view.cache, &view.target, &self.evaluator),
                changes,
                from_cache,
                has_pending_writes,
            };
            listener.last_seen = view.cache.clone();
            listener.last_flags = Some(flags);
            trace!(
                %listener_id,
                changes = snapshot.changes.len(),
                from_cache,
                "snapshot emitted"
            );
            if listener.sender.send(Ok(snapshot)).is_ok() {
                self.stats.events_emitted += 1;
            } else {
                trace!(%listener_id, "listener receiver dropped");
            }
        }
    }

    fn dispatch_all(&mut self) {
        let target_ids: Vec<TargetId> = self.views.keys().copied().collect();
        for target_id in target_ids {
            self.dispatch(target_id);
        }
    }

    fn reject_targets(&mut self, rejected: Vec<(TargetId, SyncError)>) {
        for (target_id, err) in rejected {
            self.stats.targets_rejected += 1;
            let Some(view) = self.views.remove(&target_id) else {
                continue;
            };
            warn!(%target_id, error = %err, listeners = view.listeners.len(), "target rejected");
            for listener_id in view.listeners {
                if let Some(listener) = self.listeners.remove(&listener_id) {
                    if listener.sender.send(Err(err.clone())).is_err() {
                        trace!(%listener_id, "listener receiver dropped");
                    }
                }
            }
        }
    }

    /// Drops views that nobody listens to once their target is gone.
    fn prune_views(&mut self) {
        let targets = self.coordinator.targets();
        self.views
            .retain(|target_id, view| !view.listeners.is_empty() || targets.contains(*target_id));
    }
}

impl<P: Persistence, E: QueryEvaluator> fmt::Debug for SyncEngine<P, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("stream", &self.coordinator.state())
            .field("views", &self.views.len())
            .field("listeners", &self.listeners.len())
            .field("queued_batches", &self.queue.len())
            .field("enabled", &self.enabled)
            .finish()
    }
}
