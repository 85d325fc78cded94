//! Scripted harness driving a `SyncEngine` without I/O.
//!
//! The harness plays the server: tests feed watch changes and write
//! decisions by hand and inspect what the engine wrote and what listeners
//! received.

use docsync_engine::{
    BackoffConfig, ChangeKind, FieldQueryEvaluator, ListenEvent, ListenerId, MemoryPersistence,
    MutationHandle, SyncConfig, SyncEngine, SyncError, TargetState, ViewSnapshot,
};
use docsync_protocol::{
    BatchId, Document, Mutation, ResumeToken, Status, StreamError, StreamRequest, Target,
    TargetId, Version, WatchChange, WatchRequest,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Engine type used by the harness.
pub type MemoryEngine = SyncEngine<Arc<MemoryPersistence>, FieldQueryEvaluator>;

/// A listener registered through the harness.
#[derive(Debug)]
pub struct TestListener {
    /// Listener handle.
    pub id: ListenerId,
    events: mpsc::UnboundedReceiver<ListenEvent>,
}

impl TestListener {
    /// Drains every delivered event.
    pub fn drain(&mut self) -> Vec<ListenEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drains delivered snapshots.
    ///
    /// # Panics
    ///
    /// Panics if an error was delivered.
    pub fn snapshots(&mut self) -> Vec<ViewSnapshot> {
        self.drain()
            .into_iter()
            .map(|event| event.expect("listener received an error"))
            .collect()
    }

    /// Drains delivered snapshots and returns the keys reported as added,
    /// in delivery order.
    pub fn added_keys(&mut self) -> Vec<String> {
        self.change_keys(ChangeKind::Added)
    }

    /// Drains delivered snapshots and returns the keys reported with
    /// `kind`, in delivery order.
    pub fn change_keys(&mut self, kind: ChangeKind) -> Vec<String> {
        self.snapshots()
            .into_iter()
            .flat_map(|snapshot| snapshot.changes)
            .filter(|change| change.kind == kind)
            .map(|change| change.document.key.path().to_string())
            .collect()
    }

    /// Drains delivered events and returns the terminal error, if any.
    pub fn error(&mut self) -> Option<SyncError> {
        self.drain().into_iter().find_map(Result::err)
    }
}

/// A sync engine with a hand-driven server side.
pub struct TestEngine {
    /// The engine under test.
    pub engine: MemoryEngine,
    /// Storage shared with the engine.
    pub persistence: Arc<MemoryPersistence>,
    sent: Vec<StreamRequest>,
}

impl TestEngine {
    /// Creates an engine with a closed stream and immediate reconnects.
    pub fn new() -> Self {
        Self::with_persistence(default_config(), Arc::new(MemoryPersistence::new()))
    }

    /// Creates an engine whose stream is already open.
    pub fn connected() -> Self {
        let mut harness = Self::new();
        harness.open_stream();
        harness
    }

    /// Creates an engine over existing storage.
    ///
    /// # Panics
    ///
    /// Panics if the storage cannot be read.
    pub fn with_persistence(config: SyncConfig, persistence: Arc<MemoryPersistence>) -> Self {
        let engine = SyncEngine::new(config, Arc::clone(&persistence), FieldQueryEvaluator)
            .expect("failed to create engine");
        Self {
            engine,
            persistence,
            sent: Vec::new(),
        }
    }

    /// Connects and completes the stream handshake.
    pub fn open_stream(&mut self) {
        self.engine.begin_connect();
        self.engine.handle_stream_open(Instant::now());
        self.flush();
    }

    /// Closes the stream and returns the reconnect delay.
    pub fn close_stream(&mut self, error: Option<StreamError>) -> Duration {
        let delay = self.engine.handle_stream_close(error, Instant::now());
        self.flush();
        delay
    }

    /// Registers a listener.
    pub fn listen(&mut self, target: Target) -> TestListener {
        let (id, events) = self.engine.listen(target);
        self.flush();
        TestListener { id, events }
    }

    /// Removes a listener.
    ///
    /// # Panics
    ///
    /// Panics if the listener is unknown.
    pub fn unlisten(&mut self, listener: &TestListener) {
        self.engine
            .unlisten(listener.id)
            .expect("unknown listener");
        self.flush();
    }

    /// Submits a batch of writes.
    ///
    /// # Panics
    ///
    /// Panics if the batch cannot be stored.
    pub fn submit(&mut self, mutations: Vec<Mutation>) -> MutationHandle {
        let handle = self
            .engine
            .submit_mutation(mutations)
            .expect("failed to submit mutation");
        self.flush();
        handle
    }

    /// Collects what the engine wants to write.
    pub fn flush(&mut self) {
        let requests = self.engine.take_outbound();
        self.sent.extend(requests);
    }

    /// Drains the requests written since the last call.
    pub fn take_sent(&mut self) -> Vec<StreamRequest> {
        std::mem::take(&mut self.sent)
    }

    /// Drains written requests and returns the target id of the last add.
    ///
    /// # Panics
    ///
    /// Panics if no add was written.
    pub fn last_added_target(&mut self) -> TargetId {
        self.take_sent()
            .into_iter()
            .rev()
            .find_map(|request| match request {
                StreamRequest::Watch(WatchRequest::AddTarget { target_id, .. }) => Some(target_id),
                _ => None,
            })
            .expect("no add target written")
    }

    /// Returns the state of a target.
    pub fn target_state(&self, target_id: TargetId) -> Option<&TargetState> {
        self.engine.coordinator().targets().state(target_id)
    }

    /// Delivers a watch change.
    pub fn watch(&mut self, change: WatchChange) {
        self.engine.handle_watch_change(change);
        self.flush();
    }

    /// Acknowledges an add.
    pub fn ack_add(&mut self, target_id: TargetId) {
        self.watch(WatchChange::TargetAdded {
            target_ids: vec![target_id],
        });
    }

    /// Acknowledges a remove.
    pub fn ack_remove(&mut self, target_id: TargetId) {
        self.watch(WatchChange::TargetRemoved {
            target_ids: vec![target_id],
            cause: None,
        });
    }

    /// Rejects a target.
    pub fn reject_target(&mut self, target_id: TargetId, status: Status) {
        self.watch(WatchChange::TargetRemoved {
            target_ids: vec![target_id],
            cause: Some(status),
        });
    }

    /// Sends a document tagged for targets.
    pub fn document(&mut self, document: Document, target_ids: Vec<TargetId>) {
        self.watch(WatchChange::document(document, target_ids));
    }

    /// Marks a target current.
    pub fn current(&mut self, target_id: TargetId, resume_token: &'static str) {
        self.watch(WatchChange::Current {
            target_id,
            resume_token: ResumeToken::from(resume_token),
        });
    }

    /// Closes a snapshot.
    pub fn snapshot(&mut self, version: u64) {
        self.watch(WatchChange::Snapshot {
            version: Version(version),
        });
    }

    /// Acknowledges an add, then delivers documents, a current marker and a
    /// snapshot boundary.
    pub fn server_current(&mut self, target_id: TargetId, documents: Vec<Document>, version: u64) {
        self.ack_add(target_id);
        for document in documents {
            self.document(document, vec![target_id]);
        }
        self.current(target_id, "resume");
        self.snapshot(version);
    }

    /// Acknowledges a write.
    pub fn ack_write(&mut self, batch_id: BatchId, version: u64) {
        self.engine.handle_write_ack(batch_id, Version(version));
        self.flush();
    }

    /// Rejects a write.
    pub fn reject_write(&mut self, batch_id: BatchId, status: Status) {
        self.engine.handle_write_reject(batch_id, status);
        self.flush();
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration used by the harness: immediate reconnects.
pub fn default_config() -> SyncConfig {
    SyncConfig::new().with_backoff(BackoffConfig::immediate())
}

/// Counts add and remove requests for a target among written requests.
pub fn count_requests(requests: &[StreamRequest], target_id: TargetId) -> (usize, usize) {
    requests
        .iter()
        .fold((0, 0), |(adds, removes), request| match request {
            StreamRequest::Watch(WatchRequest::AddTarget { target_id: id, .. }) if *id == target_id => {
                (adds + 1, removes)
            }
            StreamRequest::Watch(WatchRequest::RemoveTarget { target_id: id }) if *id == target_id => {
                (adds, removes + 1)
            }
            _ => (adds, removes),
        })
}
