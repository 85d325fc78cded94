//! Watch stream coordinator.
//!
//! Drives the single multiplexed watch stream through
//! `Closed → Connecting → Open → Closed` and turns inbound watch changes
//! into snapshot-atomic [`RemoteEvent`]s. Document changes and current
//! markers are buffered until the next snapshot boundary so that no
//! listener ever observes a partially applied snapshot.

use crate::backoff::ExponentialBackoff;
use crate::config::BackoffConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote_event::RemoteEvent;
use crate::target_manager::{AddOutcome, RemoveOutcome, TargetManager};
use docsync_protocol::{Document, StreamError, TargetId, Version, WatchChange, WatchRequest};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Connection state of the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No stream.
    Closed,
    /// A stream was requested and has not finished its handshake.
    Connecting,
    /// The stream accepts requests.
    Open,
}

impl StreamState {
    /// Returns true if a stream exists or is being established.
    pub fn is_started(&self) -> bool {
        matches!(self, StreamState::Connecting | StreamState::Open)
    }
}

/// Output of a watch change that the sync engine must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A snapshot boundary was reached.
    Snapshot(RemoteEvent),
    /// Targets were rejected by the server and torn down.
    TargetsRejected(Vec<(TargetId, SyncError)>),
}

/// Result of the stream closing.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOutcome {
    /// Delay before the next connection attempt.
    pub reconnect_delay: Duration,
    /// Targets that failed permanently with this close.
    pub rejected: Vec<(TargetId, SyncError)>,
}

/// State machine of the watch stream.
#[derive(Debug)]
pub struct WatchStreamCoordinator {
    state: StreamState,
    targets: TargetManager,
    backoff: ExponentialBackoff,
    pending: RemoteEvent,
}

impl WatchStreamCoordinator {
    /// Creates a coordinator with a closed stream.
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: StreamState::Closed,
            targets: TargetManager::new(),
            backoff: ExponentialBackoff::new(backoff),
            pending: RemoteEvent::default(),
        }
    }

    /// Current stream state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The target manager.
    pub fn targets(&self) -> &TargetManager {
        &self.targets
    }

    /// The target manager, mutably.
    pub fn targets_mut(&mut self) -> &mut TargetManager {
        &mut self.targets
    }

    /// The backoff state.
    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    /// Moves `Closed → Connecting`. Returns false if a stream is already
    /// started.
    pub fn begin_connect(&mut self) -> bool {
        if self.state.is_started() {
            return false;
        }
        debug!(attempt = self.backoff.attempt(), "connecting watch stream");
        self.state = StreamState::Connecting;
        true
    }

    /// Moves `Connecting → Open` and queues adds for every listened target.
    pub fn on_open(&mut self, now: Instant) {
        if self.state == StreamState::Open {
            return;
        }
        info!("watch stream open");
        self.state = StreamState::Open;
        self.pending = RemoteEvent::default();
        self.backoff.record_open(now);
        self.targets.on_stream_open();
    }

    /// Moves to `Closed` after the stream ended.
    ///
    /// Transient failures (and clean finishes) only schedule a reconnect.
    /// Permanent failures attributed to a target reject that target; an
    /// unattributed permanent failure rejects every listened target.
    pub fn on_close(&mut self, error: Option<&StreamError>, now: Instant) -> CloseOutcome {
        let mut rejected = Vec::new();
        if let Some(err) = error.filter(|err| err.is_permanent()) {
            let victims: Vec<TargetId> = match err.target_id {
                Some(target_id) => vec![target_id],
                None => self.listening_target_ids(),
            };
            for target_id in victims {
                if self.targets.reject(target_id) {
                    rejected.push((
                        target_id,
                        SyncError::target_rejected(target_id, err.status.clone()),
                    ));
                }
            }
        }

        self.state = StreamState::Closed;
        self.pending = RemoteEvent::default();
        self.targets.on_stream_closed();
        let reconnect_delay = self.backoff.record_failure(now);

        match error {
            Some(err) => warn!(
                error = %err,
                rejected = rejected.len(),
                delay_ms = reconnect_delay.as_millis() as u64,
                "watch stream closed"
            ),
            None => info!(
                delay_ms = reconnect_delay.as_millis() as u64,
                "watch stream finished"
            ),
        }

        CloseOutcome {
            reconnect_delay,
            rejected,
        }
    }

    /// Closes the stream without counting a failure, for example when the
    /// network is disabled or nothing is left to watch.
    pub fn on_disconnect(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        info!("watch stream shut down");
        self.state = StreamState::Closed;
        self.pending = RemoteEvent::default();
        self.targets.on_stream_closed();
        self.backoff.reset();
    }

    /// Drops every resume token and closes the stream so all targets are
    /// re-created from scratch on the next connection.
    pub fn restart(&mut self) {
        warn!("restarting watch stream for full resync");
        self.targets.clear_resume_tokens();
        self.state = StreamState::Closed;
        self.pending = RemoteEvent::default();
        self.targets.on_stream_closed();
        self.backoff.reset();
    }

    /// Drains the watch requests to write; empty unless the stream is open.
    pub fn take_outbound(&mut self) -> Vec<WatchRequest> {
        if self.state != StreamState::Open {
            return Vec::new();
        }
        self.targets.take_outbound()
    }

    /// Processes one inbound watch change.
    ///
    /// Errors signal a protocol desynchronization that cannot be repaired in
    /// place.
    pub fn handle_change(&mut self, change: WatchChange) -> SyncResult<Option<WatchEvent>> {
        if self.state != StreamState::Open {
            return Err(SyncError::Internal(format!(
                "watch change of type {} on a {:?} stream",
                change.type_code(),
                self.state
            )));
        }

        match change {
            WatchChange::TargetAdded { target_ids } => {
                for target_id in target_ids {
                    match self.targets.on_target_added(target_id)? {
                        AddOutcome::Activated { reset } => {
                            self.pending.target_changes.remove(&target_id);
                            if reset {
                                self.pending.target_resets.insert(target_id);
                            }
                        }
                        AddOutcome::Superseded => self.discard_pending(target_id),
                    }
                }
                Ok(None)
            }
            WatchChange::TargetRemoved { target_ids, cause } => {
                let mut rejected = Vec::new();
                for target_id in target_ids {
                    let outcome = self.targets.on_target_removed(target_id, cause.clone())?;
                    self.discard_pending(target_id);
                    if let RemoveOutcome::Rejected(status) = outcome {
                        rejected.push((target_id, SyncError::target_rejected(target_id, status)));
                    }
                }
                Ok((!rejected.is_empty()).then_some(WatchEvent::TargetsRejected(rejected)))
            }
            WatchChange::DocumentChanged {
                document,
                updated_target_ids,
                removed_target_ids,
            } => {
                self.buffer_document(document, &updated_target_ids, &removed_target_ids);
                Ok(None)
            }
            WatchChange::Current {
                target_id,
                resume_token,
            } => {
                if !self.targets.contains(target_id) {
                    return Err(SyncError::UnknownTarget(target_id));
                }
                if self.targets.is_active(target_id) {
                    trace!(%target_id, "current buffered");
                    self.pending.mark_current(target_id, Some(resume_token));
                } else {
                    trace!(%target_id, "current for inactive target ignored");
                }
                Ok(None)
            }
            WatchChange::Snapshot { version } => Ok(Some(WatchEvent::Snapshot(self.flush(version)))),
        }
    }

    fn buffer_document(&mut self, document: Document, updated: &[TargetId], removed: &[TargetId]) {
        let exists = document.exists();
        for &target_id in updated {
            if !self.targets.is_active(target_id) {
                if !self.targets.contains(target_id) {
                    warn!(%target_id, key = %document.key, "document for unknown target ignored");
                }
                continue;
            }
            if exists {
                self.pending.add_document(target_id, document.clone());
            } else {
                self.pending.remove_document(target_id, document.key.clone());
                self.pending
                    .document_updates
                    .insert(document.key.clone(), document.clone());
            }
        }
        for &target_id in removed {
            if self.targets.is_active(target_id) {
                self.pending.remove_document(target_id, document.key.clone());
            }
        }
    }

    fn discard_pending(&mut self, target_id: TargetId) {
        self.pending.target_changes.remove(&target_id);
        self.pending.target_resets.remove(&target_id);
    }

    fn flush(&mut self, version: Version) -> RemoteEvent {
        let mut event = std::mem::take(&mut self.pending);
        event.snapshot_version = version;

        let targets = &self.targets;
        event
            .target_changes
            .retain(|target_id, _| targets.is_active(*target_id));
        event
            .target_resets
            .retain(|target_id| targets.is_active(*target_id));

        for (target_id, change) in &event.target_changes {
            if change.current {
                self.targets
                    .mark_current(*target_id, change.resume_token.clone(), version);
            }
        }
        debug!(
            %version,
            targets = event.target_changes.len(),
            documents = event.document_updates.len(),
            "snapshot flushed"
        );
        event
    }

    fn listening_target_ids(&self) -> Vec<TargetId> {
        self.targets.listening_ids().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{DocumentKey, Fields, Query, Status, StatusCode, Target};

    fn coordinator() -> WatchStreamCoordinator {
        let mut coordinator = WatchStreamCoordinator::new(BackoffConfig::immediate());
        assert!(coordinator.begin_connect());
        coordinator.on_open(Instant::now());
        coordinator
    }

    fn doc(key: &str, version: u64) -> Document {
        Document::new(key, Version(version), Fields::new())
    }

    fn listen(coordinator: &mut WatchStreamCoordinator) -> TargetId {
        coordinator
            .targets_mut()
            .listen(Target::from(Query::collection("c")))
    }

    fn snapshot(coordinator: &mut WatchStreamCoordinator, version: u64) -> RemoteEvent {
        match coordinator
            .handle_change(WatchChange::Snapshot {
                version: Version(version),
            })
            .unwrap()
        {
            Some(WatchEvent::Snapshot(event)) => event,
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn state_transitions() {
        let mut coordinator = WatchStreamCoordinator::new(BackoffConfig::immediate());
        assert_eq!(coordinator.state(), StreamState::Closed);
        assert!(coordinator.begin_connect());
        assert!(!coordinator.begin_connect());
        assert_eq!(coordinator.state(), StreamState::Connecting);
        coordinator.on_open(Instant::now());
        assert_eq!(coordinator.state(), StreamState::Open);
        coordinator.on_close(None, Instant::now());
        assert_eq!(coordinator.state(), StreamState::Closed);
    }

    #[test]
    fn changes_are_held_until_snapshot() {
        let mut coordinator = coordinator();
        let id = listen(&mut coordinator);
        assert_eq!(coordinator.take_outbound().len(), 1);

        coordinator
            .handle_change(WatchChange::TargetAdded {
                target_ids: vec![id],
            })
            .unwrap();
        let none = coordinator
            .handle_change(WatchChange::document(doc("c/a", 1), vec![id]))
            .unwrap();
        assert!(none.is_none());
        coordinator
            .handle_change(WatchChange::Current {
                target_id: id,
                resume_token: "token".into(),
            })
            .unwrap();
        assert!(!coordinator.targets().is_current(id));

        let event = snapshot(&mut coordinator, 1);
        assert!(event.target_resets.contains(&id));
        let change = &event.target_changes[&id];
        assert!(change.current);
        assert_eq!(change.added_documents.len(), 1);
        assert!(coordinator.targets().is_current(id));
    }

    #[test]
    fn documents_for_pending_targets_are_dropped() {
        let mut coordinator = coordinator();
        let id = listen(&mut coordinator);

        coordinator
            .handle_change(WatchChange::document(doc("c/a", 1), vec![id]))
            .unwrap();
        coordinator
            .handle_change(WatchChange::Current {
                target_id: id,
                resume_token: "token".into(),
            })
            .unwrap();
        let event = snapshot(&mut coordinator, 1);
        assert!(event.is_empty());
        assert!(!coordinator.targets().is_current(id));
    }

    #[test]
    fn deleted_document_leaves_target() {
        let mut coordinator = coordinator();
        let id = listen(&mut coordinator);
        coordinator
            .handle_change(WatchChange::TargetAdded {
                target_ids: vec![id],
            })
            .unwrap();
        coordinator
            .handle_change(WatchChange::document(
                Document::missing("c/a", Version(3)),
                vec![id],
            ))
            .unwrap();
        let event = snapshot(&mut coordinator, 3);
        let change = &event.target_changes[&id];
        let key = DocumentKey::new("c/a");
        assert!(change.removed_documents.contains(&key));
        assert!(!event.document_updates[&key].exists());
    }

    #[test]
    fn rejection_is_reported() {
        let mut coordinator = coordinator();
        let id = listen(&mut coordinator);
        let event = coordinator
            .handle_change(WatchChange::TargetRemoved {
                target_ids: vec![id],
                cause: Some(Status::new(StatusCode::PermissionDenied, "denied")),
            })
            .unwrap();
        match event {
            Some(WatchEvent::TargetsRejected(rejected)) => {
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].0, id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn current_for_unknown_target_is_desync() {
        let mut coordinator = coordinator();
        let result = coordinator.handle_change(WatchChange::Current {
            target_id: TargetId(42),
            resume_token: "t".into(),
        });
        assert!(matches!(result, Err(SyncError::UnknownTarget(TargetId(42)))));
    }

    #[test]
    fn transient_close_keeps_targets() {
        let mut coordinator = coordinator();
        let id = listen(&mut coordinator);
        let outcome = coordinator.on_close(
            Some(&StreamError::new(StatusCode::Unavailable, "reset")),
            Instant::now(),
        );
        assert!(outcome.rejected.is_empty());
        assert!(coordinator.targets().contains(id));
        assert!(coordinator.take_outbound().is_empty());

        coordinator.begin_connect();
        coordinator.on_open(Instant::now());
        assert_eq!(coordinator.take_outbound().len(), 1);
    }

    #[test]
    fn permanent_close_for_target_rejects_it() {
        let mut coordinator = coordinator();
        let bad = listen(&mut coordinator);
        let good = coordinator
            .targets_mut()
            .listen(Target::from(Query::collection("other")));

        let err = StreamError::new(StatusCode::InvalidArgument, "bad query").for_target(bad);
        let outcome = coordinator.on_close(Some(&err), Instant::now());
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].0, bad);
        assert!(!coordinator.targets().contains(bad));
        assert!(coordinator.targets().contains(good));
    }

    #[test]
    fn unattributed_permanent_close_rejects_everything() {
        let mut coordinator = coordinator();
        listen(&mut coordinator);
        coordinator
            .targets_mut()
            .listen(Target::from(Query::collection("other")));

        let err = StreamError::new(StatusCode::PermissionDenied, "revoked");
        let outcome = coordinator.on_close(Some(&err), Instant::now());
        assert_eq!(outcome.rejected.len(), 2);
        assert!(coordinator.targets().is_empty());
    }

    #[test]
    fn disconnect_resets_backoff() {
        let mut coordinator = coordinator();
        let id = listen(&mut coordinator);
        coordinator.on_close(
            Some(&StreamError::new(StatusCode::Unavailable, "reset")),
            Instant::now(),
        );
        assert_eq!(coordinator.backoff().attempt(), 1);

        coordinator.begin_connect();
        coordinator.on_open(Instant::now());
        coordinator.on_disconnect();
        assert_eq!(coordinator.state(), StreamState::Closed);
        assert_eq!(coordinator.backoff().attempt(), 0);
        assert!(coordinator.targets().contains(id));
    }

    #[test]
    fn change_on_closed_stream_is_rejected() {
        let mut coordinator = WatchStreamCoordinator::new(BackoffConfig::immediate());
        assert!(coordinator
            .handle_change(WatchChange::Snapshot { version: Version(1) })
            .is_err());
    }
}
