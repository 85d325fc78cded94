//! Lifecycle of listen targets on the watch stream.
//!
//! The target manager is the single source of truth for what the server
//! should currently believe the client is listening to. Listen/unlisten
//! churn can be faster than a round trip, so every target carries explicit
//! counters of add and remove requests written to the stream and not yet
//! acknowledged.
//!
//! ## Invariants
//!
//! - `pending_adds` counts add requests on the wire for the current stream;
//!   a target is active (its document changes are authoritative) only when
//!   it is listened to and `pending_adds == 0`.
//! - A relisten while a remove is in flight keeps the same target id and
//!   resets `pending_removes` to zero. The late remove ack always arrives
//!   before the new add's ack, so it is absorbed while `pending_adds > 0`.
//! - Closing the stream discards the server's bookkeeping: counters reset,
//!   `current` clears, resume tokens survive.

use crate::error::{SyncError, SyncResult};
use docsync_protocol::{ResumeToken, Status, Target, TargetId, Version, WatchRequest};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// Lifecycle record of one listen target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetState {
    /// Target ID.
    pub target_id: TargetId,
    /// What is watched.
    pub target: Target,
    /// Latest resume token received for the target.
    pub resume_token: Option<ResumeToken>,
    /// Snapshot version at which the target was last current.
    pub snapshot_version: Version,
    /// Add requests written to the stream and not yet acknowledged.
    pub pending_adds: u32,
    /// Remove requests written to the stream and not yet acknowledged.
    pub pending_removes: u32,
    /// True once the server marked the target current at a snapshot
    /// boundary following the last add ack.
    pub current: bool,
    /// True while the application wants the target watched.
    pub listening: bool,
}

impl TargetState {
    fn new(target_id: TargetId, target: Target) -> Self {
        Self {
            target_id,
            target,
            resume_token: None,
            snapshot_version: Version::MIN,
            pending_adds: 0,
            pending_removes: 0,
            current: false,
            listening: true,
        }
    }

    /// Returns true if document changes for this target are authoritative.
    pub fn is_active(&self) -> bool {
        self.listening && self.pending_adds == 0
    }

    fn add_request(&self) -> WatchRequest {
        WatchRequest::AddTarget {
            target_id: self.target_id,
            target: self.target.clone(),
            resume_token: self.resume_token.clone(),
        }
    }
}

/// Result of processing a target-added ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The last outstanding add was acknowledged; the target is active.
    ///
    /// `reset` is true when the add carried no resume token, so the server
    /// replays the full result set.
    Activated {
        /// Whether previously known server documents must be discarded.
        reset: bool,
    },
    /// A superseded add was acknowledged; the target stays inactive.
    Superseded,
}

/// Result of processing a target-removed message.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome {
    /// A remove request was acknowledged; the target is still tracked.
    Acknowledged,
    /// The target state was destroyed.
    Released,
    /// A remove ack for a superseded cycle was absorbed.
    StaleIgnored,
    /// The server dropped an active target without a cause; an add was
    /// queued to restore it.
    Readded,
    /// The server rejected the target; its state was torn down.
    Rejected(Status),
}

/// Tracks every listen target and the requests owed to the server.
#[derive(Debug)]
pub struct TargetManager {
    states: BTreeMap<TargetId, TargetState>,
    by_canonical_id: HashMap<String, TargetId>,
    next_target_id: u32,
    stream_open: bool,
    outbox: VecDeque<WatchRequest>,
}

impl TargetManager {
    /// Creates an empty target manager.
    pub fn new() -> Self {
        Self {
            states: BTreeMap::new(),
            by_canonical_id: HashMap::new(),
            next_target_id: 1,
            stream_open: false,
            outbox: VecDeque::new(),
        }
    }

    /// Starts watching a target and returns its id.
    ///
    /// Listening to a target that is still tracked (for example while its
    /// remove is in flight) reuses the existing id.
    pub fn listen(&mut self, target: Target) -> TargetId {
        let canonical_id = target.canonical_id();
        if let Some(&target_id) = self.by_canonical_id.get(&canonical_id) {
            if let Some(state) = self.states.get_mut(&target_id) {
                if state.listening {
                    return target_id;
                }
                debug!(
                    %target_id,
                    pending_removes = state.pending_removes,
                    "relisten cancels pending remove"
                );
                state.listening = true;
                state.current = false;
                state.pending_removes = 0;
                if self.stream_open {
                    state.pending_adds += 1;
                    self.outbox.push_back(state.add_request());
                }
                return target_id;
            }
        }

        let target_id = TargetId(self.next_target_id);
        self.next_target_id += 1;
        let mut state = TargetState::new(target_id, target);
        if self.stream_open {
            state.pending_adds = 1;
            self.outbox.push_back(state.add_request());
        }
        debug!(%target_id, canonical_id = %canonical_id, "listen");
        self.by_canonical_id.insert(canonical_id, target_id);
        self.states.insert(target_id, state);
        target_id
    }

    /// Stops watching a target.
    ///
    /// With the stream closed nothing reached the server, so the state is
    /// dropped locally. Otherwise a remove is written and the state lives on
    /// until the server acknowledges it.
    pub fn unlisten(&mut self, target_id: TargetId) {
        let Some(state) = self.states.get_mut(&target_id) else {
            return;
        };
        if !state.listening {
            return;
        }
        state.listening = false;
        state.current = false;

        if !self.stream_open {
            debug!(%target_id, "unlisten while offline, dropping target");
            self.release(target_id);
            return;
        }

        state.pending_removes += 1;
        debug!(
            %target_id,
            pending_adds = state.pending_adds,
            pending_removes = state.pending_removes,
            "unlisten"
        );
        self.outbox
            .push_back(WatchRequest::RemoveTarget { target_id });
    }

    /// Processes a target-added ack.
    pub fn on_target_added(&mut self, target_id: TargetId) -> SyncResult<AddOutcome> {
        let state = self
            .states
            .get_mut(&target_id)
            .ok_or(SyncError::UnknownTarget(target_id))?;
        if state.pending_adds == 0 {
            return Err(SyncError::Internal(format!(
                "{target_id} acknowledged with no add outstanding"
            )));
        }
        state.pending_adds -= 1;

        if state.pending_adds == 0 && state.listening {
            let reset = state.resume_token.is_none();
            debug!(%target_id, reset, "target active");
            Ok(AddOutcome::Activated { reset })
        } else {
            trace!(
                %target_id,
                pending_adds = state.pending_adds,
                "superseded add acknowledged"
            );
            Ok(AddOutcome::Superseded)
        }
    }

    /// Processes a target-removed message.
    pub fn on_target_removed(
        &mut self,
        target_id: TargetId,
        cause: Option<Status>,
    ) -> SyncResult<RemoveOutcome> {
        let state = self
            .states
            .get_mut(&target_id)
            .ok_or(SyncError::UnknownTarget(target_id))?;

        if let Some(status) = cause {
            let listening = state.listening;
            warn!(%target_id, %status, "target rejected by server");
            self.release(target_id);
            return Ok(if listening {
                RemoveOutcome::Rejected(status)
            } else {
                RemoveOutcome::Released
            });
        }

        if state.pending_removes > 0 {
            state.pending_removes -= 1;
        } else if state.pending_adds > 0 {
            trace!(%target_id, "stale remove ack absorbed");
            return Ok(RemoveOutcome::StaleIgnored);
        } else if state.listening {
            warn!(%target_id, "server dropped active target, re-adding");
            state.current = false;
            if self.stream_open {
                state.pending_adds = 1;
                let request = state.add_request();
                self.outbox.push_back(request);
            }
            return Ok(RemoveOutcome::Readded);
        }

        if !state.listening && state.pending_adds == 0 && state.pending_removes == 0 {
            debug!(%target_id, "target released");
            self.release(target_id);
            Ok(RemoveOutcome::Released)
        } else {
            Ok(RemoveOutcome::Acknowledged)
        }
    }

    /// Marks a target current at a snapshot boundary.
    pub fn mark_current(
        &mut self,
        target_id: TargetId,
        resume_token: Option<ResumeToken>,
        version: Version,
    ) {
        if let Some(state) = self.states.get_mut(&target_id) {
            if !state.is_active() {
                return;
            }
            state.current = true;
            state.snapshot_version = version;
            if resume_token.is_some() {
                state.resume_token = resume_token;
            }
        }
    }

    /// Tears down a target after a permanent failure attributed to it.
    ///
    /// Returns true if the application was still listening.
    pub fn reject(&mut self, target_id: TargetId) -> bool {
        let listening = self
            .states
            .get(&target_id)
            .map(|state| state.listening)
            .unwrap_or(false);
        self.release(target_id);
        listening
    }

    /// Records that the stream opened and queues an add for every target
    /// still listened to.
    pub fn on_stream_open(&mut self) {
        self.stream_open = true;
        self.outbox.clear();
        for state in self.states.values_mut() {
            state.pending_adds = 1;
            state.pending_removes = 0;
            state.current = false;
            self.outbox.push_back(state.add_request());
        }
        debug!(targets = self.states.len(), "stream open, targets queued");
    }

    /// Records that the stream closed.
    ///
    /// The server forgets in-flight requests, so counters reset to "needs
    /// resend" and targets nobody listens to any more are dropped.
    pub fn on_stream_closed(&mut self) {
        self.stream_open = false;
        self.outbox.clear();

        let released: Vec<TargetId> = self
            .states
            .values()
            .filter(|state| !state.listening)
            .map(|state| state.target_id)
            .collect();
        for target_id in released {
            self.release(target_id);
        }

        for state in self.states.values_mut() {
            state.pending_adds = 0;
            state.pending_removes = 0;
            state.current = false;
        }
    }

    /// Forgets every resume token so the next stream re-adds all targets
    /// from scratch.
    pub fn clear_resume_tokens(&mut self) {
        for state in self.states.values_mut() {
            state.resume_token = None;
            state.snapshot_version = Version::MIN;
        }
    }

    /// Drains the requests owed to the server, in order.
    pub fn take_outbound(&mut self) -> Vec<WatchRequest> {
        self.outbox.drain(..).collect()
    }

    /// Returns true if requests are waiting to be written.
    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Returns the state of a target.
    pub fn state(&self, target_id: TargetId) -> Option<&TargetState> {
        self.states.get(&target_id)
    }

    /// Returns the target id for a target, if tracked.
    pub fn target_id_for(&self, target: &Target) -> Option<TargetId> {
        self.by_canonical_id.get(&target.canonical_id()).copied()
    }

    /// Returns true if the target exists.
    pub fn contains(&self, target_id: TargetId) -> bool {
        self.states.contains_key(&target_id)
    }

    /// Returns true if document changes for the target are authoritative.
    pub fn is_active(&self, target_id: TargetId) -> bool {
        self.states
            .get(&target_id)
            .map(TargetState::is_active)
            .unwrap_or(false)
    }

    /// Returns true if the target is current with the server.
    pub fn is_current(&self, target_id: TargetId) -> bool {
        self.states
            .get(&target_id)
            .map(|state| state.current)
            .unwrap_or(false)
    }

    /// Returns the ids of targets the application listens to.
    pub fn listening_ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.states
            .values()
            .filter(|state| state.listening)
            .map(|state| state.target_id)
    }

    /// Returns true if the application listens to at least one target.
    pub fn has_listening_targets(&self) -> bool {
        self.states.values().any(|state| state.listening)
    }

    /// Returns true if the stream is open.
    pub fn is_stream_open(&self) -> bool {
        self.stream_open
    }

    /// Number of tracked targets.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no target is tracked.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn release(&mut self, target_id: TargetId) {
        if let Some(state) = self.states.remove(&target_id) {
            self.by_canonical_id.remove(&state.target.canonical_id());
        }
    }
}

impl Default for TargetManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{Query, StatusCode};

    fn target() -> Target {
        Target::from(Query::collection("collection"))
    }

    fn open_manager() -> TargetManager {
        let mut manager = TargetManager::new();
        manager.on_stream_open();
        manager
    }

    fn kinds(requests: &[WatchRequest]) -> Vec<&'static str> {
        requests
            .iter()
            .map(|r| match r {
                WatchRequest::AddTarget { .. } => "add",
                WatchRequest::RemoveTarget { .. } => "remove",
            })
            .collect()
    }

    #[test]
    fn listen_queues_add() {
        let mut manager = open_manager();
        let id = manager.listen(target());

        assert_eq!(kinds(&manager.take_outbound()), vec!["add"]);
        assert_eq!(manager.state(id).unwrap().pending_adds, 1);
        assert!(!manager.is_active(id));

        assert_eq!(
            manager.on_target_added(id).unwrap(),
            AddOutcome::Activated { reset: true }
        );
        assert!(manager.is_active(id));
    }

    #[test]
    fn duplicate_listen_is_idempotent() {
        let mut manager = open_manager();
        let a = manager.listen(target());
        let b = manager.listen(target());
        assert_eq!(a, b);
        assert_eq!(manager.take_outbound().len(), 1);
    }

    #[test]
    fn relisten_keeps_id_and_resets_removes() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.on_target_added(id).unwrap();
        manager.unlisten(id);
        assert_eq!(manager.state(id).unwrap().pending_removes, 1);

        let again = manager.listen(target());
        assert_eq!(again, id);
        let state = manager.state(id).unwrap();
        assert_eq!(state.pending_removes, 0);
        assert_eq!(state.pending_adds, 1);
        assert_eq!(
            kinds(&manager.take_outbound()),
            vec!["add", "remove", "add"]
        );

        assert_eq!(
            manager.on_target_removed(id, None).unwrap(),
            RemoveOutcome::StaleIgnored
        );
        assert!(!manager.is_active(id));
        assert_eq!(
            manager.on_target_added(id).unwrap(),
            AddOutcome::Activated { reset: true }
        );
        assert!(manager.is_active(id));
    }

    #[test]
    fn superseded_adds_are_ignored() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.on_target_added(id).unwrap();
        for _ in 0..3 {
            manager.unlisten(id);
            manager.listen(target());
        }
        assert_eq!(manager.state(id).unwrap().pending_adds, 3);

        for _ in 0..2 {
            manager.on_target_removed(id, None).unwrap();
            assert_eq!(manager.on_target_added(id).unwrap(), AddOutcome::Superseded);
            assert!(!manager.is_active(id));
        }
        manager.on_target_removed(id, None).unwrap();
        assert!(matches!(
            manager.on_target_added(id).unwrap(),
            AddOutcome::Activated { .. }
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn remove_ack_releases_target() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.on_target_added(id).unwrap();
        manager.unlisten(id);

        assert_eq!(
            manager.on_target_removed(id, None).unwrap(),
            RemoveOutcome::Released
        );
        assert!(manager.is_empty());
        assert!(manager.target_id_for(&target()).is_none());
    }

    #[test]
    fn unlisten_before_ack_waits_for_both_acks() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.unlisten(id);
        assert_eq!(kinds(&manager.take_outbound()), vec!["add", "remove"]);

        assert_eq!(manager.on_target_added(id).unwrap(), AddOutcome::Superseded);
        assert!(manager.contains(id));
        assert_eq!(
            manager.on_target_removed(id, None).unwrap(),
            RemoveOutcome::Released
        );
    }

    #[test]
    fn unlisten_while_offline_collapses_locally() {
        let mut manager = TargetManager::new();
        let id = manager.listen(target());
        manager.unlisten(id);
        assert!(manager.is_empty());
        assert!(!manager.has_outbound());

        manager.on_stream_open();
        assert!(manager.take_outbound().is_empty());
    }

    #[test]
    fn stream_close_resets_counters() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.take_outbound();

        manager.on_stream_closed();
        let state = manager.state(id).unwrap();
        assert_eq!(state.pending_adds, 0);
        assert!(!state.current);

        manager.on_stream_open();
        assert_eq!(kinds(&manager.take_outbound()), vec!["add"]);
        assert_eq!(manager.state(id).unwrap().pending_adds, 1);
        assert!(matches!(
            manager.on_target_added(id).unwrap(),
            AddOutcome::Activated { .. }
        ));
    }

    #[test]
    fn stream_close_keeps_resume_token() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.on_target_added(id).unwrap();
        manager.mark_current(id, Some("token-1".into()), Version(10));
        assert!(manager.is_current(id));

        manager.on_stream_closed();
        assert!(!manager.is_current(id));
        manager.on_stream_open();
        match &manager.take_outbound()[0] {
            WatchRequest::AddTarget { resume_token, .. } => {
                assert_eq!(resume_token, &Some(ResumeToken::from("token-1")));
            }
            other => panic!("unexpected request {other:?}"),
        }
        assert_eq!(
            manager.on_target_added(id).unwrap(),
            AddOutcome::Activated { reset: false }
        );
    }

    #[test]
    fn stream_close_drops_unlistened_targets() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.on_target_added(id).unwrap();
        manager.unlisten(id);

        manager.on_stream_closed();
        assert!(manager.is_empty());
    }

    #[test]
    fn rejection_tears_down_state() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        let status = Status::new(StatusCode::PermissionDenied, "denied");

        assert_eq!(
            manager.on_target_removed(id, Some(status.clone())).unwrap(),
            RemoveOutcome::Rejected(status)
        );
        assert!(!manager.contains(id));
    }

    #[test]
    fn unknown_and_unexpected_acks_are_errors() {
        let mut manager = open_manager();
        assert!(matches!(
            manager.on_target_added(TargetId(99)),
            Err(SyncError::UnknownTarget(_))
        ));

        let id = manager.listen(target());
        manager.on_target_added(id).unwrap();
        assert!(matches!(
            manager.on_target_added(id),
            Err(SyncError::Internal(_))
        ));
    }

    #[test]
    fn server_initiated_removal_readds() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.on_target_added(id).unwrap();
        manager.take_outbound();

        assert_eq!(
            manager.on_target_removed(id, None).unwrap(),
            RemoveOutcome::Readded
        );
        assert_eq!(kinds(&manager.take_outbound()), vec!["add"]);
        assert!(!manager.is_active(id));
    }

    #[test]
    fn mark_current_requires_active_target() {
        let mut manager = open_manager();
        let id = manager.listen(target());
        manager.mark_current(id, Some("t".into()), Version(1));
        assert!(!manager.is_current(id));
    }
}
