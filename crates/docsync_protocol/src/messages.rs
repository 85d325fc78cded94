//! Messages exchanged over the watch stream.

use crate::model::{Document, Version};
use crate::mutation::{BatchId, MutationBatch};
use crate::status::{Status, StreamError};
use crate::target::{ResumeToken, Target, TargetId};
use serde::{Deserialize, Serialize};

/// A server-pushed watch notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchChange {
    /// The server acknowledged add requests for these targets.
    TargetAdded {
        /// Acknowledged targets.
        target_ids: Vec<TargetId>,
    },
    /// The server removed these targets, either acknowledging a remove
    /// request (`cause == None`) or rejecting the target.
    TargetRemoved {
        /// Removed targets.
        target_ids: Vec<TargetId>,
        /// Rejection cause, if any.
        cause: Option<Status>,
    },
    /// A document changed.
    DocumentChanged {
        /// New state of the document; a missing document is a delete.
        document: Document,
        /// Targets the document now belongs to.
        updated_target_ids: Vec<TargetId>,
        /// Targets the document no longer belongs to.
        removed_target_ids: Vec<TargetId>,
    },
    /// The server has sent everything needed for the target to be complete.
    Current {
        /// Target.
        target_id: TargetId,
        /// Token for resuming the target later.
        resume_token: ResumeToken,
    },
    /// Consistent snapshot boundary; everything buffered so far is applied
    /// as one unit.
    Snapshot {
        /// Snapshot version.
        version: Version,
    },
}

impl WatchChange {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            WatchChange::TargetAdded { .. } => 1,
            WatchChange::TargetRemoved { .. } => 2,
            WatchChange::DocumentChanged { .. } => 3,
            WatchChange::Current { .. } => 4,
            WatchChange::Snapshot { .. } => 5,
        }
    }

    /// Convenience constructor for a document update tagged for targets.
    pub fn document(document: Document, target_ids: Vec<TargetId>) -> Self {
        WatchChange::DocumentChanged {
            document,
            updated_target_ids: target_ids,
            removed_target_ids: Vec::new(),
        }
    }
}

/// A client request to change the set of watched targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchRequest {
    /// Start watching a target.
    AddTarget {
        /// Client-assigned target ID.
        target_id: TargetId,
        /// What to watch.
        target: Target,
        /// Resume token from an earlier session, if any.
        resume_token: Option<ResumeToken>,
    },
    /// Stop watching a target.
    RemoveTarget {
        /// Target ID.
        target_id: TargetId,
    },
}

impl WatchRequest {
    /// Returns the target ID the request refers to.
    pub fn target_id(&self) -> TargetId {
        match self {
            WatchRequest::AddTarget { target_id, .. } | WatchRequest::RemoveTarget { target_id } => {
                *target_id
            }
        }
    }
}

/// Outbound message on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamRequest {
    /// Watch target change.
    Watch(WatchRequest),
    /// Mutation batch to commit.
    Write(MutationBatch),
}

/// Inbound event on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// The stream finished its handshake and accepts requests.
    Open,
    /// Watch notification.
    Watch(WatchChange),
    /// A mutation batch was committed.
    WriteAcked {
        /// Batch ID.
        batch_id: BatchId,
        /// Commit version.
        commit_version: Version,
    },
    /// A mutation batch was rejected.
    WriteRejected {
        /// Batch ID.
        batch_id: BatchId,
        /// Rejection cause.
        status: Status,
    },
    /// The stream ended; `None` is a clean server-side finish.
    Closed(Option<StreamError>),
}

impl StreamEvent {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            StreamEvent::Open => 10,
            StreamEvent::Watch(change) => change.type_code(),
            StreamEvent::WriteAcked { .. } => 11,
            StreamEvent::WriteRejected { .. } => 12,
            StreamEvent::Closed(_) => 13,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentKey;
    use crate::status::StatusCode;
    use crate::target::Query;

    #[test]
    fn type_codes_are_distinct() {
        let doc = Document::missing("c/a", Version(1));
        let codes = [
            StreamEvent::Open.type_code(),
            StreamEvent::Watch(WatchChange::TargetAdded { target_ids: vec![] }).type_code(),
            StreamEvent::Watch(WatchChange::TargetRemoved {
                target_ids: vec![],
                cause: None,
            })
            .type_code(),
            StreamEvent::Watch(WatchChange::document(doc, vec![])).type_code(),
            StreamEvent::Watch(WatchChange::Current {
                target_id: TargetId(1),
                resume_token: "t".into(),
            })
            .type_code(),
            StreamEvent::Watch(WatchChange::Snapshot { version: Version(1) }).type_code(),
            StreamEvent::WriteAcked {
                batch_id: BatchId(1),
                commit_version: Version(1),
            }
            .type_code(),
            StreamEvent::WriteRejected {
                batch_id: BatchId(1),
                status: Status::new(StatusCode::Aborted, "conflict"),
            }
            .type_code(),
            StreamEvent::Closed(None).type_code(),
        ];
        let mut unique = codes.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn watch_request_target_id() {
        let add = WatchRequest::AddTarget {
            target_id: TargetId(3),
            target: Target::Query(Query::collection("c")),
            resume_token: None,
        };
        assert_eq!(add.target_id(), TargetId(3));
        assert_eq!(
            WatchRequest::RemoveTarget {
                target_id: TargetId(5)
            }
            .target_id(),
            TargetId(5)
        );
        let _ = Target::Document(DocumentKey::new("c/a"));
    }

    #[test]
    fn serde_roundtrip_of_watch_change() {
        let change = WatchChange::Current {
            target_id: TargetId(2),
            resume_token: "resume-token".into(),
        };
        let json = serde_json::to_string(&change).unwrap();
        let back: WatchChange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }
}
