//! Error types for the sync engine.

use docsync_protocol::{BatchId, Status, StatusCode, StreamError, TargetId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The watch stream closed with an error.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The server rejected a listen target.
    #[error("{target_id} rejected: {status}")]
    TargetRejected {
        /// Rejected target.
        target_id: TargetId,
        /// Rejection cause.
        status: Status,
    },

    /// The server rejected a mutation batch.
    #[error("{batch_id} rejected: {status}")]
    MutationRejected {
        /// Rejected batch.
        batch_id: BatchId,
        /// Rejection cause.
        status: Status,
    },

    /// Persistence collaborator failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Local state disagrees with what the server reported.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// No listener with this handle is registered.
    #[error("unknown listener {0}")]
    UnknownListener(u64),

    /// A server message referred to a target that was never requested.
    #[error("unknown {0}")]
    UnknownTarget(TargetId),

    /// The engine has shut down.
    #[error("sync engine shut down")]
    Shutdown,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a target rejection.
    pub fn target_rejected(target_id: TargetId, status: Status) -> Self {
        Self::TargetRejected { target_id, status }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Stream(err) => !err.is_permanent(),
            SyncError::MutationRejected { status, .. } => !status.code.is_permanent_write_error(),
            _ => false,
        }
    }

    /// Returns the status code carried by a server-reported error.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            SyncError::Stream(err) => Some(err.status.code),
            SyncError::TargetRejected { status, .. } | SyncError::MutationRejected { status, .. } => {
                Some(status.code)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::from(StreamError::new(StatusCode::Unavailable, "reset")).is_retryable());
        assert!(
            !SyncError::from(StreamError::new(StatusCode::PermissionDenied, "denied"))
                .is_retryable()
        );
        assert!(!SyncError::Internal("desync".into()).is_retryable());
        assert!(!SyncError::MutationRejected {
            batch_id: BatchId(1),
            status: Status::new(StatusCode::Aborted, "conflict"),
        }
        .is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::target_rejected(
            TargetId(4),
            Status::new(StatusCode::PermissionDenied, "no access"),
        );
        assert_eq!(err.to_string(), "target#4 rejected: permission-denied: no access");
        assert_eq!(err.code(), Some(StatusCode::PermissionDenied));

        assert_eq!(SyncError::Shutdown.to_string(), "sync engine shut down");
        assert_eq!(SyncError::Shutdown.code(), None);
    }
}
