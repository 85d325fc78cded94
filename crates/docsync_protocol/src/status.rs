//! Status codes carried by stream failures and rejections.

use crate::target::TargetId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Canonical status codes reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// The operation was cancelled.
    Cancelled,
    /// Unknown error.
    Unknown,
    /// The client sent an invalid request.
    InvalidArgument,
    /// The deadline expired.
    DeadlineExceeded,
    /// A referenced resource does not exist.
    NotFound,
    /// The resource already exists.
    AlreadyExists,
    /// The caller lacks permission.
    PermissionDenied,
    /// A quota or resource limit was hit.
    ResourceExhausted,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The operation was aborted, typically by a concurrency conflict.
    Aborted,
    /// Out of range.
    OutOfRange,
    /// Not implemented by the server.
    Unimplemented,
    /// Internal server error.
    Internal,
    /// The service is currently unavailable.
    Unavailable,
    /// Unrecoverable data loss.
    DataLoss,
    /// Missing or invalid credentials.
    Unauthenticated,
}

impl StatusCode {
    /// Returns true if a stream failure with this code must not be retried.
    pub fn is_permanent(&self) -> bool {
        !matches!(
            self,
            StatusCode::Cancelled
                | StatusCode::Unknown
                | StatusCode::DeadlineExceeded
                | StatusCode::ResourceExhausted
                | StatusCode::Internal
                | StatusCode::Unavailable
                | StatusCode::Unauthenticated
                | StatusCode::Aborted
        )
    }

    /// Returns true if a write rejected with this code must not be retried.
    ///
    /// Unlike stream failures, an aborted write is final.
    pub fn is_permanent_write_error(&self) -> bool {
        self.is_permanent() || *self == StatusCode::Aborted
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::InvalidArgument => "invalid-argument",
            StatusCode::DeadlineExceeded => "deadline-exceeded",
            StatusCode::NotFound => "not-found",
            StatusCode::AlreadyExists => "already-exists",
            StatusCode::PermissionDenied => "permission-denied",
            StatusCode::ResourceExhausted => "resource-exhausted",
            StatusCode::FailedPrecondition => "failed-precondition",
            StatusCode::Aborted => "aborted",
            StatusCode::OutOfRange => "out-of-range",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::Internal => "internal",
            StatusCode::Unavailable => "unavailable",
            StatusCode::DataLoss => "data-loss",
            StatusCode::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// A server-reported failure with its status code.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    /// Status code.
    pub code: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl Status {
    /// Creates a status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The cause of a watch stream closing with an error.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("stream closed: {status}")]
pub struct StreamError {
    /// Status reported for the failure.
    pub status: Status,
    /// The target the failure is attributed to, if any.
    pub target_id: Option<TargetId>,
}

impl StreamError {
    /// Creates a stream error not tied to a target.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::new(code, message),
            target_id: None,
        }
    }

    /// Attributes the failure to one target.
    pub fn for_target(mut self, target_id: TargetId) -> Self {
        self.target_id = Some(target_id);
        self
    }

    /// Returns true if the stream must not be reconnected for this failure.
    pub fn is_permanent(&self) -> bool {
        self.status.code.is_permanent()
    }
}
