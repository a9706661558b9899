//! Error codes carried inside per-bucket results.
//!
//! These travel across the RPC boundary, so they are plain data rather than
//! the `std::error::Error` types each crate uses internally.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code of a per-bucket result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotLeaderOrFollower,
    UnknownTableOrBucket,
    FencedLeaderEpoch,
    InvalidCoordinatorEpoch,
    ReplicaNotAssigned,
    ReplicaOffline,
    OutOfOrderSequence,
    DuplicateSequence,
    InvalidRecord,
    OffsetOutOfRange,
    StorageError,
    RequestTimedOut,
    NetworkError,
    Unknown,
}

impl ErrorCode {
    /// Whether the caller may retry the same request later.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::NotLeaderOrFollower
                | ErrorCode::UnknownTableOrBucket
                | ErrorCode::RequestTimedOut
                | ErrorCode::NetworkError
        )
    }
}

/// Error attached to one bucket of a response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
