//! Error types for replica, log and fetcher operations

use std::io;
use std::time::Duration;
use thiserror::Error;
use tidewater_common::{ApiError, ErrorCode, TableBucket};

/// Result type for replica operations
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Errors that can occur while hosting, appending to or fetching for a replica
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// I/O error from the local log
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Local log storage failed in a way that cannot be retried
    #[error("Storage error: {0}")]
    Storage(String),

    /// Batch already present for this writer
    #[error("Duplicate batch for writer {writer_id}: sequence {batch_sequence}, last appended {last_sequence}")]
    DuplicateSequence {
        writer_id: i64,
        batch_sequence: i32,
        last_sequence: i32,
    },

    /// Batch sequence skips ahead of the writer's last sequence
    #[error("Out of order sequence for writer {writer_id}: expected {expected}, got {batch_sequence}")]
    OutOfOrderSequence {
        writer_id: i64,
        batch_sequence: i32,
        expected: i32,
    },

    /// Follower batch does not start where the local log ends
    #[error("Batch base offset {base_offset} does not match log end offset {log_end_offset}")]
    OffsetMismatch {
        base_offset: i64,
        log_end_offset: i64,
    },

    /// Read position outside the log
    #[error("Offset {offset} is out of range, log end offset {log_end_offset}")]
    OffsetOutOfRange { offset: i64, log_end_offset: i64 },

    /// Malformed batch
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// This server is not the leader (or not a follower) for the bucket
    #[error("Not leader or follower: {0}")]
    NotLeaderOrFollower(String),

    /// Request carries a leader epoch older than the current one
    #[error("Fenced leader epoch for {bucket}: request epoch {request_epoch}, current epoch {current_epoch}")]
    FencedLeaderEpoch {
        bucket: TableBucket,
        request_epoch: i32,
        current_epoch: i32,
    },

    /// Notification from a coordinator that has been superseded
    #[error("Invalid coordinator epoch: request epoch {request_epoch}, current epoch {current_epoch}")]
    InvalidCoordinatorEpoch {
        request_epoch: i32,
        current_epoch: i32,
    },

    /// Bucket not hosted on this server
    #[error("Unknown table or bucket: {0}")]
    UnknownTableOrBucket(TableBucket),

    /// This server is not in the bucket's replica assignment
    #[error("Server {server_id} is not assigned a replica of {bucket}")]
    ReplicaNotAssigned { bucket: TableBucket, server_id: i32 },

    /// Replica stopped after a local storage failure
    #[error("Replica {bucket} is offline: {reason}")]
    ReplicaOffline { bucket: TableBucket, reason: String },

    /// Transport failure talking to another server
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request exceeded its bounded wait
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReplicaError {
    /// Whether the failure is transient and the same request may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ReplicaError::Transport(_)
                | ReplicaError::Timeout(_)
                | ReplicaError::NotLeaderOrFollower(_)
                | ReplicaError::UnknownTableOrBucket(_)
        )
    }

    /// Whether the local log can no longer be trusted.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, ReplicaError::Io(_) | ReplicaError::Storage(_))
    }

    /// Error code sent back across the RPC boundary.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ReplicaError::Io(_) | ReplicaError::Storage(_) => ErrorCode::StorageError,
            ReplicaError::DuplicateSequence { .. } => ErrorCode::DuplicateSequence,
            ReplicaError::OutOfOrderSequence { .. } => ErrorCode::OutOfOrderSequence,
            ReplicaError::OffsetMismatch { .. } | ReplicaError::InvalidRecord(_) => {
                ErrorCode::InvalidRecord
            }
            ReplicaError::OffsetOutOfRange { .. } => ErrorCode::OffsetOutOfRange,
            ReplicaError::NotLeaderOrFollower(_) => ErrorCode::NotLeaderOrFollower,
            ReplicaError::FencedLeaderEpoch { .. } => ErrorCode::FencedLeaderEpoch,
            ReplicaError::InvalidCoordinatorEpoch { .. } => ErrorCode::InvalidCoordinatorEpoch,
            ReplicaError::UnknownTableOrBucket(_) => ErrorCode::UnknownTableOrBucket,
            ReplicaError::ReplicaNotAssigned { .. } => ErrorCode::ReplicaNotAssigned,
            ReplicaError::ReplicaOffline { .. } => ErrorCode::ReplicaOffline,
            ReplicaError::Transport(_) => ErrorCode::NetworkError,
            ReplicaError::Timeout(_) => ErrorCode::RequestTimedOut,
            ReplicaError::Config(_) | ReplicaError::Other(_) => ErrorCode::Unknown,
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError::new(self.error_code(), self.to_string())
    }
}

impl From<ApiError> for ReplicaError {
    fn from(e: ApiError) -> Self {
        match e.code {
            ErrorCode::NetworkError => ReplicaError::Transport(e.message),
            ErrorCode::NotLeaderOrFollower => ReplicaError::NotLeaderOrFollower(e.message),
            ErrorCode::StorageError => ReplicaError::Storage(e.message),
            _ => ReplicaError::Other(anyhow::anyhow!(e)),
        }
    }
}
