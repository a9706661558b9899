//! Common types shared across Tidewater components.
//!
//! - **types**: bucket and table identifiers, server ids, offset constants
//! - **leader_and_isr**: leadership snapshots delivered by the coordinator
//! - **record**: in-memory record batches and their idempotency keys
//! - **error**: serializable error codes carried in per-bucket results

pub mod error;
pub mod leader_and_isr;
pub mod record;
pub mod types;

pub use error::{ApiError, ErrorCode};
pub use leader_and_isr::{LeaderAndIsr, NotifyLeaderAndIsrData};
pub use record::{LogRecord, LogRecordBatch, MemoryLogRecords, WriterBatchKey};
pub use types::{Offset, ServerId, TableBucket, TablePath};

/// Re-export commonly used external types
pub use bytes::Bytes;
