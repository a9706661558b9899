//! Local log storage for replicas
//!
//! Durable segment storage lives outside this crate. Replication talks to the
//! log through [`LogStorage`], and [`MemoryLog`] is the in-process
//! implementation used by tablet servers under test and by embedded setups.

mod memory;
pub mod writer_state;

pub use memory::MemoryLog;
pub use writer_state::{BatchMetadata, SequenceCheck, WriterStateManager};

use crate::error::Result;
use std::sync::Arc;
use tidewater_common::{MemoryLogRecords, Offset, TableBucket};

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogAppendInfo {
    pub first_offset: Offset,
    pub last_offset: Offset,
    pub record_count: i64,
    /// The batch was already present; offsets are those of the original append
    pub duplicated: bool,
}

impl LogAppendInfo {
    /// Offset right after the appended range.
    pub fn next_offset(&self) -> Offset {
        self.last_offset + 1
    }
}

/// Consistent view of the two log positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOffsetSnapshot {
    pub log_end_offset: Offset,
    pub high_watermark: Offset,
}

/// Local log of one bucket.
///
/// Implementations must update the log end offset and high watermark
/// atomically with respect to `offset_snapshot`, and must never let the high
/// watermark exceed the log end offset.
pub trait LogStorage: Send + Sync {
    /// Bucket this log belongs to
    fn table_bucket(&self) -> TableBucket;

    /// Assign offsets and append, deduplicating by writer batch key.
    fn append_as_leader(&self, records: &MemoryLogRecords) -> Result<LogAppendInfo>;

    /// Append batches whose offsets were assigned by the leader.
    ///
    /// The first batch must start at the local log end offset. When
    /// `leader_high_watermark` is given, the local high watermark is raised
    /// to `min(leader_high_watermark, log_end_offset)` in the same step.
    fn append_as_follower(
        &self,
        records: &MemoryLogRecords,
        leader_high_watermark: Option<Offset>,
    ) -> Result<LogAppendInfo>;

    /// Read batches starting at `fetch_offset`.
    ///
    /// Returns at least one batch when data exists, even if it exceeds
    /// `max_bytes`. Reading at the log end offset returns nothing.
    fn read(&self, fetch_offset: Offset, max_bytes: usize) -> Result<MemoryLogRecords>;

    /// Remove every record at or after `offset`.
    ///
    /// Panics if `offset` is beyond the log end offset.
    fn truncate_to(&self, offset: Offset) -> Result<()>;

    fn local_log_end_offset(&self) -> Offset;

    fn high_watermark(&self) -> Offset;

    /// Raise the high watermark, capped at the log end offset.
    ///
    /// Returns whether it moved.
    fn update_high_watermark(&self, high_watermark: Offset) -> Result<bool>;

    fn offset_snapshot(&self) -> LogOffsetSnapshot;
}

/// Creates the local log for a bucket the first time a server hosts it.
pub type LogFactory = Arc<dyn Fn(&TableBucket) -> Result<Arc<dyn LogStorage>> + Send + Sync>;

/// Factory producing fresh [`MemoryLog`]s.
pub fn memory_log_factory(config: crate::config::LogConfig) -> LogFactory {
    Arc::new(move |bucket: &TableBucket| {
        Ok(Arc::new(MemoryLog::new(*bucket, &config)) as Arc<dyn LogStorage>)
    })
}
