//! In-memory record batches.
//!
//! The bytes-on-wire layout of a batch belongs to the RPC layer. Replication
//! only needs each batch's offset range and its idempotency key, so batches
//! are kept decoded here.

use crate::types::Offset;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Writer id of a batch produced without idempotence.
pub const NO_WRITER_ID: i64 = -1;

/// Batch sequence of a batch produced without idempotence.
pub const NO_BATCH_SEQUENCE: i32 = -1;

/// Fixed per-batch overhead used for fetch size accounting.
pub const RECORD_BATCH_HEADER_SIZE: usize = 61;

/// Fixed per-record overhead (timestamp plus length prefixes).
pub const LOG_RECORD_OVERHEAD: usize = 16;

/// Idempotency key of a write batch: (writer id, batch sequence).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WriterBatchKey {
    pub writer_id: i64,
    pub batch_sequence: i32,
}

impl WriterBatchKey {
    pub fn new(writer_id: i64, batch_sequence: i32) -> Self {
        Self {
            writer_id,
            batch_sequence,
        }
    }
}

impl fmt::Display for WriterBatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "writer {} seq {}", self.writer_id, self.batch_sequence)
    }
}

/// A single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl LogRecord {
    pub fn new(timestamp: i64, key: Option<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            key,
            value: value.into(),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        LOG_RECORD_OVERHEAD + self.key.as_ref().map_or(0, |k| k.len()) + self.value.len()
    }
}

/// A batch of records sharing one offset range and one idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecordBatch {
    /// Offset of the first record; assigned by the leader on append
    pub base_offset: Offset,
    pub writer_id: i64,
    pub batch_sequence: i32,
    pub records: Vec<LogRecord>,
}

impl LogRecordBatch {
    pub fn new(writer_id: i64, batch_sequence: i32, records: Vec<LogRecord>) -> Self {
        Self {
            base_offset: 0,
            writer_id,
            batch_sequence,
            records,
        }
    }

    /// Batch without an idempotency key.
    pub fn without_writer(records: Vec<LogRecord>) -> Self {
        Self::new(NO_WRITER_ID, NO_BATCH_SEQUENCE, records)
    }

    pub fn with_base_offset(mut self, base_offset: Offset) -> Self {
        self.base_offset = base_offset;
        self
    }

    pub fn record_count(&self) -> i64 {
        self.records.len() as i64
    }

    pub fn last_offset(&self) -> Offset {
        self.base_offset + self.record_count() - 1
    }

    /// Offset right after this batch.
    pub fn next_offset(&self) -> Offset {
        self.base_offset + self.record_count()
    }

    pub fn has_writer_id(&self) -> bool {
        self.writer_id != NO_WRITER_ID
    }

    pub fn writer_batch_key(&self) -> Option<WriterBatchKey> {
        if self.has_writer_id() {
            Some(WriterBatchKey::new(self.writer_id, self.batch_sequence))
        } else {
            None
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        RECORD_BATCH_HEADER_SIZE
            + self
                .records
                .iter()
                .map(LogRecord::size_in_bytes)
                .sum::<usize>()
    }
}

/// An ordered set of batches, as carried by produce and fetch payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLogRecords {
    batches: Vec<LogRecordBatch>,
}

impl MemoryLogRecords {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_batches(batches: Vec<LogRecordBatch>) -> Self {
        Self { batches }
    }

    pub fn single(batch: LogRecordBatch) -> Self {
        Self {
            batches: vec![batch],
        }
    }

    pub fn batches(&self) -> &[LogRecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<LogRecordBatch> {
        self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn record_count(&self) -> i64 {
        self.batches.iter().map(LogRecordBatch::record_count).sum()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.batches.iter().map(LogRecordBatch::size_in_bytes).sum()
    }

    pub fn first_offset(&self) -> Option<Offset> {
        self.batches.first().map(|b| b.base_offset)
    }

    pub fn last_offset(&self) -> Option<Offset> {
        self.batches.last().map(LogRecordBatch::last_offset)
    }
}
