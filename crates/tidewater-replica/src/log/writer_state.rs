//! Per-writer idempotency state.
//!
//! Each writer keeps a bounded window of its most recently appended batches.
//! A resend that lands inside the window is a duplicate; a sequence that skips
//! past `last + 1` is out of order. The window is derived entirely from the
//! log contents, so truncation rebuilds it from the surviving batches.

use crate::error::{ReplicaError, Result};
use std::collections::{HashMap, VecDeque};
use tidewater_common::{LogRecordBatch, Offset};

/// Offset range of one appended batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMetadata {
    pub batch_sequence: i32,
    pub first_offset: Offset,
    pub last_offset: Offset,
}

/// Result of checking a batch against its writer's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Batch has no writer id or is the writer's next sequence
    Accept,
    /// Batch was already appended at this range
    Duplicate(BatchMetadata),
}

#[derive(Debug, Default)]
struct WriterEntry {
    batches: VecDeque<BatchMetadata>,
}

impl WriterEntry {
    fn last_sequence(&self) -> Option<i32> {
        self.batches.back().map(|b| b.batch_sequence)
    }
}

pub(crate) fn next_sequence(sequence: i32) -> i32 {
    if sequence == i32::MAX {
        0
    } else {
        sequence + 1
    }
}

/// Recent-batch windows for every writer seen in a log.
#[derive(Debug)]
pub struct WriterStateManager {
    max_batches_per_writer: usize,
    writers: HashMap<i64, WriterEntry>,
}

impl WriterStateManager {
    pub fn new(max_batches_per_writer: usize) -> Self {
        Self {
            max_batches_per_writer: max_batches_per_writer.max(1),
            writers: HashMap::new(),
        }
    }

    pub fn last_sequence(&self, writer_id: i64) -> Option<i32> {
        self.writers.get(&writer_id).and_then(WriterEntry::last_sequence)
    }

    /// Leader-side check: duplicates resolve to the original range, gaps are errors.
    ///
    /// A writer the log has never seen may start at any sequence.
    pub fn check_leader_batch(&self, batch: &LogRecordBatch) -> Result<SequenceCheck> {
        let Some(key) = batch.writer_batch_key() else {
            return Ok(SequenceCheck::Accept);
        };
        let Some(entry) = self.writers.get(&key.writer_id) else {
            return Ok(SequenceCheck::Accept);
        };

        if let Some(existing) = entry
            .batches
            .iter()
            .find(|b| b.batch_sequence == key.batch_sequence)
        {
            return Ok(SequenceCheck::Duplicate(*existing));
        }

        match entry.last_sequence() {
            Some(last) if next_sequence(last) != key.batch_sequence => {
                Err(ReplicaError::OutOfOrderSequence {
                    writer_id: key.writer_id,
                    batch_sequence: key.batch_sequence,
                    expected: next_sequence(last),
                })
            }
            _ => Ok(SequenceCheck::Accept),
        }
    }

    /// Follower-side check: any sequence at or below the last one is a duplicate.
    ///
    /// Followers copy whatever the leader holds, so gaps are accepted.
    pub fn check_follower_batch(&self, batch: &LogRecordBatch) -> Result<()> {
        let Some(key) = batch.writer_batch_key() else {
            return Ok(());
        };
        match self.last_sequence(key.writer_id) {
            Some(last) if is_replayed_sequence(last, key.batch_sequence) => {
                Err(ReplicaError::DuplicateSequence {
                    writer_id: key.writer_id,
                    batch_sequence: key.batch_sequence,
                    last_sequence: last,
                })
            }
            _ => Ok(()),
        }
    }

    /// Record an appended batch.
    pub fn update(&mut self, batch: &LogRecordBatch) {
        if !batch.has_writer_id() {
            return;
        }
        let entry = self.writers.entry(batch.writer_id).or_default();
        entry.batches.push_back(BatchMetadata {
            batch_sequence: batch.batch_sequence,
            first_offset: batch.base_offset,
            last_offset: batch.last_offset(),
        });
        while entry.batches.len() > self.max_batches_per_writer {
            entry.batches.pop_front();
        }
    }

    /// Recompute all windows from the batches that remain in the log.
    pub fn rebuild<'a>(&mut self, batches: impl IntoIterator<Item = &'a LogRecordBatch>) {
        self.writers.clear();
        for batch in batches {
            self.update(batch);
        }
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }
}

/// Whether `sequence` is at or below `last`, treating `i32::MAX -> 0` as a wrap.
pub(crate) fn is_replayed_sequence(last: i32, sequence: i32) -> bool {
    sequence <= last && !(last == i32::MAX && sequence == 0)
}
