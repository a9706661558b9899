use super::writer_state::{is_replayed_sequence, next_sequence, SequenceCheck, WriterStateManager};
use super::{LogAppendInfo, LogOffsetSnapshot, LogStorage};
use crate::config::LogConfig;
use crate::error::{ReplicaError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use tidewater_common::{LogRecordBatch, MemoryLogRecords, Offset, TableBucket};
use tracing::{debug, info};

/// In-memory log of one bucket.
///
/// All positions live under a single lock so a reader never observes a log
/// end offset and high watermark from different appends.
pub struct MemoryLog {
    table_bucket: TableBucket,
    inner: RwLock<LogInner>,
}

struct LogInner {
    batches: Vec<LogRecordBatch>,
    log_end_offset: Offset,
    high_watermark: Offset,
    writer_state: WriterStateManager,
}

impl MemoryLog {
    pub fn new(table_bucket: TableBucket, config: &LogConfig) -> Self {
        Self {
            table_bucket,
            inner: RwLock::new(LogInner {
                batches: Vec::new(),
                log_end_offset: 0,
                high_watermark: 0,
                writer_state: WriterStateManager::new(config.max_batches_per_writer),
            }),
        }
    }

    pub fn batch_count(&self) -> usize {
        self.inner.read().batches.len()
    }
}

fn ensure_not_empty(records: &MemoryLogRecords) -> Result<()> {
    if records.is_empty() {
        return Err(ReplicaError::InvalidRecord(
            "append requires at least one batch".to_string(),
        ));
    }
    if let Some(batch) = records.batches().iter().find(|b| b.records.is_empty()) {
        return Err(ReplicaError::InvalidRecord(format!(
            "batch at offset {} has no records",
            batch.base_offset
        )));
    }
    Ok(())
}

/// Batch starting at `offset`, which must fall inside `batch`.
fn slice_from(batch: &LogRecordBatch, offset: Offset) -> LogRecordBatch {
    let skip = (offset - batch.base_offset) as usize;
    LogRecordBatch {
        base_offset: offset,
        writer_id: batch.writer_id,
        batch_sequence: batch.batch_sequence,
        records: batch.records[skip..].to_vec(),
    }
}

impl LogInner {
    /// Sequence validation for a multi-batch leader append. Every batch must
    /// be new; batches of one writer must be consecutive.
    fn validate_leader_batches(&self, batches: &[LogRecordBatch]) -> Result<()> {
        let mut pending: HashMap<i64, i32> = HashMap::new();
        for batch in batches {
            let Some(key) = batch.writer_batch_key() else {
                continue;
            };
            if let Some(&last) = pending.get(&key.writer_id) {
                if next_sequence(last) != key.batch_sequence {
                    return Err(ReplicaError::OutOfOrderSequence {
                        writer_id: key.writer_id,
                        batch_sequence: key.batch_sequence,
                        expected: next_sequence(last),
                    });
                }
            } else if let SequenceCheck::Duplicate(_) =
                self.writer_state.check_leader_batch(batch)?
            {
                return Err(ReplicaError::DuplicateSequence {
                    writer_id: key.writer_id,
                    batch_sequence: key.batch_sequence,
                    last_sequence: self
                        .writer_state
                        .last_sequence(key.writer_id)
                        .unwrap_or(key.batch_sequence),
                });
            }
            pending.insert(key.writer_id, key.batch_sequence);
        }
        Ok(())
    }

    fn validate_follower_batches(&self, batches: &[LogRecordBatch]) -> Result<()> {
        let mut expected_offset = self.log_end_offset;
        let mut pending: HashMap<i64, i32> = HashMap::new();
        for batch in batches {
            if batch.base_offset != expected_offset {
                return Err(ReplicaError::OffsetMismatch {
                    base_offset: batch.base_offset,
                    log_end_offset: expected_offset,
                });
            }
            if let Some(key) = batch.writer_batch_key() {
                match pending.get(&key.writer_id) {
                    Some(&last) if is_replayed_sequence(last, key.batch_sequence) => {
                        return Err(ReplicaError::DuplicateSequence {
                            writer_id: key.writer_id,
                            batch_sequence: key.batch_sequence,
                            last_sequence: last,
                        });
                    }
                    Some(_) => {}
                    None => self.writer_state.check_follower_batch(batch)?,
                }
                pending.insert(key.writer_id, key.batch_sequence);
            }
            expected_offset = batch.next_offset();
        }
        Ok(())
    }

    fn push(&mut self, batch: LogRecordBatch) {
        self.writer_state.update(&batch);
        self.log_end_offset = batch.next_offset();
        self.batches.push(batch);
    }
}

impl LogStorage for MemoryLog {
    fn table_bucket(&self) -> TableBucket {
        self.table_bucket
    }

    fn append_as_leader(&self, records: &MemoryLogRecords) -> Result<LogAppendInfo> {
        ensure_not_empty(records)?;
        let batches = records.batches();
        let mut inner = self.inner.write();

        if let [batch] = batches {
            if let SequenceCheck::Duplicate(existing) = inner.writer_state.check_leader_batch(batch)? {
                debug!(
                    "Duplicate batch (writer {}, seq {}) for {}, returning offsets {}..={}",
                    batch.writer_id,
                    batch.batch_sequence,
                    self.table_bucket,
                    existing.first_offset,
                    existing.last_offset
                );
                return Ok(LogAppendInfo {
                    first_offset: existing.first_offset,
                    last_offset: existing.last_offset,
                    record_count: existing.last_offset - existing.first_offset + 1,
                    duplicated: true,
                });
            }
        } else {
            inner.validate_leader_batches(batches)?;
        }

        let first_offset = inner.log_end_offset;
        for batch in batches {
            let base_offset = inner.log_end_offset;
            inner.push(batch.clone().with_base_offset(base_offset));
        }

        Ok(LogAppendInfo {
            first_offset,
            last_offset: inner.log_end_offset - 1,
            record_count: inner.log_end_offset - first_offset,
            duplicated: false,
        })
    }

    fn append_as_follower(
        &self,
        records: &MemoryLogRecords,
        leader_high_watermark: Option<Offset>,
    ) -> Result<LogAppendInfo> {
        ensure_not_empty(records)?;
        let batches = records.batches();
        let mut inner = self.inner.write();
        inner.validate_follower_batches(batches)?;

        let first_offset = inner.log_end_offset;
        for batch in batches {
            inner.push(batch.clone());
        }
        if let Some(leader_hw) = leader_high_watermark {
            let new_hw = leader_hw.min(inner.log_end_offset);
            if new_hw > inner.high_watermark {
                inner.high_watermark = new_hw;
            }
        }

        Ok(LogAppendInfo {
            first_offset,
            last_offset: inner.log_end_offset - 1,
            record_count: inner.log_end_offset - first_offset,
            duplicated: false,
        })
    }

    fn read(&self, fetch_offset: Offset, max_bytes: usize) -> Result<MemoryLogRecords> {
        let inner = self.inner.read();
        if fetch_offset < 0 || fetch_offset > inner.log_end_offset {
            return Err(ReplicaError::OffsetOutOfRange {
                offset: fetch_offset,
                log_end_offset: inner.log_end_offset,
            });
        }

        let start = inner
            .batches
            .partition_point(|b| b.last_offset() < fetch_offset);
        let mut batches = Vec::new();
        let mut total_bytes = 0;
        for batch in &inner.batches[start..] {
            let batch = if batch.base_offset < fetch_offset {
                slice_from(batch, fetch_offset)
            } else {
                batch.clone()
            };
            let size = batch.size_in_bytes();
            if !batches.is_empty() && total_bytes + size > max_bytes {
                break;
            }
            total_bytes += size;
            batches.push(batch);
        }
        Ok(MemoryLogRecords::from_batches(batches))
    }

    fn truncate_to(&self, offset: Offset) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        assert!(
            (0..=inner.log_end_offset).contains(&offset),
            "truncation offset {} outside log {} with end offset {}",
            offset,
            self.table_bucket,
            inner.log_end_offset
        );
        if offset == inner.log_end_offset {
            return Ok(());
        }

        let mut keep = inner.batches.partition_point(|b| b.next_offset() <= offset);
        if let Some(batch) = inner.batches.get_mut(keep) {
            if batch.base_offset < offset {
                batch.records.truncate((offset - batch.base_offset) as usize);
                keep += 1;
            }
        }
        inner.batches.truncate(keep);

        let previous_end = inner.log_end_offset;
        inner.log_end_offset = offset;
        inner.high_watermark = inner.high_watermark.min(offset);
        inner.writer_state.rebuild(inner.batches.iter());

        info!(
            "Truncated log {} from {} to {} (high watermark {})",
            self.table_bucket, previous_end, offset, inner.high_watermark
        );
        Ok(())
    }

    fn local_log_end_offset(&self) -> Offset {
        self.inner.read().log_end_offset
    }

    fn high_watermark(&self) -> Offset {
        self.inner.read().high_watermark
    }

    fn update_high_watermark(&self, high_watermark: Offset) -> Result<bool> {
        let mut inner = self.inner.write();
        let new_hw = high_watermark.min(inner.log_end_offset);
        if new_hw > inner.high_watermark {
            inner.high_watermark = new_hw;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn offset_snapshot(&self) -> LogOffsetSnapshot {
        let inner = self.inner.read();
        LogOffsetSnapshot {
            log_end_offset: inner.log_end_offset,
            high_watermark: inner.high_watermark,
        }
    }
}
