//! Per-bucket replica state machine
//!
//! A [`Replica`] owns the local log of one bucket and tracks whether this
//! server leads or follows it. Role changes arrive only through
//! leadership notifications; the replica decides from the epochs whether a
//! notification is new, an ISR update, a replay or stale.
//!
//! # High watermark
//!
//! On the leader the high watermark is the minimum log end offset across the
//! ISR, leader included, and only moves forward. A follower fetch at offset
//! `N` acknowledges everything before `N`. On a follower the high watermark
//! follows the leader's, capped at the local log end offset.

mod registry;

pub use registry::ReplicaRegistry;

use crate::endpoint::FetchLogResultForBucket;
use crate::error::{ReplicaError, Result};
use crate::log::{LogAppendInfo, LogOffsetSnapshot, LogStorage};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tidewater_common::leader_and_isr::{INITIAL_BUCKET_EPOCH, NO_LEADER_EPOCH};
use tidewater_common::types::UNKNOWN_OFFSET;
use tidewater_common::{
    MemoryLogRecords, NotifyLeaderAndIsrData, Offset, ServerId, TableBucket, TablePath,
};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// Role of this server for a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
}

/// How a leadership notification relates to the replica's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochCheck {
    /// Higher leader epoch: role and leader are (re)applied
    NewLeadership,
    /// Same leader epoch, higher bucket epoch: only the ISR changes
    IsrChange,
    /// Same leader epoch and bucket epoch already applied
    Replay,
}

#[derive(Debug, Clone)]
struct ReplicaState {
    role: ReplicaRole,
    leader_id: Option<ServerId>,
    leader_epoch: i32,
    bucket_epoch: i32,
    isr: BTreeSet<ServerId>,
    replicas: Vec<ServerId>,
    offline_reason: Option<String>,
}

/// Follower position as seen by the leader
#[derive(Debug, Clone, Copy)]
struct FollowerProgress {
    log_end_offset: Offset,
    last_fetch_time: Instant,
}

/// One bucket hosted on this server.
pub struct Replica {
    table_bucket: TableBucket,
    table_path: TablePath,
    local_server_id: ServerId,
    log: Arc<dyn LogStorage>,
    state: RwLock<ReplicaState>,
    /// Local log end offset cached when this replica last became leader
    leader_end_offset_snapshot: AtomicI64,
    /// Leader only: last fetch offset per follower
    follower_progress: DashMap<ServerId, FollowerProgress>,
    /// Woken after every leader append or high watermark advance so delayed
    /// fetches can answer
    append_notify: Option<Arc<Notify>>,
}

impl Replica {
    /// Create a replica over an existing log. It starts as a follower with no
    /// known leader until the first notification is applied.
    pub fn new(
        table_path: TablePath,
        table_bucket: TableBucket,
        local_server_id: ServerId,
        log: Arc<dyn LogStorage>,
    ) -> Self {
        debug!(
            "Creating replica {} of {} on server {} (log end offset {})",
            table_bucket,
            table_path,
            local_server_id,
            log.local_log_end_offset()
        );
        Self {
            table_bucket,
            table_path,
            local_server_id,
            log,
            state: RwLock::new(ReplicaState {
                role: ReplicaRole::Follower,
                leader_id: None,
                leader_epoch: NO_LEADER_EPOCH,
                bucket_epoch: INITIAL_BUCKET_EPOCH,
                isr: BTreeSet::new(),
                replicas: Vec::new(),
                offline_reason: None,
            }),
            leader_end_offset_snapshot: AtomicI64::new(UNKNOWN_OFFSET),
            follower_progress: DashMap::new(),
            append_notify: None,
        }
    }

    pub fn with_append_notify(mut self, notify: Arc<Notify>) -> Self {
        self.append_notify = Some(notify);
        self
    }

    fn check_epoch(&self, state: &ReplicaState, data: &NotifyLeaderAndIsrData) -> Result<EpochCheck> {
        let requested = data.leader_epoch();
        if requested < state.leader_epoch {
            return Err(ReplicaError::FencedLeaderEpoch {
                bucket: self.table_bucket,
                request_epoch: requested,
                current_epoch: state.leader_epoch,
            });
        }
        if requested > state.leader_epoch {
            return Ok(EpochCheck::NewLeadership);
        }
        if data.bucket_epoch() > state.bucket_epoch {
            Ok(EpochCheck::IsrChange)
        } else {
            Ok(EpochCheck::Replay)
        }
    }

    fn ensure_online(&self, state: &ReplicaState) -> Result<()> {
        match &state.offline_reason {
            Some(reason) => Err(ReplicaError::ReplicaOffline {
                bucket: self.table_bucket,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Classify a notification without applying it.
    pub fn epoch_check(&self, data: &NotifyLeaderAndIsrData) -> Result<EpochCheck> {
        let state = self.state.read();
        self.ensure_online(&state)?;
        self.check_epoch(&state, data)
    }

    /// Become leader of the bucket.
    ///
    /// Callers must stop fetching for the bucket first, so the cached end
    /// offset snapshot is the final follower position.
    pub fn make_leader(&self, data: &NotifyLeaderAndIsrData) -> Result<EpochCheck> {
        let mut state = self.state.write();
        self.ensure_online(&state)?;
        let check = self.check_epoch(&state, data)?;

        match check {
            EpochCheck::Replay => {
                trace!(
                    "Ignoring replayed leader notification for {} at epoch {}",
                    self.table_bucket,
                    data.leader_epoch()
                );
            }
            EpochCheck::IsrChange => {
                self.apply_isr(&mut state, data);
                drop(state);
                self.maybe_increment_leader_high_watermark()?;
            }
            EpochCheck::NewLeadership => {
                let previous_role = state.role;
                state.role = ReplicaRole::Leader;
                state.leader_id = Some(self.local_server_id);
                state.leader_epoch = data.leader_epoch();
                state.replicas = data.replicas.clone();
                self.apply_isr(&mut state, data);

                let snapshot = self.log.local_log_end_offset();
                self.leader_end_offset_snapshot
                    .store(snapshot, Ordering::Release);
                self.follower_progress.clear();

                info!(
                    "Replica {} became leader at epoch {} (was {:?}), leader end offset snapshot {}, isr {:?}",
                    self.table_bucket, state.leader_epoch, previous_role, snapshot, state.isr
                );
                drop(state);
                self.maybe_increment_leader_high_watermark()?;
            }
        }
        Ok(check)
    }

    /// Follow `data.leader()`.
    pub fn make_follower(&self, data: &NotifyLeaderAndIsrData) -> Result<EpochCheck> {
        let mut state = self.state.write();
        self.ensure_online(&state)?;
        let check = self.check_epoch(&state, data)?;

        match check {
            EpochCheck::Replay => {
                trace!(
                    "Ignoring replayed follower notification for {} at epoch {}",
                    self.table_bucket,
                    data.leader_epoch()
                );
            }
            EpochCheck::IsrChange => self.apply_isr(&mut state, data),
            EpochCheck::NewLeadership => {
                let previous_leader = state.leader_id;
                state.role = ReplicaRole::Follower;
                state.leader_id = Some(data.leader());
                state.leader_epoch = data.leader_epoch();
                state.replicas = data.replicas.clone();
                self.apply_isr(&mut state, data);
                self.follower_progress.clear();

                info!(
                    "Replica {} now follows server {} at epoch {} (previous leader {:?}), log end offset {}",
                    self.table_bucket,
                    data.leader(),
                    state.leader_epoch,
                    previous_leader,
                    self.log.local_log_end_offset()
                );
            }
        }
        Ok(check)
    }

    fn apply_isr(&self, state: &mut ReplicaState, data: &NotifyLeaderAndIsrData) {
        let isr: BTreeSet<ServerId> = data.isr().iter().copied().collect();
        if state.isr != isr && !state.isr.is_empty() {
            let removed: Vec<_> = state.isr.difference(&isr).copied().collect();
            let added: Vec<_> = isr.difference(&state.isr).copied().collect();
            if !removed.is_empty() {
                warn!(
                    "ISR of {} shrank: removed {:?} (bucket epoch {})",
                    self.table_bucket,
                    removed,
                    data.bucket_epoch()
                );
            }
            if !added.is_empty() {
                info!(
                    "ISR of {} expanded: added {:?} (bucket epoch {})",
                    self.table_bucket,
                    added,
                    data.bucket_epoch()
                );
            }
        }
        state.isr = isr;
        state.bucket_epoch = data.bucket_epoch();
    }

    /// Append produced records on the leader.
    pub fn append_records_to_leader(&self, records: &MemoryLogRecords) -> Result<LogAppendInfo> {
        let info = {
            let state = self.state.read();
            self.ensure_online(&state)?;
            if state.role != ReplicaRole::Leader {
                return Err(ReplicaError::NotLeaderOrFollower(format!(
                    "server {} is not the leader of {}",
                    self.local_server_id, self.table_bucket
                )));
            }
            self.log.append_as_leader(records)?
        };
        if !self.maybe_increment_leader_high_watermark()? {
            self.wake_delayed_fetches();
        }
        Ok(info)
    }

    fn ensure_follower(&self) -> Result<()> {
        let state = self.state.read();
        self.ensure_online(&state)?;
        if state.role != ReplicaRole::Follower {
            return Err(ReplicaError::NotLeaderOrFollower(format!(
                "server {} leads {} and cannot append as follower",
                self.local_server_id, self.table_bucket
            )));
        }
        Ok(())
    }

    /// Positional append of leader-assigned batches. Leaves the high
    /// watermark alone.
    pub fn append_records_to_follower(&self, records: &MemoryLogRecords) -> Result<LogAppendInfo> {
        self.ensure_follower()?;
        self.log.append_as_follower(records, None)
    }

    /// Append a fetched chunk and adopt the leader's high watermark in one step.
    pub fn apply_fetched_records(
        &self,
        records: &MemoryLogRecords,
        leader_high_watermark: Offset,
    ) -> Result<LogAppendInfo> {
        self.ensure_follower()?;
        self.log
            .append_as_follower(records, Some(leader_high_watermark))
    }

    /// Adopt the leader's high watermark, capped at the local log end offset.
    pub fn update_follower_high_watermark(&self, leader_high_watermark: Offset) -> Result<bool> {
        self.log.update_high_watermark(leader_high_watermark)
    }

    /// Drop the local tail starting at `offset`.
    pub fn truncate_to(&self, offset: Offset) -> Result<()> {
        self.log.truncate_to(offset)
    }

    /// Recompute the leader high watermark from ISR progress.
    ///
    /// An ISR follower that has not fetched since this replica became leader
    /// holds the high watermark where it is.
    pub fn maybe_increment_leader_high_watermark(&self) -> Result<bool> {
        let state = self.state.read();
        if state.role != ReplicaRole::Leader {
            return Ok(false);
        }

        let mut new_hw = self.log.local_log_end_offset();
        for follower in state.isr.iter().filter(|id| **id != self.local_server_id) {
            match self.follower_progress.get(follower) {
                Some(progress) => new_hw = new_hw.min(progress.log_end_offset),
                None => return Ok(false),
            }
        }

        let moved = self.log.update_high_watermark(new_hw)?;
        if moved {
            trace!("High watermark of {} advanced to {}", self.table_bucket, new_hw);
            self.wake_delayed_fetches();
        }
        Ok(moved)
    }

    fn wake_delayed_fetches(&self) {
        if let Some(notify) = &self.append_notify {
            notify.notify_waiters();
        }
    }

    /// Serve one bucket of a follower fetch.
    pub fn fetch_records_as_leader(
        &self,
        follower_id: ServerId,
        fetch_offset: Offset,
        leader_epoch: i32,
        max_bytes: usize,
    ) -> FetchLogResultForBucket {
        {
            let state = self.state.read();
            if let Err(e) = self.ensure_online(&state) {
                return FetchLogResultForBucket::Error(e.to_api_error());
            }
            if state.role != ReplicaRole::Leader {
                return FetchLogResultForBucket::Error(
                    ReplicaError::NotLeaderOrFollower(format!(
                        "server {} is not the leader of {}",
                        self.local_server_id, self.table_bucket
                    ))
                    .to_api_error(),
                );
            }
            if leader_epoch != state.leader_epoch {
                debug!(
                    "Fenced fetch for {} from server {}: epoch {} vs current {}",
                    self.table_bucket, follower_id, leader_epoch, state.leader_epoch
                );
                return FetchLogResultForBucket::FencedLeaderEpoch {
                    current_leader_epoch: state.leader_epoch,
                };
            }
            if !state.replicas.contains(&follower_id) {
                return FetchLogResultForBucket::Error(
                    ReplicaError::ReplicaNotAssigned {
                        bucket: self.table_bucket,
                        server_id: follower_id,
                    }
                    .to_api_error(),
                );
            }
        }

        let log_end_offset = self.log.local_log_end_offset();
        if fetch_offset > log_end_offset {
            let snapshot = self.leader_end_offset_snapshot();
            warn!(
                "Server {} fetched {} at offset {} beyond leader log end offset {}, replying with snapshot {}",
                follower_id, self.table_bucket, fetch_offset, log_end_offset, snapshot
            );
            return FetchLogResultForBucket::Diverged {
                leader_end_offset_snapshot: snapshot,
            };
        }

        self.follower_progress.insert(
            follower_id,
            FollowerProgress {
                log_end_offset: fetch_offset,
                last_fetch_time: Instant::now(),
            },
        );
        if let Err(e) = self.maybe_increment_leader_high_watermark() {
            return FetchLogResultForBucket::Error(e.to_api_error());
        }

        match self.log.read(fetch_offset, max_bytes) {
            Ok(records) if records.is_empty() => FetchLogResultForBucket::Empty {
                high_watermark: self.log.high_watermark(),
            },
            Ok(records) => FetchLogResultForBucket::Records {
                records,
                high_watermark: self.log.high_watermark(),
            },
            Err(e) => FetchLogResultForBucket::Error(e.to_api_error()),
        }
    }

    /// Re-cache the leader end offset snapshot from the current log end.
    pub fn update_leader_end_offset_snapshot(&self) {
        let snapshot = self.log.local_log_end_offset();
        self.leader_end_offset_snapshot
            .store(snapshot, Ordering::Release);
        debug!(
            "Leader end offset snapshot of {} set to {}",
            self.table_bucket, snapshot
        );
    }

    pub fn leader_end_offset_snapshot(&self) -> Offset {
        self.leader_end_offset_snapshot.load(Ordering::Acquire)
    }

    /// Stop serving the bucket after a local storage failure.
    pub fn mark_offline(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.write();
        if state.offline_reason.is_none() {
            warn!("Replica {} is now offline: {}", self.table_bucket, reason);
            state.offline_reason = Some(reason);
        }
    }

    pub fn is_offline(&self) -> bool {
        self.state.read().offline_reason.is_some()
    }

    pub fn offline_reason(&self) -> Option<String> {
        self.state.read().offline_reason.clone()
    }

    pub fn table_bucket(&self) -> TableBucket {
        self.table_bucket
    }

    pub fn table_path(&self) -> &TablePath {
        &self.table_path
    }

    pub fn local_server_id(&self) -> ServerId {
        self.local_server_id
    }

    pub fn role(&self) -> ReplicaRole {
        self.state.read().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == ReplicaRole::Leader
    }

    pub fn leader_id(&self) -> Option<ServerId> {
        self.state.read().leader_id
    }

    pub fn leader_epoch(&self) -> i32 {
        self.state.read().leader_epoch
    }

    pub fn bucket_epoch(&self) -> i32 {
        self.state.read().bucket_epoch
    }

    pub fn isr(&self) -> Vec<ServerId> {
        self.state.read().isr.iter().copied().collect()
    }

    pub fn replicas(&self) -> Vec<ServerId> {
        self.state.read().replicas.clone()
    }

    /// Last fetch offset a follower reported; leader only.
    pub fn follower_log_end_offset(&self, follower_id: ServerId) -> Option<Offset> {
        self.follower_progress
            .get(&follower_id)
            .map(|p| p.log_end_offset)
    }

    /// Time since a follower last fetched; leader only.
    pub fn follower_last_fetch_elapsed(&self, follower_id: ServerId) -> Option<std::time::Duration> {
        self.follower_progress
            .get(&follower_id)
            .map(|p| p.last_fetch_time.elapsed())
    }

    pub fn local_log_end_offset(&self) -> Offset {
        self.log.local_log_end_offset()
    }

    pub fn log_high_watermark(&self) -> Offset {
        self.log.high_watermark()
    }

    pub fn offset_snapshot(&self) -> LogOffsetSnapshot {
        self.log.offset_snapshot()
    }

    pub fn log(&self) -> &Arc<dyn LogStorage> {
        &self.log
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Replica")
            .field("table_bucket", &self.table_bucket)
            .field("local_server_id", &self.local_server_id)
            .field("role", &state.role)
            .field("leader_id", &state.leader_id)
            .field("leader_epoch", &state.leader_epoch)
            .field("offsets", &self.log.offset_snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::log::MemoryLog;
    use tidewater_common::{ErrorCode, LeaderAndIsr, LogRecord, LogRecordBatch};

    const LEADER: ServerId = 1;
    const FOLLOWER: ServerId = 2;

    fn bucket() -> TableBucket {
        TableBucket::new(150001, 0)
    }

    fn replica(server_id: ServerId) -> Replica {
        Replica::new(
            TablePath::new("test_db", "test_table"),
            bucket(),
            server_id,
            Arc::new(MemoryLog::new(bucket(), &LogConfig::default())),
        )
    }

    fn notify(leader_and_isr: LeaderAndIsr) -> NotifyLeaderAndIsrData {
        NotifyLeaderAndIsrData::new(
            TablePath::new("test_db", "test_table"),
            bucket(),
            vec![LEADER, FOLLOWER],
            leader_and_isr,
        )
    }

    fn batch(writer_id: i64, sequence: i32) -> MemoryLogRecords {
        let records = (0..10)
            .map(|i| LogRecord::new(i, None, format!("v{}", i)))
            .collect();
        MemoryLogRecords::single(LogRecordBatch::new(writer_id, sequence, records))
    }

    #[test]
    fn test_make_leader_caches_end_offset_snapshot() {
        let replica = replica(LEADER);
        replica
            .make_follower(&notify(LeaderAndIsr::initial(FOLLOWER, vec![LEADER, FOLLOWER])))
            .unwrap();
        let chunk = batch(100, 0).into_batches().remove(0);
        replica
            .append_records_to_follower(&MemoryLogRecords::single(chunk))
            .unwrap();

        let next = LeaderAndIsr::initial(FOLLOWER, vec![LEADER, FOLLOWER])
            .next_leader(LEADER, vec![LEADER, FOLLOWER]);
        assert_eq!(replica.make_leader(&notify(next)).unwrap(), EpochCheck::NewLeadership);
        assert!(replica.is_leader());
        assert_eq!(replica.leader_end_offset_snapshot(), 10);
    }

    #[test]
    fn test_epoch_rules() {
        let replica = replica(FOLLOWER);
        let initial = LeaderAndIsr::initial(LEADER, vec![LEADER, FOLLOWER]);
        let next = initial.next_leader(LEADER, vec![LEADER, FOLLOWER]);

        assert_eq!(replica.make_follower(&notify(next.clone())).unwrap(), EpochCheck::NewLeadership);
        assert_eq!(replica.make_follower(&notify(next.clone())).unwrap(), EpochCheck::Replay);
        assert!(matches!(
            replica.make_follower(&notify(initial)),
            Err(ReplicaError::FencedLeaderEpoch { request_epoch: 0, current_epoch: 1, .. })
        ));

        let mut shrunk = next;
        shrunk.isr = vec![LEADER];
        shrunk.bucket_epoch += 1;
        assert_eq!(replica.make_follower(&notify(shrunk)).unwrap(), EpochCheck::IsrChange);
        assert_eq!(replica.isr(), vec![LEADER]);
        assert_eq!(replica.leader_id(), Some(LEADER));
    }

    #[test]
    fn test_leader_high_watermark_follows_isr() {
        let replica = replica(LEADER);
        replica
            .make_leader(&notify(LeaderAndIsr::initial(LEADER, vec![LEADER, FOLLOWER])))
            .unwrap();

        replica.append_records_to_leader(&batch(100, 0)).unwrap();
        // follower has not fetched yet
        assert_eq!(replica.log_high_watermark(), 0);

        let first = replica.fetch_records_as_leader(FOLLOWER, 0, 0, usize::MAX);
        assert!(first.has_records());
        assert_eq!(replica.log_high_watermark(), 0);

        let second = replica.fetch_records_as_leader(FOLLOWER, 10, 0, usize::MAX);
        assert_eq!(second, FetchLogResultForBucket::Empty { high_watermark: 10 });
        assert_eq!(replica.follower_log_end_offset(FOLLOWER), Some(10));
    }

    #[test]
    fn test_single_member_isr_commits_on_append() {
        let replica = replica(LEADER);
        replica
            .make_leader(&notify(LeaderAndIsr::initial(LEADER, vec![LEADER])))
            .unwrap();
        replica.append_records_to_leader(&batch(100, 0)).unwrap();
        assert_eq!(replica.log_high_watermark(), 10);
    }

    #[test]
    fn test_fetch_with_stale_epoch_is_fenced() {
        let replica = replica(LEADER);
        let next = LeaderAndIsr::initial(FOLLOWER, vec![LEADER, FOLLOWER])
            .next_leader(LEADER, vec![LEADER, FOLLOWER]);
        replica.make_leader(&notify(next)).unwrap();

        assert_eq!(
            replica.fetch_records_as_leader(FOLLOWER, 0, 0, 1024),
            FetchLogResultForBucket::FencedLeaderEpoch {
                current_leader_epoch: 1
            }
        );
        assert_eq!(replica.follower_log_end_offset(FOLLOWER), None);
    }

    #[test]
    fn test_fetch_beyond_end_offset_diverges() {
        let replica = replica(LEADER);
        replica
            .make_leader(&notify(LeaderAndIsr::initial(LEADER, vec![LEADER, FOLLOWER])))
            .unwrap();
        replica.append_records_to_leader(&batch(100, 0)).unwrap();

        assert_eq!(
            replica.fetch_records_as_leader(FOLLOWER, 20, 0, 1024),
            FetchLogResultForBucket::Diverged {
                leader_end_offset_snapshot: 0
            }
        );
        replica.update_leader_end_offset_snapshot();
        assert_eq!(replica.leader_end_offset_snapshot(), 10);
    }

    #[test]
    fn test_follower_cannot_serve_fetches() {
        let replica = replica(FOLLOWER);
        replica
            .make_follower(&notify(LeaderAndIsr::initial(LEADER, vec![LEADER, FOLLOWER])))
            .unwrap();

        match replica.fetch_records_as_leader(3, 0, 0, 1024) {
            FetchLogResultForBucket::Error(e) => assert_eq!(e.code, ErrorCode::NotLeaderOrFollower),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(replica.append_records_to_leader(&batch(1, 0)).is_err());
    }

    #[test]
    fn test_offline_replica_rejects_everything() {
        let replica = replica(FOLLOWER);
        replica.mark_offline("disk failure");

        assert!(replica.is_offline());
        assert!(matches!(
            replica.make_follower(&notify(LeaderAndIsr::initial(LEADER, vec![LEADER]))),
            Err(ReplicaError::ReplicaOffline { .. })
        ));
        assert!(replica.append_records_to_follower(&batch(1, 0)).is_err());
    }
}
