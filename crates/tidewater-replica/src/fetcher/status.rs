use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tidewater_common::leader_and_isr::INITIAL_LEADER_EPOCH;
use tidewater_common::{Offset, ServerId, TablePath};

/// Where a follower starts fetching a newly assigned bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialFetchStatus {
    pub table_id: i64,
    pub table_path: TablePath,
    pub leader_id: ServerId,
    pub leader_epoch: i32,
    pub fetch_offset: Offset,
}

impl InitialFetchStatus {
    pub fn new(table_id: i64, table_path: TablePath, leader_id: ServerId, fetch_offset: Offset) -> Self {
        Self {
            table_id,
            table_path,
            leader_id,
            leader_epoch: INITIAL_LEADER_EPOCH,
            fetch_offset,
        }
    }

    pub fn with_leader_epoch(mut self, leader_epoch: i32) -> Self {
        self.leader_epoch = leader_epoch;
        self
    }
}

/// Fetch position of one bucket inside a session. Only the owning session
/// changes `fetch_offset`.
#[derive(Debug, Clone)]
pub(crate) struct BucketFetchStatus {
    pub table_path: TablePath,
    pub leader_id: ServerId,
    pub leader_epoch: i32,
    pub fetch_offset: Offset,
    /// Skip the bucket until this instant
    pub delayed_until: Option<Instant>,
}

impl BucketFetchStatus {
    pub fn from_initial(initial: InitialFetchStatus) -> Self {
        Self {
            table_path: initial.table_path,
            leader_id: initial.leader_id,
            leader_epoch: initial.leader_epoch,
            fetch_offset: initial.fetch_offset,
            delayed_until: None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.delayed_until.map_or(true, |until| until <= now)
    }

    /// Whether a response to a request sent with these values still applies
    pub fn matches(&self, fetch_offset: Offset, leader_epoch: i32) -> bool {
        self.fetch_offset == fetch_offset && self.leader_epoch == leader_epoch
    }
}

/// Counters kept by each fetcher session
#[derive(Debug, Default)]
pub(crate) struct FetcherMetrics {
    pub fetch_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub records_appended: AtomicU64,
    pub truncations: AtomicU64,
    pub fenced_responses: AtomicU64,
    pub bucket_errors: AtomicU64,
}

impl FetcherMetrics {
    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self, bucket_count: usize) -> FetcherStats {
        FetcherStats {
            bucket_count,
            fetch_requests: self.fetch_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            records_appended: self.records_appended.load(Ordering::Relaxed),
            truncations: self.truncations.load(Ordering::Relaxed),
            fenced_responses: self.fenced_responses.load(Ordering::Relaxed),
            bucket_errors: self.bucket_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time fetcher statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherStats {
    pub bucket_count: usize,
    pub fetch_requests: u64,
    pub failed_requests: u64,
    pub records_appended: u64,
    pub truncations: u64,
    pub fenced_responses: u64,
    pub bucket_errors: u64,
}

impl std::ops::Add for FetcherStats {
    type Output = FetcherStats;

    fn add(self, other: FetcherStats) -> FetcherStats {
        FetcherStats {
            bucket_count: self.bucket_count + other.bucket_count,
            fetch_requests: self.fetch_requests + other.fetch_requests,
            failed_requests: self.failed_requests + other.failed_requests,
            records_appended: self.records_appended + other.records_appended,
            truncations: self.truncations + other.truncations,
            fenced_responses: self.fenced_responses + other.fenced_responses,
            bucket_errors: self.bucket_errors + other.bucket_errors,
        }
    }
}
