//! Follower fetch session for one leader.
//!
//! A session multiplexes every bucket this server follows on one leader into
//! a single fetch request per cycle. Per cycle it:
//!
//! 1. Snapshots the fetch position of every bucket that is not delayed
//! 2. Sends one request through the [`LeaderEndpoint`] with a bounded wait
//! 3. Applies each bucket result to the local replica
//!
//! Transport failures back off exponentially and retry the same positions.
//! Results for buckets that were removed, or whose position or epoch changed
//! while the request was in flight, are dropped on arrival.

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::status::{BucketFetchStatus, FetcherMetrics, FetcherStats, InitialFetchStatus};
use crate::config::FetcherConfig;
use crate::endpoint::{FetchBucketData, FetchLogRequest, FetchLogResponse, FetchLogResultForBucket, LeaderEndpoint};
use crate::error::ReplicaError;
use crate::events::{EventSender, ReplicaEvent};
use crate::replica::{Replica, ReplicaRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tidewater_common::{Offset, ServerId, TableBucket};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Bucket that needs the leader's end offset snapshot before it can continue
struct PendingTruncation {
    table_bucket: TableBucket,
    fetch_offset: Offset,
    leader_epoch: i32,
}

/// Fetch session pulling buckets from a single leader.
pub struct ReplicaFetcherThread {
    name: String,
    local_server_id: ServerId,
    leader: Arc<dyn LeaderEndpoint>,
    registry: ReplicaRegistry,
    config: FetcherConfig,
    fetch_status: Mutex<HashMap<TableBucket, BucketFetchStatus>>,
    wakeup: Notify,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: FetcherMetrics,
    events: EventSender,
}

impl ReplicaFetcherThread {
    /// Create a session. Nothing is fetched until [`start`](Self::start).
    pub fn new(
        name: impl Into<String>,
        local_server_id: ServerId,
        leader: Arc<dyn LeaderEndpoint>,
        registry: ReplicaRegistry,
        config: FetcherConfig,
    ) -> Self {
        Self {
            name: name.into(),
            local_server_id,
            leader,
            registry,
            config,
            fetch_status: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            metrics: FetcherMetrics::default(),
            events: EventSender::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Start following these buckets, replacing any existing position.
    pub fn add_buckets(&self, buckets: HashMap<TableBucket, InitialFetchStatus>) {
        if buckets.is_empty() {
            return;
        }
        {
            let mut statuses = self.fetch_status.lock();
            for (bucket, initial) in buckets {
                info!(
                    "Fetcher {} adding {} ({}) from leader {} at offset {} epoch {}",
                    self.name,
                    bucket,
                    initial.table_path,
                    initial.leader_id,
                    initial.fetch_offset,
                    initial.leader_epoch
                );
                statuses.insert(bucket, BucketFetchStatus::from_initial(initial));
            }
        }
        self.wakeup.notify_one();
    }

    /// Stop following these buckets. Returns how many were present.
    ///
    /// Once this returns, no fetched data is applied to them by this session.
    pub fn remove_buckets<'a>(&self, buckets: impl IntoIterator<Item = &'a TableBucket>) -> usize {
        let mut statuses = self.fetch_status.lock();
        let mut removed = 0;
        for bucket in buckets {
            if statuses.remove(bucket).is_some() {
                debug!("Fetcher {} removed {}", self.name, bucket);
                removed += 1;
            }
        }
        removed
    }

    /// Spawn the fetch loop. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Stop the loop and wait for it to exit. No fetch is issued afterwards.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Fetcher {} task failed: {}", self.name, e);
            }
        }
        debug!("Fetcher {} shut down", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn leader_id(&self) -> ServerId {
        self.leader.leader_server_id()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn bucket_count(&self) -> usize {
        self.fetch_status.lock().len()
    }

    pub fn contains_bucket(&self, table_bucket: &TableBucket) -> bool {
        self.fetch_status.lock().contains_key(table_bucket)
    }

    pub fn buckets(&self) -> Vec<TableBucket> {
        self.fetch_status.lock().keys().copied().collect()
    }

    /// Next offset this session will fetch for the bucket
    pub fn fetch_offset(&self, table_bucket: &TableBucket) -> Option<Offset> {
        self.fetch_status
            .lock()
            .get(table_bucket)
            .map(|s| s.fetch_offset)
    }

    pub fn stats(&self) -> FetcherStats {
        self.metrics.snapshot(self.bucket_count())
    }

    async fn run(self: Arc<Self>) {
        info!(
            "Fetcher {} started for leader {} on server {}",
            self.name,
            self.leader.leader_server_id(),
            self.local_server_id
        );
        let mut backoff = ExponentialBackoff::new(BackoffConfig::from(&self.config));

        while !self.shutdown.is_cancelled() {
            let (request, next_ready) = self.build_fetch_request();
            let Some(request) = request else {
                let idle = next_ready
                    .map(|t| t.saturating_duration_since(Instant::now()))
                    .unwrap_or_else(|| self.config.fetch_max_wait());
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                    _ = sleep(idle) => {}
                }
                continue;
            };

            trace!(
                "Fetcher {} sending fetch for {} buckets",
                self.name,
                request.buckets.len()
            );
            FetcherMetrics::incr(&self.metrics.fetch_requests, 1);
            let started = Instant::now();
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = timeout(self.config.request_timeout(), self.leader.fetch_log(request.clone())) => r,
            };

            let response = match result {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    self.on_fetch_failure(&mut backoff, e).await;
                    continue;
                }
                Err(_) => {
                    let e = ReplicaError::Timeout(self.config.request_timeout());
                    self.on_fetch_failure(&mut backoff, e).await;
                    continue;
                }
            };
            backoff.reset();

            let had_records = response.has_records();
            let pending = self.process_fetch_response(&request, response);
            for truncation in pending {
                self.truncate_on_duplicate(truncation).await;
            }

            if !had_records {
                let remaining = self
                    .config
                    .fetch_min_interval()
                    .saturating_sub(started.elapsed());
                if !remaining.is_zero() {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(remaining) => {}
                    }
                }
            }
        }

        info!("Fetcher {} stopped", self.name);
    }

    async fn on_fetch_failure(&self, backoff: &mut ExponentialBackoff, e: ReplicaError) {
        FetcherMetrics::incr(&self.metrics.failed_requests, 1);
        let delay = backoff.next_delay();
        warn!(
            "Fetcher {} failed to fetch from leader {} (attempt {}): {}, retrying in {:?}",
            self.name,
            self.leader.leader_server_id(),
            backoff.attempt(),
            e,
            delay
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }

    fn build_fetch_request(&self) -> (Option<FetchLogRequest>, Option<Instant>) {
        let now = Instant::now();
        let mut request = FetchLogRequest::new(
            self.local_server_id,
            self.config.fetch_max_bytes,
            self.config.fetch_max_wait_ms,
        );
        let mut next_ready: Option<Instant> = None;

        let mut statuses = self.fetch_status.lock();
        for (bucket, status) in statuses.iter_mut() {
            if status.is_ready(now) {
                status.delayed_until = None;
                request.add_bucket(
                    *bucket,
                    FetchBucketData {
                        table_path: status.table_path.clone(),
                        fetch_offset: status.fetch_offset,
                        leader_epoch: status.leader_epoch,
                        max_bytes: self.config.fetch_max_bytes_per_bucket,
                    },
                );
            } else if let Some(until) = status.delayed_until {
                next_ready = Some(next_ready.map_or(until, |n| n.min(until)));
            }
        }

        if request.is_empty() {
            (None, next_ready)
        } else {
            (Some(request), next_ready)
        }
    }

    /// Apply one response. Returns buckets that hit a duplicate batch and
    /// need the leader's snapshot, which is fetched without the status lock.
    fn process_fetch_response(
        &self,
        request: &FetchLogRequest,
        response: FetchLogResponse,
    ) -> Vec<PendingTruncation> {
        let mut pending = Vec::new();
        let mut statuses = self.fetch_status.lock();

        for (bucket, result) in response.buckets {
            let Some(requested) = request.buckets.get(&bucket) else {
                continue;
            };
            let Some(status) = statuses.get_mut(&bucket) else {
                trace!("Fetcher {} discarding response for removed {}", self.name, bucket);
                continue;
            };
            if !status.matches(requested.fetch_offset, requested.leader_epoch) {
                trace!(
                    "Fetcher {} discarding stale response for {} at offset {}",
                    self.name,
                    bucket,
                    requested.fetch_offset
                );
                continue;
            }
            let Some(replica) = self.registry.get(&bucket) else {
                warn!(
                    "Fetcher {} has no local replica for {}, removing it",
                    self.name, bucket
                );
                statuses.remove(&bucket);
                continue;
            };

            let outcome = self.handle_bucket_result(&bucket, status, &replica, result);
            match outcome {
                BucketOutcome::Continue => {}
                BucketOutcome::NeedsSnapshot => pending.push(PendingTruncation {
                    table_bucket: bucket,
                    fetch_offset: requested.fetch_offset,
                    leader_epoch: requested.leader_epoch,
                }),
                BucketOutcome::Offline(e) => {
                    statuses.remove(&bucket);
                    self.take_offline(&replica, &e);
                }
            }
        }
        pending
    }

    fn delay(&self, status: &mut BucketFetchStatus) {
        status.delayed_until = Some(Instant::now() + self.config.bucket_delay());
    }

    fn handle_bucket_result(
        &self,
        bucket: &TableBucket,
        status: &mut BucketFetchStatus,
        replica: &Replica,
        result: FetchLogResultForBucket,
    ) -> BucketOutcome {
        match result {
            FetchLogResultForBucket::Records {
                records,
                high_watermark,
            } if !records.is_empty() => match replica.apply_fetched_records(&records, high_watermark) {
                Ok(info) => {
                    status.fetch_offset = info.next_offset();
                    FetcherMetrics::incr(&self.metrics.records_appended, info.record_count as u64);
                    trace!(
                        "Fetcher {} appended {}..={} to {}, high watermark {}",
                        self.name,
                        info.first_offset,
                        info.last_offset,
                        bucket,
                        replica.log_high_watermark()
                    );
                    BucketOutcome::Continue
                }
                Err(e @ ReplicaError::DuplicateSequence { .. }) => {
                    warn!(
                        "Fetcher {} found a divergent tail on {} at offset {}: {}",
                        self.name, bucket, status.fetch_offset, e
                    );
                    BucketOutcome::NeedsSnapshot
                }
                Err(e @ ReplicaError::OffsetMismatch { .. }) => {
                    warn!("Fetcher {} resyncing {}: {}", self.name, bucket, e);
                    status.fetch_offset = replica.local_log_end_offset();
                    BucketOutcome::Continue
                }
                Err(e) if e.is_storage_failure() => BucketOutcome::Offline(e),
                Err(e) => {
                    warn!("Fetcher {} failed to append to {}: {}", self.name, bucket, e);
                    FetcherMetrics::incr(&self.metrics.bucket_errors, 1);
                    self.delay(status);
                    BucketOutcome::Continue
                }
            },
            FetchLogResultForBucket::Records { high_watermark, .. }
            | FetchLogResultForBucket::Empty { high_watermark } => {
                match replica.update_follower_high_watermark(high_watermark) {
                    Ok(_) => BucketOutcome::Continue,
                    Err(e) if e.is_storage_failure() => BucketOutcome::Offline(e),
                    Err(e) => {
                        warn!(
                            "Fetcher {} failed to update high watermark of {}: {}",
                            self.name, bucket, e
                        );
                        BucketOutcome::Continue
                    }
                }
            }
            FetchLogResultForBucket::FencedLeaderEpoch {
                current_leader_epoch,
            } => {
                warn!(
                    "Fetcher {} fenced on {}: fetched with epoch {}, leader is at {}; waiting for leadership refresh",
                    self.name, bucket, status.leader_epoch, current_leader_epoch
                );
                FetcherMetrics::incr(&self.metrics.fenced_responses, 1);
                self.delay(status);
                BucketOutcome::Continue
            }
            FetchLogResultForBucket::Diverged {
                leader_end_offset_snapshot,
            } => self.truncate(bucket, status, replica, leader_end_offset_snapshot),
            FetchLogResultForBucket::Error(api_error) => {
                debug!(
                    "Fetcher {} got error for {}: {}",
                    self.name, bucket, api_error
                );
                FetcherMetrics::incr(&self.metrics.bucket_errors, 1);
                self.delay(status);
                BucketOutcome::Continue
            }
        }
    }

    /// Cut the local tail back to the leader's snapshot and refetch from there.
    fn truncate(
        &self,
        bucket: &TableBucket,
        status: &mut BucketFetchStatus,
        replica: &Replica,
        leader_end_offset_snapshot: Offset,
    ) -> BucketOutcome {
        if leader_end_offset_snapshot < 0 {
            warn!(
                "Fetcher {} got no usable end offset snapshot for {}, retrying later",
                self.name, bucket
            );
            self.delay(status);
            return BucketOutcome::Continue;
        }

        let log_end_offset = replica.local_log_end_offset();
        let target = leader_end_offset_snapshot.min(log_end_offset);
        if target == log_end_offset {
            // Nothing to cut; an immediate refetch would hit the same conflict.
            warn!(
                "Fetcher {} cannot resolve conflict on {} at offset {}: leader end offset snapshot {} is not below log end offset {}",
                self.name, bucket, status.fetch_offset, leader_end_offset_snapshot, log_end_offset
            );
            FetcherMetrics::incr(&self.metrics.bucket_errors, 1);
            status.fetch_offset = log_end_offset;
            self.delay(status);
            return BucketOutcome::Continue;
        }
        warn!(
            "Fetcher {} truncating {} from {} to {} (leader end offset snapshot {})",
            self.name, bucket, log_end_offset, target, leader_end_offset_snapshot
        );
        if let Err(e) = replica.truncate_to(target) {
            if e.is_storage_failure() {
                return BucketOutcome::Offline(e);
            }
            warn!("Fetcher {} failed to truncate {}: {}", self.name, bucket, e);
            self.delay(status);
            return BucketOutcome::Continue;
        }

        status.fetch_offset = target;
        FetcherMetrics::incr(&self.metrics.truncations, 1);
        self.events.send(ReplicaEvent::Truncated {
            bucket: *bucket,
            from_offset: log_end_offset,
            to_offset: target,
        });
        BucketOutcome::Continue
    }

    async fn truncate_on_duplicate(&self, pending: PendingTruncation) {
        let bucket = pending.table_bucket;
        let snapshot = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            r = timeout(
                self.config.request_timeout(),
                self.leader.fetch_leader_end_offset_snapshot(&bucket),
            ) => r,
        };

        let mut statuses = self.fetch_status.lock();
        let Some(status) = statuses.get_mut(&bucket) else {
            return;
        };
        if !status.matches(pending.fetch_offset, pending.leader_epoch) {
            return;
        }

        let snapshot = match snapshot {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(
                    "Fetcher {} could not get end offset snapshot for {}: {}",
                    self.name, bucket, e
                );
                self.delay(status);
                return;
            }
            Err(_) => {
                warn!(
                    "Fetcher {} timed out getting end offset snapshot for {}",
                    self.name, bucket
                );
                self.delay(status);
                return;
            }
        };

        let Some(replica) = self.registry.get(&bucket) else {
            statuses.remove(&bucket);
            return;
        };
        if let BucketOutcome::Offline(e) = self.truncate(&bucket, status, &replica, snapshot) {
            statuses.remove(&bucket);
            self.take_offline(&replica, &e);
        }
    }

    fn take_offline(&self, replica: &Replica, e: &ReplicaError) {
        error!(
            "Fetcher {} stopping {} after storage failure: {}",
            self.name,
            replica.table_bucket(),
            e
        );
        replica.mark_offline(e.to_string());
        self.events.send(ReplicaEvent::ReplicaOffline {
            bucket: replica.table_bucket(),
            reason: e.to_string(),
        });
    }
}

enum BucketOutcome {
    Continue,
    NeedsSnapshot,
    Offline(ReplicaError),
}

impl std::fmt::Debug for ReplicaFetcherThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaFetcherThread")
            .field("name", &self.name)
            .field("leader", &self.leader.leader_server_id())
            .field("buckets", &self.bucket_count())
            .finish()
    }
}
