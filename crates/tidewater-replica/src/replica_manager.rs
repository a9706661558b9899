//! Replica Manager - hosts every bucket replica of one tablet server
//!
//! The replica manager is the entry point for leadership notifications from
//! the coordinator. For each notified bucket it creates the replica on first
//! sight, applies the leader or follower transition, and keeps the fetcher
//! manager in step: leaders stop fetching, followers start fetching from their
//! local log end offset at the new leader epoch.
//!
//! It also serves the leader side of replication: local appends, follower
//! fetches (held until data arrives or the fetch's max wait elapses) and the
//! leader end offset snapshot used for truncation.

use crate::config::ReplicaConfig;
use crate::endpoint::{FetchLogRequest, FetchLogResponse, FetchLogResultForBucket, LeaderEndpointFactory};
use crate::error::{ReplicaError, Result};
use crate::events::{EventSender, ReplicaEvent};
use crate::fetcher::{FetcherStats, InitialFetchStatus, ReplicaFetcherManager};
use crate::log::LogFactory;
use crate::replica::{EpochCheck, Replica, ReplicaRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidewater_common::leader_and_isr::INITIAL_COORDINATOR_EPOCH;
use tidewater_common::{
    ApiError, MemoryLogRecords, NotifyLeaderAndIsrData, Offset, ServerId, TableBucket,
};
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Outcome of a leadership notification for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyLeaderAndIsrResultForBucket {
    pub table_bucket: TableBucket,
    pub error: Option<ApiError>,
}

impl NotifyLeaderAndIsrResultForBucket {
    fn ok(table_bucket: TableBucket) -> Self {
        Self {
            table_bucket,
            error: None,
        }
    }

    fn failed(table_bucket: TableBucket, error: &ReplicaError) -> Self {
        Self {
            table_bucket,
            error: Some(error.to_api_error()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a leader append for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceLogResultForBucket {
    pub table_bucket: TableBucket,
    /// First offset of the appended records
    pub base_offset: Offset,
    /// Offset right after the appended records
    pub end_offset: Offset,
    pub error: Option<ApiError>,
}

/// Outcome of stopping one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReplicaResultForBucket {
    pub table_bucket: TableBucket,
    pub error: Option<ApiError>,
}

/// A follower transition, or a follower missing its fetcher, waiting for a
/// fetcher assignment
struct PendingFollower {
    replica: Arc<Replica>,
    data: NotifyLeaderAndIsrData,
}

/// Manages all bucket replicas on this server
pub struct ReplicaManager {
    /// Server ID of this tablet server
    server_id: ServerId,

    config: ReplicaConfig,

    registry: ReplicaRegistry,

    /// Creates the local log of a newly hosted bucket
    log_factory: LogFactory,

    fetcher_manager: ReplicaFetcherManager,

    /// Highest coordinator epoch seen
    coordinator_epoch: AtomicI32,

    /// Serializes leadership transitions
    state_change_lock: Mutex<()>,

    /// Woken on every leader append or high watermark advance; delayed
    /// fetches wait on it
    append_notify: Arc<Notify>,

    events: EventSender,
}

impl ReplicaManager {
    /// Create a replica manager without an event listener
    pub fn new(
        server_id: ServerId,
        config: ReplicaConfig,
        log_factory: LogFactory,
        endpoint_factory: Arc<dyn LeaderEndpointFactory>,
    ) -> Result<Self> {
        Self::with_events(
            server_id,
            config,
            log_factory,
            endpoint_factory,
            EventSender::disabled(),
        )
    }

    /// Create a replica manager that publishes [`ReplicaEvent`]s
    ///
    /// # Arguments
    /// * `server_id` - This tablet server's ID
    /// * `config` - Replica and fetcher configuration
    /// * `log_factory` - Creates the local log for each new bucket
    /// * `endpoint_factory` - Connects fetcher sessions to leaders
    /// * `events` - Sink for replica events
    pub fn with_events(
        server_id: ServerId,
        config: ReplicaConfig,
        log_factory: LogFactory,
        endpoint_factory: Arc<dyn LeaderEndpointFactory>,
        events: EventSender,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Creating ReplicaManager for server {} with config: {:?}",
            server_id, config
        );

        let registry = ReplicaRegistry::new();
        let fetcher_manager = ReplicaFetcherManager::new(
            server_id,
            config.fetcher.clone(),
            registry.clone(),
            endpoint_factory,
            events.clone(),
        );

        Ok(Self {
            server_id,
            config,
            registry,
            log_factory,
            fetcher_manager,
            coordinator_epoch: AtomicI32::new(INITIAL_COORDINATOR_EPOCH),
            state_change_lock: Mutex::new(()),
            append_notify: Arc::new(Notify::new()),
            events,
        })
    }

    /// Apply a leadership notification.
    ///
    /// Returns one result per notified bucket. Replaying a notification that
    /// was already applied succeeds without changing anything.
    pub async fn become_leader_or_follower(
        &self,
        coordinator_epoch: i32,
        notifications: Vec<NotifyLeaderAndIsrData>,
    ) -> Vec<NotifyLeaderAndIsrResultForBucket> {
        let _guard = self.state_change_lock.lock().await;

        let current_epoch = self.coordinator_epoch.load(Ordering::Acquire);
        if coordinator_epoch < current_epoch {
            warn!(
                "Server {} ignoring notification for {} buckets from stale coordinator epoch {} (current {})",
                self.server_id,
                notifications.len(),
                coordinator_epoch,
                current_epoch
            );
            let error = ReplicaError::InvalidCoordinatorEpoch {
                request_epoch: coordinator_epoch,
                current_epoch,
            };
            return notifications
                .iter()
                .map(|d| NotifyLeaderAndIsrResultForBucket::failed(d.table_bucket, &error))
                .collect();
        }
        self.coordinator_epoch
            .store(coordinator_epoch, Ordering::Release);

        let mut results = Vec::with_capacity(notifications.len());
        let mut new_leaders = Vec::new();
        let mut new_followers = Vec::new();

        for data in notifications {
            let bucket = data.table_bucket;
            match self.classify(&data) {
                Ok((replica, EpochCheck::NewLeadership)) => {
                    if data.leader() == self.server_id {
                        new_leaders.push((replica, data));
                    } else {
                        new_followers.push(PendingFollower { replica, data });
                    }
                }
                Ok((replica, _))
                    if data.leader() != self.server_id
                        && self.fetcher_manager.fetcher_for_bucket(&bucket).is_none() =>
                {
                    info!(
                        "Server {} has no fetcher for {} at leader epoch {}, starting one",
                        self.server_id,
                        bucket,
                        data.leader_epoch()
                    );
                    new_followers.push(PendingFollower { replica, data });
                }
                Ok((replica, _)) => {
                    let applied = if data.leader() == self.server_id {
                        replica.make_leader(&data)
                    } else {
                        replica.make_follower(&data)
                    };
                    results.push(match applied {
                        Ok(_) => NotifyLeaderAndIsrResultForBucket::ok(bucket),
                        Err(e) => NotifyLeaderAndIsrResultForBucket::failed(bucket, &e),
                    });
                }
                Err(e) => {
                    warn!(
                        "Server {} rejected notification for {}: {}",
                        self.server_id, bucket, e
                    );
                    results.push(NotifyLeaderAndIsrResultForBucket::failed(bucket, &e));
                }
            }
        }

        // Stop fetching every bucket that changes leadership before any role
        // change, so no fetched data lands after the transition.
        let moving: Vec<TableBucket> = new_leaders
            .iter()
            .map(|(_, d)| d.table_bucket)
            .chain(new_followers.iter().map(|p| p.data.table_bucket))
            .collect();
        self.fetcher_manager.remove_fetcher_for_buckets(&moving).await;

        for (replica, data) in new_leaders {
            results.push(self.make_leader(&replica, &data));
        }
        results.extend(self.make_followers(new_followers));
        self.fetcher_manager.shutdown_idle_fetcher_threads().await;

        results
    }

    fn classify(&self, data: &NotifyLeaderAndIsrData) -> Result<(Arc<Replica>, EpochCheck)> {
        if !data.replicas.contains(&self.server_id) {
            return Err(ReplicaError::ReplicaNotAssigned {
                bucket: data.table_bucket,
                server_id: self.server_id,
            });
        }
        let replica = self.get_or_create_replica(data)?;
        let check = replica.epoch_check(data)?;
        Ok((replica, check))
    }

    fn get_or_create_replica(&self, data: &NotifyLeaderAndIsrData) -> Result<Arc<Replica>> {
        self.registry.get_or_try_insert_with(data.table_bucket, || {
            let log = (self.log_factory)(&data.table_bucket)?;
            info!(
                "Server {} hosting new replica {} of {}",
                self.server_id, data.table_bucket, data.table_path
            );
            Ok(Replica::new(
                data.table_path.clone(),
                data.table_bucket,
                self.server_id,
                log,
            )
            .with_append_notify(Arc::clone(&self.append_notify)))
        })
    }

    fn make_leader(
        &self,
        replica: &Arc<Replica>,
        data: &NotifyLeaderAndIsrData,
    ) -> NotifyLeaderAndIsrResultForBucket {
        match replica.make_leader(data) {
            Ok(check) => {
                if check == EpochCheck::NewLeadership {
                    self.events.send(ReplicaEvent::BecameLeader {
                        bucket: data.table_bucket,
                        leader_epoch: data.leader_epoch(),
                        leader_end_offset_snapshot: replica.leader_end_offset_snapshot(),
                    });
                }
                NotifyLeaderAndIsrResultForBucket::ok(data.table_bucket)
            }
            Err(e) => NotifyLeaderAndIsrResultForBucket::failed(data.table_bucket, &e),
        }
    }

    fn make_followers(
        &self,
        pending: Vec<PendingFollower>,
    ) -> Vec<NotifyLeaderAndIsrResultForBucket> {
        let mut results = Vec::with_capacity(pending.len());
        let mut by_leader: HashMap<ServerId, HashMap<TableBucket, InitialFetchStatus>> =
            HashMap::new();

        for PendingFollower { replica, data } in pending {
            let bucket = data.table_bucket;
            match replica.make_follower(&data) {
                Ok(check) => {
                    let status = InitialFetchStatus::new(
                        bucket.table_id,
                        data.table_path.clone(),
                        data.leader(),
                        replica.local_log_end_offset(),
                    )
                    .with_leader_epoch(data.leader_epoch());
                    by_leader
                        .entry(data.leader())
                        .or_default()
                        .insert(bucket, status);
                    if check == EpochCheck::NewLeadership {
                        self.events.send(ReplicaEvent::BecameFollower {
                            bucket,
                            leader_id: data.leader(),
                            leader_epoch: data.leader_epoch(),
                        });
                    }
                }
                Err(e) => results.push(NotifyLeaderAndIsrResultForBucket::failed(bucket, &e)),
            }
        }

        for (leader_id, buckets) in by_leader {
            let assigned: Vec<TableBucket> = buckets.keys().copied().collect();
            match self.fetcher_manager.add_fetcher_for_buckets(buckets) {
                Ok(()) => results.extend(
                    assigned
                        .into_iter()
                        .map(NotifyLeaderAndIsrResultForBucket::ok),
                ),
                Err(e) => {
                    warn!(
                        "Server {} could not start fetching from leader {}: {}",
                        self.server_id, leader_id, e
                    );
                    results.extend(
                        assigned
                            .into_iter()
                            .map(|b| NotifyLeaderAndIsrResultForBucket::failed(b, &e)),
                    );
                }
            }
        }
        results
    }

    /// Append produced records to the buckets this server leads.
    pub fn append_records_to_log(
        &self,
        entries: HashMap<TableBucket, MemoryLogRecords>,
    ) -> Vec<ProduceLogResultForBucket> {
        let mut results: Vec<_> = entries
            .into_iter()
            .map(|(bucket, records)| {
                let appended = self
                    .registry
                    .get_or_error(&bucket)
                    .and_then(|replica| replica.append_records_to_leader(&records));
                match appended {
                    Ok(info) => ProduceLogResultForBucket {
                        table_bucket: bucket,
                        base_offset: info.first_offset,
                        end_offset: info.next_offset(),
                        error: None,
                    },
                    Err(e) => {
                        debug!("Append to {} on server {} failed: {}", bucket, self.server_id, e);
                        ProduceLogResultForBucket {
                            table_bucket: bucket,
                            base_offset: -1,
                            end_offset: -1,
                            error: Some(e.to_api_error()),
                        }
                    }
                }
            })
            .collect();
        results.sort_by_key(|r| r.table_bucket);
        results
    }

    /// Serve a follower fetch.
    ///
    /// Answers as soon as any bucket has records, needs the follower's
    /// attention, or has a high watermark that moved since the request
    /// arrived. Otherwise waits for an append or a high watermark advance up
    /// to the request's max wait.
    pub async fn fetch_log_records(&self, request: FetchLogRequest) -> FetchLogResponse {
        let deadline = Instant::now() + Duration::from_millis(request.max_wait_ms);
        let arrival_hw: HashMap<TableBucket, Offset> = request
            .buckets
            .keys()
            .filter_map(|b| self.registry.get(b).map(|r| (*b, r.log_high_watermark())))
            .collect();
        loop {
            let notified = self.append_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let response = self.read_fetch(&request);
            let ready = response.buckets.iter().any(|(bucket, result)| match result {
                FetchLogResultForBucket::Empty { high_watermark } => {
                    arrival_hw.get(bucket) != Some(high_watermark)
                }
                _ => true,
            });
            if ready || Instant::now() >= deadline {
                return response;
            }

            tokio::select! {
                _ = notified => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }

    fn read_fetch(&self, request: &FetchLogRequest) -> FetchLogResponse {
        let mut response = FetchLogResponse::default();
        let mut remaining = request.max_bytes;

        for (bucket, data) in &request.buckets {
            if remaining == 0 {
                break;
            }
            let result = match self.registry.get(bucket) {
                Some(replica) => replica.fetch_records_as_leader(
                    request.follower_server_id,
                    data.fetch_offset,
                    data.leader_epoch,
                    data.max_bytes.min(remaining),
                ),
                None => FetchLogResultForBucket::Error(
                    ReplicaError::UnknownTableOrBucket(*bucket).to_api_error(),
                ),
            };
            if let FetchLogResultForBucket::Records { records, .. } = &result {
                remaining = remaining.saturating_sub(records.size_in_bytes());
            }
            response.buckets.insert(*bucket, result);
        }
        response
    }

    /// Leader end offset snapshot of a bucket this server leads.
    pub fn leader_end_offset_snapshot(&self, table_bucket: &TableBucket) -> Result<Offset> {
        let replica = self.registry.get_or_error(table_bucket)?;
        if !replica.is_leader() {
            return Err(ReplicaError::NotLeaderOrFollower(format!(
                "server {} is not the leader of {}",
                self.server_id, table_bucket
            )));
        }
        Ok(replica.leader_end_offset_snapshot())
    }

    /// Stop hosting these buckets: stop their fetchers and drop the replicas.
    pub async fn stop_replicas(&self, buckets: &[TableBucket]) -> Vec<StopReplicaResultForBucket> {
        let _guard = self.state_change_lock.lock().await;
        self.fetcher_manager.remove_fetcher_for_buckets(buckets).await;

        buckets
            .iter()
            .map(|bucket| match self.registry.remove(bucket) {
                Some(_) => {
                    info!("Server {} stopped replica {}", self.server_id, bucket);
                    StopReplicaResultForBucket {
                        table_bucket: *bucket,
                        error: None,
                    }
                }
                None => StopReplicaResultForBucket {
                    table_bucket: *bucket,
                    error: Some(ReplicaError::UnknownTableOrBucket(*bucket).to_api_error()),
                },
            })
            .collect()
    }

    /// Stop all fetching. Replicas stay registered.
    pub async fn shutdown(&self) {
        info!("Shutting down ReplicaManager for server {}", self.server_id);
        self.fetcher_manager.shutdown().await;
        debug!("ReplicaManager for server {} shut down", self.server_id);
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn coordinator_epoch(&self) -> i32 {
        self.coordinator_epoch.load(Ordering::Acquire)
    }

    pub fn replica(&self, table_bucket: &TableBucket) -> Option<Arc<Replica>> {
        self.registry.get(table_bucket)
    }

    pub fn get_replica_or_error(&self, table_bucket: &TableBucket) -> Result<Arc<Replica>> {
        self.registry.get_or_error(table_bucket)
    }

    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.registry.all()
    }

    /// Shared handle to the hosted replicas
    pub fn registry(&self) -> ReplicaRegistry {
        self.registry.clone()
    }

    pub fn fetcher_manager(&self) -> &ReplicaFetcherManager {
        &self.fetcher_manager
    }

    pub fn fetcher_stats(&self) -> FetcherStats {
        self.fetcher_manager.stats()
    }
}

impl std::fmt::Debug for ReplicaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaManager")
            .field("server_id", &self.server_id)
            .field("replicas", &self.registry.len())
            .field("coordinator_epoch", &self.coordinator_epoch())
            .finish()
    }
}
