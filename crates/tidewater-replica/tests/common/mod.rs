//! Shared helpers for replication integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidewater_common::{
    LeaderAndIsr, LogRecord, LogRecordBatch, MemoryLogRecords, NotifyLeaderAndIsrData, Offset,
    ServerId, TableBucket, TablePath,
};
use tidewater_replica::config::{FetcherConfig, LogConfig, ReplicaConfig};
use tidewater_replica::endpoint::{
    FetchLogRequest, FetchLogResponse, LeaderEndpoint, LocalEndpointRegistry, TabletServerGateway,
};
use tidewater_replica::log::{memory_log_factory, LogAppendInfo, LogFactory, LogOffsetSnapshot};
use tidewater_replica::{
    EventSender, LogStorage, MemoryLog, Replica, ReplicaError, ReplicaManager, Result,
};
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

pub const LEADER: ServerId = 1;
pub const FOLLOWER: ServerId = 2;

/// Install a test subscriber once; honours RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn table_path() -> TablePath {
    TablePath::new("test_db", "test_table")
}

pub fn table_bucket() -> TableBucket {
    TableBucket::new(150001, 0)
}

/// Short waits and backoffs so failures show up quickly.
pub fn test_config() -> ReplicaConfig {
    ReplicaConfig {
        fetcher: FetcherConfig {
            fetch_max_wait_ms: 100,
            fetch_min_interval_ms: 1,
            request_timeout_ms: 2_000,
            backoff_initial_ms: 10,
            backoff_max_ms: 50,
            ..Default::default()
        },
        log: LogConfig::default(),
    }
}

pub fn records(n: usize) -> Vec<LogRecord> {
    (0..n)
        .map(|i| {
            LogRecord::new(
                i as i64,
                Some(Bytes::from(format!("key-{}", i))),
                format!("value-{}", i),
            )
        })
        .collect()
}

pub fn writer_batch(writer_id: i64, sequence: i32, n: usize) -> MemoryLogRecords {
    MemoryLogRecords::single(LogRecordBatch::new(writer_id, sequence, records(n)))
}

pub fn plain_batch(n: usize) -> MemoryLogRecords {
    MemoryLogRecords::single(LogRecordBatch::without_writer(records(n)))
}

pub fn notify_data(
    table_bucket: TableBucket,
    replicas: Vec<ServerId>,
    leader_and_isr: LeaderAndIsr,
) -> NotifyLeaderAndIsrData {
    NotifyLeaderAndIsrData::new(table_path(), table_bucket, replicas, leader_and_isr)
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(1)).await;
    }
}

/// A follower replica outside any replica manager, following `leader_and_isr`.
pub fn follower_replica(
    table_bucket: TableBucket,
    log: Arc<dyn LogStorage>,
    leader_and_isr: LeaderAndIsr,
) -> Arc<Replica> {
    let replica = Replica::new(table_path(), table_bucket, FOLLOWER, log);
    replica
        .make_follower(&notify_data(
            table_bucket,
            vec![LEADER, FOLLOWER],
            leader_and_isr,
        ))
        .unwrap();
    Arc::new(replica)
}

pub fn memory_log(table_bucket: TableBucket) -> Arc<dyn LogStorage> {
    Arc::new(MemoryLog::new(table_bucket, &LogConfig::default()))
}

/// Replica managers wired together in process.
pub struct TestCluster {
    pub endpoints: LocalEndpointRegistry,
    pub servers: BTreeMap<ServerId, Arc<ReplicaManager>>,
}

impl TestCluster {
    pub fn new(server_ids: &[ServerId]) -> Self {
        Self::with_events(server_ids, |_| EventSender::disabled())
    }

    pub fn with_events(server_ids: &[ServerId], events: impl Fn(ServerId) -> EventSender) -> Self {
        Self::build(server_ids, |_| memory_log_factory(LogConfig::default()), events)
    }

    pub fn build(
        server_ids: &[ServerId],
        log_factory: impl Fn(ServerId) -> LogFactory,
        events: impl Fn(ServerId) -> EventSender,
    ) -> Self {
        let endpoints = LocalEndpointRegistry::new();
        let servers = server_ids
            .iter()
            .map(|&id| {
                let manager = Arc::new(
                    ReplicaManager::with_events(
                        id,
                        test_config(),
                        log_factory(id),
                        Arc::new(endpoints.clone()),
                        events(id),
                    )
                    .unwrap(),
                );
                endpoints.register(&manager);
                (id, manager)
            })
            .collect();
        Self { endpoints, servers }
    }

    pub fn server(&self, id: ServerId) -> &Arc<ReplicaManager> {
        &self.servers[&id]
    }

    /// Deliver the notification to `targets` and assert every bucket succeeded.
    pub async fn notify(&self, targets: &[ServerId], coordinator_epoch: i32, data: &NotifyLeaderAndIsrData) {
        for id in targets {
            let results = self
                .server(*id)
                .become_leader_or_follower(coordinator_epoch, vec![data.clone()])
                .await;
            for result in results {
                assert!(
                    result.succeeded(),
                    "server {} rejected {}: {:?}",
                    id,
                    result.table_bucket,
                    result.error
                );
            }
        }
    }

    pub fn log_end_offset(&self, id: ServerId, table_bucket: &TableBucket) -> Offset {
        self.server(id)
            .replica(table_bucket)
            .map_or(-1, |r| r.local_log_end_offset())
    }

    pub fn high_watermark(&self, id: ServerId, table_bucket: &TableBucket) -> Offset {
        self.server(id)
            .replica(table_bucket)
            .map_or(-1, |r| r.log_high_watermark())
    }

    pub async fn shutdown(&self) {
        for server in self.servers.values() {
            server.shutdown().await;
        }
    }
}

/// Gateway to an in-process leader that fails its first `failures` fetches.
pub struct FlakyGateway {
    leader: Arc<ReplicaManager>,
    failures: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl FlakyGateway {
    pub fn new(leader: Arc<ReplicaManager>, failures: usize) -> Self {
        Self {
            leader,
            failures: AtomicUsize::new(failures),
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TabletServerGateway for FlakyGateway {
    async fn fetch_log(&self, request: FetchLogRequest) -> anyhow::Result<FetchLogResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connection reset by peer");
        }
        Ok(self.leader.fetch_log_records(request).await)
    }

    async fn leader_end_offset_snapshot(&self, table_bucket: &TableBucket) -> anyhow::Result<Offset> {
        Ok(self.leader.leader_end_offset_snapshot(table_bucket)?)
    }
}

/// Counts fetches and snapshot requests passing through to `inner`.
pub struct CountingEndpoint {
    inner: Arc<dyn LeaderEndpoint>,
    pub fetches: AtomicUsize,
    pub snapshots: AtomicUsize,
}

impl CountingEndpoint {
    pub fn new(inner: Arc<dyn LeaderEndpoint>) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            snapshots: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaderEndpoint for CountingEndpoint {
    fn leader_server_id(&self) -> ServerId {
        self.inner.leader_server_id()
    }

    async fn fetch_log(&self, request: FetchLogRequest) -> Result<FetchLogResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_log(request).await
    }

    async fn fetch_leader_end_offset_snapshot(&self, table_bucket: &TableBucket) -> Result<Offset> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_leader_end_offset_snapshot(table_bucket).await
    }
}

/// Holds every fetch response until the test releases it.
pub struct GatedEndpoint {
    inner: Arc<dyn LeaderEndpoint>,
    pub in_flight: Notify,
    pub release: Notify,
}

impl GatedEndpoint {
    pub fn new(inner: Arc<dyn LeaderEndpoint>) -> Self {
        Self {
            inner,
            in_flight: Notify::new(),
            release: Notify::new(),
        }
    }

    pub async fn wait_in_flight(&self) {
        self.in_flight.notified().await;
    }
}

#[async_trait]
impl LeaderEndpoint for GatedEndpoint {
    fn leader_server_id(&self) -> ServerId {
        self.inner.leader_server_id()
    }

    async fn fetch_log(&self, request: FetchLogRequest) -> Result<FetchLogResponse> {
        let response = self.inner.fetch_log(request).await?;
        self.in_flight.notify_one();
        self.release.notified().await;
        Ok(response)
    }

    async fn fetch_leader_end_offset_snapshot(&self, table_bucket: &TableBucket) -> Result<Offset> {
        self.inner.fetch_leader_end_offset_snapshot(table_bucket).await
    }
}

/// Log whose follower appends always fail as if the disk were gone.
pub struct FailingLog {
    inner: MemoryLog,
}

impl FailingLog {
    pub fn new(table_bucket: TableBucket) -> Self {
        Self {
            inner: MemoryLog::new(table_bucket, &LogConfig::default()),
        }
    }
}

impl LogStorage for FailingLog {
    fn table_bucket(&self) -> TableBucket {
        self.inner.table_bucket()
    }

    fn append_as_leader(&self, records: &MemoryLogRecords) -> Result<LogAppendInfo> {
        self.inner.append_as_leader(records)
    }

    fn append_as_follower(
        &self,
        _records: &MemoryLogRecords,
        _leader_high_watermark: Option<Offset>,
    ) -> Result<LogAppendInfo> {
        Err(ReplicaError::Storage("segment file is read-only".to_string()))
    }

    fn read(&self, fetch_offset: Offset, max_bytes: usize) -> Result<MemoryLogRecords> {
        self.inner.read(fetch_offset, max_bytes)
    }

    fn truncate_to(&self, offset: Offset) -> Result<()> {
        self.inner.truncate_to(offset)
    }

    fn local_log_end_offset(&self) -> Offset {
        self.inner.local_log_end_offset()
    }

    fn high_watermark(&self) -> Offset {
        self.inner.high_watermark()
    }

    fn update_high_watermark(&self, high_watermark: Offset) -> Result<bool> {
        self.inner.update_high_watermark(high_watermark)
    }

    fn offset_snapshot(&self) -> LogOffsetSnapshot {
        self.inner.offset_snapshot()
    }
}

/// Await `future` or fail the test after `limit`.
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, future)
        .await
        .expect("timed out")
}
