use super::status::{FetcherStats, InitialFetchStatus};
use super::thread::ReplicaFetcherThread;
use crate::config::FetcherConfig;
use crate::endpoint::LeaderEndpointFactory;
use crate::error::Result;
use crate::events::EventSender;
use crate::replica::ReplicaRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tidewater_common::{ServerId, TableBucket};
use tracing::{debug, info};

/// Identifies one fetch session: the leader it pulls from and its slot among
/// that leader's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetcherKey {
    pub leader_id: ServerId,
    pub fetcher_id: usize,
}

/// Routes follower buckets to fetch sessions, creating a session the first
/// time a leader is needed and shutting it down when it has nothing left.
pub struct ReplicaFetcherManager {
    server_id: ServerId,
    config: FetcherConfig,
    registry: ReplicaRegistry,
    endpoint_factory: Arc<dyn LeaderEndpointFactory>,
    fetchers: Mutex<HashMap<FetcherKey, Arc<ReplicaFetcherThread>>>,
    events: EventSender,
}

impl ReplicaFetcherManager {
    pub fn new(
        server_id: ServerId,
        config: FetcherConfig,
        registry: ReplicaRegistry,
        endpoint_factory: Arc<dyn LeaderEndpointFactory>,
        events: EventSender,
    ) -> Self {
        Self {
            server_id,
            config,
            registry,
            endpoint_factory,
            fetchers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Session slot of a bucket. Stable across restarts.
    pub fn fetcher_id(&self, table_bucket: &TableBucket) -> usize {
        let slots = self.config.num_fetchers_per_leader.max(1) as i64;
        let hash = table_bucket
            .table_id
            .wrapping_mul(31)
            .wrapping_add(table_bucket.bucket as i64);
        hash.rem_euclid(slots) as usize
    }

    /// Assign buckets to the sessions of their leaders.
    ///
    /// A bucket already followed by another session is removed from it first.
    /// If a new session cannot reach its leader nothing is reassigned. Sessions
    /// emptied by a move stay until the next idle sweep.
    pub fn add_fetcher_for_buckets(
        &self,
        buckets: HashMap<TableBucket, InitialFetchStatus>,
    ) -> Result<()> {
        let mut by_fetcher: HashMap<FetcherKey, HashMap<TableBucket, InitialFetchStatus>> =
            HashMap::new();
        for (bucket, status) in buckets {
            let key = FetcherKey {
                leader_id: status.leader_id,
                fetcher_id: self.fetcher_id(&bucket),
            };
            by_fetcher.entry(key).or_default().insert(bucket, status);
        }

        let mut fetchers = self.fetchers.lock();
        let mut created = Vec::new();
        for key in by_fetcher.keys() {
            if !fetchers.contains_key(key) {
                created.push((*key, self.create_fetcher(*key)?));
            }
        }
        for (key, fetcher) in created {
            fetcher.start();
            fetchers.insert(key, fetcher);
        }

        for (key, assigned) in by_fetcher {
            for (other_key, fetcher) in fetchers.iter() {
                if *other_key != key {
                    fetcher.remove_buckets(assigned.keys());
                }
            }
            if let Some(fetcher) = fetchers.get(&key) {
                fetcher.add_buckets(assigned);
            }
        }
        Ok(())
    }

    /// Connect a session to its leader without starting it.
    fn create_fetcher(&self, key: FetcherKey) -> Result<Arc<ReplicaFetcherThread>> {
        let endpoint = self.endpoint_factory.create(key.leader_id)?;
        let name = format!(
            "replica-fetcher-{}-leader-{}-{}",
            self.server_id, key.leader_id, key.fetcher_id
        );
        info!("Creating fetcher {}", name);
        let fetcher = Arc::new(
            ReplicaFetcherThread::new(
                name,
                self.server_id,
                endpoint,
                self.registry.clone(),
                self.config.clone(),
            )
            .with_events(self.events.clone()),
        );
        Ok(fetcher)
    }

    /// Stop fetching these buckets and shut down sessions left empty.
    pub async fn remove_fetcher_for_buckets(&self, buckets: &[TableBucket]) {
        if buckets.is_empty() {
            return;
        }
        {
            let fetchers = self.fetchers.lock();
            for fetcher in fetchers.values() {
                fetcher.remove_buckets(buckets);
            }
        }
        self.shutdown_idle_fetcher_threads().await;
    }

    pub async fn shutdown_idle_fetcher_threads(&self) {
        let idle: Vec<_> = {
            let mut fetchers = self.fetchers.lock();
            let keys: Vec<_> = fetchers
                .iter()
                .filter(|(_, f)| f.bucket_count() == 0)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| fetchers.remove(&k))
                .collect()
        };
        for fetcher in idle {
            debug!("Shutting down idle fetcher {}", fetcher.name());
            fetcher.shutdown().await;
        }
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        info!("Shutting down replica fetcher manager on server {}", self.server_id);
        let all: Vec<_> = self.fetchers.lock().drain().map(|(_, f)| f).collect();
        for fetcher in all {
            fetcher.shutdown().await;
        }
    }

    /// Session currently following the bucket, if any
    pub fn fetcher_for_bucket(&self, table_bucket: &TableBucket) -> Option<Arc<ReplicaFetcherThread>> {
        self.fetchers
            .lock()
            .values()
            .find(|f| f.contains_bucket(table_bucket))
            .cloned()
    }

    pub fn fetcher_count(&self) -> usize {
        self.fetchers.lock().len()
    }

    pub fn fetcher_keys(&self) -> Vec<FetcherKey> {
        let mut keys: Vec<_> = self.fetchers.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Sum of all session statistics
    pub fn stats(&self) -> FetcherStats {
        self.fetchers
            .lock()
            .values()
            .map(|f| f.stats())
            .fold(FetcherStats::default(), |acc, s| acc + s)
    }
}

impl std::fmt::Debug for ReplicaFetcherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaFetcherManager")
            .field("server_id", &self.server_id)
            .field("fetchers", &self.fetcher_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{FetchLogRequest, FetchLogResponse, LeaderEndpoint};
    use async_trait::async_trait;
    use tidewater_common::{Offset, TablePath};

    struct IdleEndpoint(ServerId);

    #[async_trait]
    impl LeaderEndpoint for IdleEndpoint {
        fn leader_server_id(&self) -> ServerId {
            self.0
        }

        async fn fetch_log(&self, _request: FetchLogRequest) -> Result<FetchLogResponse> {
            Ok(FetchLogResponse::default())
        }

        async fn fetch_leader_end_offset_snapshot(&self, _table_bucket: &TableBucket) -> Result<Offset> {
            Ok(0)
        }
    }

    struct IdleEndpointFactory;

    impl LeaderEndpointFactory for IdleEndpointFactory {
        fn create(&self, leader_id: ServerId) -> Result<Arc<dyn LeaderEndpoint>> {
            Ok(Arc::new(IdleEndpoint(leader_id)))
        }
    }

    /// Knows every leader except server 9.
    struct PartialEndpointFactory;

    impl LeaderEndpointFactory for PartialEndpointFactory {
        fn create(&self, leader_id: ServerId) -> Result<Arc<dyn LeaderEndpoint>> {
            if leader_id == 9 {
                return Err(crate::error::ReplicaError::Transport(format!(
                    "server {} is not registered",
                    leader_id
                )));
            }
            Ok(Arc::new(IdleEndpoint(leader_id)))
        }
    }

    fn manager(num_fetchers_per_leader: usize) -> ReplicaFetcherManager {
        ReplicaFetcherManager::new(
            3,
            FetcherConfig {
                num_fetchers_per_leader,
                ..Default::default()
            },
            ReplicaRegistry::new(),
            Arc::new(IdleEndpointFactory),
            EventSender::disabled(),
        )
    }

    fn status(bucket: &TableBucket, leader_id: ServerId) -> InitialFetchStatus {
        InitialFetchStatus::new(bucket.table_id, TablePath::new("db", "t"), leader_id, 0)
    }

    #[tokio::test]
    async fn test_one_session_per_leader() {
        let manager = manager(1);
        let buckets: Vec<_> = (0..4).map(|b| TableBucket::new(1, b)).collect();

        let assignment = buckets
            .iter()
            .map(|b| (*b, status(b, if b.bucket < 2 { 1 } else { 2 })))
            .collect();
        manager.add_fetcher_for_buckets(assignment).unwrap();

        assert_eq!(
            manager.fetcher_keys(),
            vec![
                FetcherKey { leader_id: 1, fetcher_id: 0 },
                FetcherKey { leader_id: 2, fetcher_id: 0 },
            ]
        );
        assert_eq!(manager.stats().bucket_count, 4);
        manager.shutdown().await;
        assert_eq!(manager.fetcher_count(), 0);
    }

    #[tokio::test]
    async fn test_moving_bucket_between_leaders() {
        let manager = manager(1);
        let bucket = TableBucket::new(1, 0);

        manager
            .add_fetcher_for_buckets(HashMap::from([(bucket, status(&bucket, 1))]))
            .unwrap();
        manager
            .add_fetcher_for_buckets(HashMap::from([(bucket, status(&bucket, 2))]))
            .unwrap();

        let fetcher = manager.fetcher_for_bucket(&bucket).unwrap();
        assert_eq!(fetcher.leader_id(), 2);
        assert_eq!(manager.stats().bucket_count, 1);

        // the session for leader 1 is empty and goes away on the next sweep
        manager.shutdown_idle_fetcher_threads().await;
        assert_eq!(manager.fetcher_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_leader_leaves_assignment_untouched() {
        let manager = ReplicaFetcherManager::new(
            3,
            FetcherConfig::default(),
            ReplicaRegistry::new(),
            Arc::new(PartialEndpointFactory),
            EventSender::disabled(),
        );
        let moved = TableBucket::new(1, 0);
        let orphan = TableBucket::new(1, 1);
        manager
            .add_fetcher_for_buckets(HashMap::from([(moved, status(&moved, 1))]))
            .unwrap();

        let result = manager.add_fetcher_for_buckets(HashMap::from([
            (moved, status(&moved, 2)),
            (orphan, status(&orphan, 9)),
        ]));
        assert!(result.is_err());

        let fetcher = manager.fetcher_for_bucket(&moved).unwrap();
        assert_eq!(fetcher.leader_id(), 1);
        assert!(manager.fetcher_for_bucket(&orphan).is_none());
        assert_eq!(
            manager.fetcher_keys(),
            vec![FetcherKey { leader_id: 1, fetcher_id: 0 }]
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_removing_last_bucket_stops_session() {
        let manager = manager(1);
        let bucket = TableBucket::new(1, 0);
        manager
            .add_fetcher_for_buckets(HashMap::from([(bucket, status(&bucket, 1))]))
            .unwrap();
        let fetcher = manager.fetcher_for_bucket(&bucket).unwrap();
        assert!(fetcher.is_running());

        manager.remove_fetcher_for_buckets(&[bucket]).await;
        assert_eq!(manager.fetcher_count(), 0);
        assert!(!fetcher.is_running());
    }

    #[tokio::test]
    async fn test_buckets_spread_across_fetchers() {
        let manager = manager(2);
        let assignment: HashMap<_, _> = (0..4)
            .map(|b| {
                let bucket = TableBucket::new(10, b);
                (bucket, status(&bucket, 1))
            })
            .collect();
        manager.add_fetcher_for_buckets(assignment).unwrap();

        assert_eq!(manager.fetcher_count(), 2);
        assert_eq!(manager.fetcher_id(&TableBucket::new(10, 0)), 0);
        assert_eq!(manager.fetcher_id(&TableBucket::new(10, 1)), 1);
        manager.shutdown().await;
    }
}
