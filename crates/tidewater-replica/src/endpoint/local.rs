//! In-process leader endpoint.
//!
//! Used when leader and follower replica managers live in the same process,
//! as in embedded deployments and multi-server tests. Managers are held
//! weakly so a dropped server looks like an unreachable one.

use super::{FetchLogRequest, FetchLogResponse, LeaderEndpoint, LeaderEndpointFactory};
use crate::error::{ReplicaError, Result};
use crate::replica_manager::ReplicaManager;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tidewater_common::{Offset, ServerId, TableBucket};
use tracing::trace;

/// Endpoint calling the leader's replica manager directly.
pub struct LocalLeaderEndpoint {
    leader_id: ServerId,
    leader: Weak<ReplicaManager>,
}

impl LocalLeaderEndpoint {
    pub fn new(leader: &Arc<ReplicaManager>) -> Self {
        Self {
            leader_id: leader.server_id(),
            leader: Arc::downgrade(leader),
        }
    }

    fn leader(&self) -> Result<Arc<ReplicaManager>> {
        self.leader.upgrade().ok_or_else(|| {
            ReplicaError::Transport(format!("server {} is not running", self.leader_id))
        })
    }
}

#[async_trait]
impl LeaderEndpoint for LocalLeaderEndpoint {
    fn leader_server_id(&self) -> ServerId {
        self.leader_id
    }

    async fn fetch_log(&self, request: FetchLogRequest) -> Result<FetchLogResponse> {
        trace!(
            from = request.follower_server_id,
            to = self.leader_id,
            buckets = request.buckets.len(),
            "Routing fetch via local endpoint"
        );
        let leader = self.leader()?;
        Ok(leader.fetch_log_records(request).await)
    }

    async fn fetch_leader_end_offset_snapshot(&self, table_bucket: &TableBucket) -> Result<Offset> {
        self.leader()?.leader_end_offset_snapshot(table_bucket)
    }
}

/// Servers reachable in this process, keyed by id.
#[derive(Clone, Default)]
pub struct LocalEndpointRegistry {
    servers: Arc<RwLock<HashMap<ServerId, Weak<ReplicaManager>>>>,
}

impl LocalEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, manager: &Arc<ReplicaManager>) {
        self.servers
            .write()
            .insert(manager.server_id(), Arc::downgrade(manager));
    }

    pub fn deregister(&self, server_id: ServerId) {
        self.servers.write().remove(&server_id);
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<_> = self.servers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl LeaderEndpointFactory for LocalEndpointRegistry {
    fn create(&self, leader_id: ServerId) -> Result<Arc<dyn LeaderEndpoint>> {
        let manager = self
            .servers
            .read()
            .get(&leader_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                ReplicaError::Transport(format!("server {} is not registered", leader_id))
            })?;
        Ok(Arc::new(LocalLeaderEndpoint::new(&manager)))
    }
}
