//! Leader endpoint abstraction
//!
//! A follower's fetcher session talks to a bucket leader only through
//! [`LeaderEndpoint`]. Two implementations exist:
//!
//! - [`LocalLeaderEndpoint`]: calls the leader's [`ReplicaManager`] in process
//! - [`RemoteLeaderEndpoint`]: sends requests through a [`TabletServerGateway`]
//!
//! [`ReplicaManager`]: crate::replica_manager::ReplicaManager

mod local;
mod remote;

pub use local::{LocalEndpointRegistry, LocalLeaderEndpoint};
pub use remote::{GatewayConnector, RemoteEndpointFactory, RemoteLeaderEndpoint, TabletServerGateway};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tidewater_common::{ApiError, MemoryLogRecords, Offset, ServerId, TableBucket, TablePath};

/// Per-bucket part of a fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchBucketData {
    pub table_path: TablePath,
    pub fetch_offset: Offset,
    /// Leader epoch the follower believes is current
    pub leader_epoch: i32,
    pub max_bytes: usize,
}

/// One fetch covering every bucket a session follows on the same leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLogRequest {
    pub follower_server_id: ServerId,
    /// Upper bound across all buckets
    pub max_bytes: usize,
    /// How long the leader may wait for data before answering
    pub max_wait_ms: u64,
    pub buckets: BTreeMap<TableBucket, FetchBucketData>,
}

impl FetchLogRequest {
    pub fn new(follower_server_id: ServerId, max_bytes: usize, max_wait_ms: u64) -> Self {
        Self {
            follower_server_id,
            max_bytes,
            max_wait_ms,
            buckets: BTreeMap::new(),
        }
    }

    pub fn add_bucket(&mut self, table_bucket: TableBucket, data: FetchBucketData) {
        self.buckets.insert(table_bucket, data);
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Leader's answer for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchLogResultForBucket {
    /// Records starting at the requested offset
    Records {
        records: MemoryLogRecords,
        high_watermark: Offset,
    },
    /// Nothing new at the requested offset
    Empty { high_watermark: Offset },
    /// Request epoch does not match the leader's current epoch
    FencedLeaderEpoch { current_leader_epoch: i32 },
    /// Requested offset is past the leader's log end
    Diverged { leader_end_offset_snapshot: Offset },
    Error(ApiError),
}

impl FetchLogResultForBucket {
    pub fn has_records(&self) -> bool {
        matches!(self, FetchLogResultForBucket::Records { records, .. } if !records.is_empty())
    }

    pub fn high_watermark(&self) -> Option<Offset> {
        match self {
            FetchLogResultForBucket::Records { high_watermark, .. }
            | FetchLogResultForBucket::Empty { high_watermark } => Some(*high_watermark),
            _ => None,
        }
    }
}

/// Per-bucket results of one fetch. Buckets may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLogResponse {
    pub buckets: HashMap<TableBucket, FetchLogResultForBucket>,
}

impl FetchLogResponse {
    pub fn has_records(&self) -> bool {
        self.buckets.values().any(FetchLogResultForBucket::has_records)
    }
}

/// Connection to the leader of a set of buckets.
#[async_trait]
pub trait LeaderEndpoint: Send + Sync {
    /// Server this endpoint talks to
    fn leader_server_id(&self) -> ServerId;

    /// Fetch every bucket in the request with one call.
    async fn fetch_log(&self, request: FetchLogRequest) -> Result<FetchLogResponse>;

    /// Leader's cached end offset from the moment it became leader.
    async fn fetch_leader_end_offset_snapshot(&self, table_bucket: &TableBucket) -> Result<Offset>;
}

/// Creates an endpoint to a given leader; used by the fetcher manager.
pub trait LeaderEndpointFactory: Send + Sync {
    fn create(&self, leader_id: ServerId) -> Result<Arc<dyn LeaderEndpoint>>;
}
