//! Tidewater Replica - bucket replication for tablet servers.
//!
//! Every table bucket has one leader and a set of followers. Followers pull
//! the leader's log through long-lived fetcher sessions, append what they
//! receive at the leader-assigned offsets and adopt the leader's high
//! watermark. When leadership moves, a follower whose log runs past the new
//! leader's truncates back to the leader end offset snapshot.
//!
//! # Architecture
//!
//! - **ReplicaManager**: hosts all replicas of one server and applies
//!   leadership notifications from the coordinator
//! - **Replica**: leader/follower state machine of a single bucket
//! - **ReplicaFetcherManager**: groups followed buckets into sessions keyed
//!   by leader
//! - **ReplicaFetcherThread**: one fetch loop against one leader
//! - **LeaderEndpoint**: in-process or RPC connection to a leader
//! - **LogStorage**: local log with idempotent-writer deduplication
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidewater_replica::{
//!     config::ReplicaConfig, endpoint::LocalEndpointRegistry, log::memory_log_factory,
//!     ReplicaManager,
//! };
//!
//! # fn example() -> tidewater_replica::Result<()> {
//! let config = ReplicaConfig::from_env();
//! let endpoints = LocalEndpointRegistry::new();
//! let manager = Arc::new(ReplicaManager::new(
//!     1,
//!     config.clone(),
//!     memory_log_factory(config.log),
//!     Arc::new(endpoints.clone()),
//! )?);
//! endpoints.register(&manager);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod log;
pub mod replica;
pub mod replica_manager;

pub use config::{FetcherConfig, LogConfig, ReplicaConfig};
pub use endpoint::{LeaderEndpoint, LeaderEndpointFactory};
pub use error::{ReplicaError, Result};
pub use events::{EventSender, ReplicaEvent};
pub use fetcher::{InitialFetchStatus, ReplicaFetcherManager, ReplicaFetcherThread};
pub use log::{LogFactory, LogStorage, MemoryLog};
pub use replica::{Replica, ReplicaRegistry, ReplicaRole};
pub use replica_manager::{
    NotifyLeaderAndIsrResultForBucket, ProduceLogResultForBucket, ReplicaManager,
    StopReplicaResultForBucket,
};
