//! Follower-side replication: fetch sessions and their manager.

mod backoff;
mod manager;
mod status;
mod thread;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use manager::{FetcherKey, ReplicaFetcherManager};
pub use status::{FetcherStats, InitialFetchStatus};
pub use thread::ReplicaFetcherThread;
