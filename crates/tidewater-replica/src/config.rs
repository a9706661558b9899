//! Replica and fetcher configuration
//!
//! Defaults suit a small cluster. Every field can be overridden from the
//! environment:
//!
//! ```bash
//! TIDEWATER_FETCHER_NUM_PER_LEADER=1
//! TIDEWATER_FETCH_MAX_BYTES=16777216
//! TIDEWATER_FETCH_MAX_BYTES_PER_BUCKET=1048576
//! TIDEWATER_FETCH_MAX_WAIT_MS=500
//! TIDEWATER_FETCH_MIN_INTERVAL_MS=10
//! TIDEWATER_FETCH_REQUEST_TIMEOUT_MS=30000
//! TIDEWATER_FETCH_BACKOFF_INITIAL_MS=100
//! TIDEWATER_FETCH_BACKOFF_MAX_MS=1000
//! TIDEWATER_FETCH_BACKOFF_MULTIPLIER=2.0
//! TIDEWATER_FETCH_BACKOFF_JITTER=0.1
//! TIDEWATER_LOG_MAX_BATCHES_PER_WRITER=5
//! ```

use crate::error::{ReplicaError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a tablet server's replicas
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Follower fetcher settings
    pub fetcher: FetcherConfig,

    /// Local log settings
    pub log: LogConfig,
}

/// Follower fetcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Number of fetcher sessions per leader server (default: 1)
    pub num_fetchers_per_leader: usize,

    /// Maximum bytes returned by one fetch across all buckets (default: 16MB)
    pub fetch_max_bytes: usize,

    /// Maximum bytes returned for one bucket (default: 1MB)
    pub fetch_max_bytes_per_bucket: usize,

    /// How long the leader may hold a fetch that has no data (default: 500ms)
    pub fetch_max_wait_ms: u64,

    /// Minimum time between two fetches that returned nothing (default: 10ms)
    pub fetch_min_interval_ms: u64,

    /// Bounded wait for one fetch RPC (default: 30s)
    pub request_timeout_ms: u64,

    /// First backoff after a failed fetch (default: 100ms)
    pub backoff_initial_ms: u64,

    /// Backoff cap; also the delay applied to a fenced bucket (default: 1s)
    pub backoff_max_ms: u64,

    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f32,

    /// Jitter factor 0.0-1.0 (default: 0.1)
    pub backoff_jitter: f32,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            num_fetchers_per_leader: 1,
            fetch_max_bytes: 16 * 1024 * 1024,
            fetch_max_bytes_per_bucket: 1024 * 1024,
            fetch_max_wait_ms: 500,
            fetch_min_interval_ms: 10,
            request_timeout_ms: 30_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.1,
        }
    }
}

/// Local log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Recent batches remembered per writer for duplicate detection (default: 5)
    pub max_batches_per_writer: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_batches_per_writer: 5,
        }
    }
}

impl ReplicaConfig {
    /// Load configuration from environment variables
    ///
    /// Falls back to defaults if environment variables are not set.
    pub fn from_env() -> Self {
        Self {
            fetcher: FetcherConfig::from_env(),
            log: LogConfig::from_env(),
        }
    }

    /// Reject settings the fetcher cannot run with
    pub fn validate(&self) -> Result<()> {
        self.fetcher.validate()?;
        if self.log.max_batches_per_writer == 0 {
            return Err(ReplicaError::Config(
                "log.max_batches_per_writer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl FetcherConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            num_fetchers_per_leader: env_or(
                "TIDEWATER_FETCHER_NUM_PER_LEADER",
                defaults.num_fetchers_per_leader,
            ),
            fetch_max_bytes: env_or("TIDEWATER_FETCH_MAX_BYTES", defaults.fetch_max_bytes),
            fetch_max_bytes_per_bucket: env_or(
                "TIDEWATER_FETCH_MAX_BYTES_PER_BUCKET",
                defaults.fetch_max_bytes_per_bucket,
            ),
            fetch_max_wait_ms: env_or("TIDEWATER_FETCH_MAX_WAIT_MS", defaults.fetch_max_wait_ms),
            fetch_min_interval_ms: env_or(
                "TIDEWATER_FETCH_MIN_INTERVAL_MS",
                defaults.fetch_min_interval_ms,
            ),
            request_timeout_ms: env_or(
                "TIDEWATER_FETCH_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            ),
            backoff_initial_ms: env_or(
                "TIDEWATER_FETCH_BACKOFF_INITIAL_MS",
                defaults.backoff_initial_ms,
            ),
            backoff_max_ms: env_or("TIDEWATER_FETCH_BACKOFF_MAX_MS", defaults.backoff_max_ms),
            backoff_multiplier: env_or(
                "TIDEWATER_FETCH_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            ),
            backoff_jitter: env_or("TIDEWATER_FETCH_BACKOFF_JITTER", defaults.backoff_jitter),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_fetchers_per_leader == 0 {
            return Err(ReplicaError::Config(
                "fetcher.num_fetchers_per_leader must be at least 1".to_string(),
            ));
        }
        if self.fetch_max_bytes_per_bucket > self.fetch_max_bytes {
            return Err(ReplicaError::Config(format!(
                "fetcher.fetch_max_bytes_per_bucket ({}) exceeds fetch_max_bytes ({})",
                self.fetch_max_bytes_per_bucket, self.fetch_max_bytes
            )));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ReplicaError::Config(format!(
                "fetcher.backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        if self.request_timeout_ms <= self.fetch_max_wait_ms {
            return Err(ReplicaError::Config(format!(
                "fetcher.request_timeout_ms ({}) must exceed fetch_max_wait_ms ({})",
                self.request_timeout_ms, self.fetch_max_wait_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ReplicaError::Config(
                "fetcher.backoff_jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }

    pub fn fetch_min_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay applied to a bucket that must sit out a fetch cycle.
    pub fn bucket_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl LogConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        Self {
            max_batches_per_writer: env_or(
                "TIDEWATER_LOG_MAX_BATCHES_PER_WRITER",
                Self::default().max_batches_per_writer,
            ),
        }
    }
}
