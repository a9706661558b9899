//! Replica events for notifying the server layer of state changes.
//!
//! Fetcher sessions and the replica manager publish these on an unbounded
//! channel so the layer above can react (reassign an offline bucket, alert on
//! divergence) without a dependency back into this crate.

use serde::{Deserialize, Serialize};
use tidewater_common::{ServerId, TableBucket};
use tokio::sync::mpsc;
use tracing::trace;

/// Events emitted by replicas and fetchers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaEvent {
    /// This server became leader of the bucket
    BecameLeader {
        bucket: TableBucket,
        leader_epoch: i32,
        /// End offset cached at promotion
        leader_end_offset_snapshot: i64,
    },

    /// This server became (or switched leader as) a follower of the bucket
    BecameFollower {
        bucket: TableBucket,
        leader_id: ServerId,
        leader_epoch: i32,
    },

    /// A follower cut its divergent tail
    Truncated {
        bucket: TableBucket,
        from_offset: i64,
        to_offset: i64,
    },

    /// A replica hit an unrecoverable local storage failure and stopped
    ReplicaOffline { bucket: TableBucket, reason: String },
}

impl ReplicaEvent {
    /// Get the bucket for this event
    pub fn bucket(&self) -> TableBucket {
        match self {
            ReplicaEvent::BecameLeader { bucket, .. }
            | ReplicaEvent::BecameFollower { bucket, .. }
            | ReplicaEvent::Truncated { bucket, .. }
            | ReplicaEvent::ReplicaOffline { bucket, .. } => *bucket,
        }
    }
}

/// Optional event sink. Sends are dropped silently when nobody listens.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<ReplicaEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<ReplicaEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sender that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: ReplicaEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Replica event receiver dropped");
            }
        }
    }
}
