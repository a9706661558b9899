//! Leadership snapshots pushed from the coordinator to tablet servers.

use crate::types::{ServerId, TableBucket, TablePath};
use serde::{Deserialize, Serialize};

/// Leader epoch of a freshly created bucket.
pub const INITIAL_LEADER_EPOCH: i32 = 0;

/// Bucket epoch of a freshly created bucket.
pub const INITIAL_BUCKET_EPOCH: i32 = 0;

/// Coordinator epoch of the first coordinator.
pub const INITIAL_COORDINATOR_EPOCH: i32 = 0;

/// Epoch used by a replica that has not received any notification yet.
pub const NO_LEADER_EPOCH: i32 = -1;

/// Leader and in-sync replica set of a bucket.
///
/// Replaced wholesale on every notification. `leader_epoch` strictly
/// increases on each leadership change; `bucket_epoch` increases on ISR
/// changes under the same leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAndIsr {
    pub leader: ServerId,
    pub leader_epoch: i32,
    pub isr: Vec<ServerId>,
    pub coordinator_epoch: i32,
    pub bucket_epoch: i32,
}

impl LeaderAndIsr {
    pub fn new(
        leader: ServerId,
        leader_epoch: i32,
        isr: Vec<ServerId>,
        coordinator_epoch: i32,
        bucket_epoch: i32,
    ) -> Self {
        Self {
            leader,
            leader_epoch,
            isr,
            coordinator_epoch,
            bucket_epoch,
        }
    }

    /// Leadership for a brand new bucket.
    pub fn initial(leader: ServerId, isr: Vec<ServerId>) -> Self {
        Self::new(
            leader,
            INITIAL_LEADER_EPOCH,
            isr,
            INITIAL_COORDINATOR_EPOCH,
            INITIAL_BUCKET_EPOCH,
        )
    }

    /// Next leadership for the same bucket with a new leader.
    pub fn next_leader(&self, leader: ServerId, isr: Vec<ServerId>) -> Self {
        Self::new(
            leader,
            self.leader_epoch + 1,
            isr,
            self.coordinator_epoch,
            self.bucket_epoch + 1,
        )
    }

    pub fn is_in_isr(&self, server_id: ServerId) -> bool {
        self.isr.contains(&server_id)
    }
}

/// One bucket's entry in a leadership notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyLeaderAndIsrData {
    pub table_path: TablePath,
    pub table_bucket: TableBucket,
    /// Full replica assignment, leader included
    pub replicas: Vec<ServerId>,
    pub leader_and_isr: LeaderAndIsr,
}

impl NotifyLeaderAndIsrData {
    pub fn new(
        table_path: TablePath,
        table_bucket: TableBucket,
        replicas: Vec<ServerId>,
        leader_and_isr: LeaderAndIsr,
    ) -> Self {
        Self {
            table_path,
            table_bucket,
            replicas,
            leader_and_isr,
        }
    }

    pub fn leader(&self) -> ServerId {
        self.leader_and_isr.leader
    }

    pub fn leader_epoch(&self) -> i32 {
        self.leader_and_isr.leader_epoch
    }

    pub fn bucket_epoch(&self) -> i32 {
        self.leader_and_isr.bucket_epoch
    }

    pub fn isr(&self) -> &[ServerId] {
        &self.leader_and_isr.isr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_leader_bumps_epochs() {
        let initial = LeaderAndIsr::initial(1, vec![1, 2, 3]);
        let next = initial.next_leader(2, vec![2, 3]);

        assert_eq!(next.leader, 2);
        assert_eq!(next.leader_epoch, INITIAL_LEADER_EPOCH + 1);
        assert_eq!(next.bucket_epoch, INITIAL_BUCKET_EPOCH + 1);
        assert_eq!(next.coordinator_epoch, initial.coordinator_epoch);
        assert!(!next.is_in_isr(1));
    }
}
