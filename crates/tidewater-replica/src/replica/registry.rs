use super::Replica;
use crate::error::{ReplicaError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tidewater_common::TableBucket;

/// Replicas hosted by one server, shared between the replica manager and its
/// fetcher sessions.
#[derive(Clone, Default)]
pub struct ReplicaRegistry {
    replicas: Arc<DashMap<TableBucket, Arc<Replica>>>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table_bucket: &TableBucket) -> Option<Arc<Replica>> {
        self.replicas.get(table_bucket).map(|r| r.value().clone())
    }

    pub fn get_or_error(&self, table_bucket: &TableBucket) -> Result<Arc<Replica>> {
        self.get(table_bucket)
            .ok_or(ReplicaError::UnknownTableOrBucket(*table_bucket))
    }

    /// Return the existing replica or insert the one built by `create`.
    pub fn get_or_try_insert_with(
        &self,
        table_bucket: TableBucket,
        create: impl FnOnce() -> Result<Replica>,
    ) -> Result<Arc<Replica>> {
        if let Some(existing) = self.get(&table_bucket) {
            return Ok(existing);
        }
        let entry = self.replicas.entry(table_bucket);
        match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let replica = Arc::new(create()?);
                e.insert(replica.clone());
                Ok(replica)
            }
        }
    }

    pub fn insert(&self, replica: Arc<Replica>) -> Option<Arc<Replica>> {
        self.replicas.insert(replica.table_bucket(), replica)
    }

    pub fn remove(&self, table_bucket: &TableBucket) -> Option<Arc<Replica>> {
        self.replicas.remove(table_bucket).map(|(_, r)| r)
    }

    pub fn contains(&self, table_bucket: &TableBucket) -> bool {
        self.replicas.contains_key(table_bucket)
    }

    pub fn buckets(&self) -> Vec<TableBucket> {
        self.replicas.iter().map(|r| *r.key()).collect()
    }

    pub fn all(&self) -> Vec<Arc<Replica>> {
        self.replicas.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

impl std::fmt::Debug for ReplicaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaRegistry")
            .field("buckets", &self.buckets())
            .finish()
    }
}
