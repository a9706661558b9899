//! Common types used throughout Tidewater.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset within a bucket's log.
pub type Offset = i64;

/// Tablet server identifier in the cluster.
pub type ServerId = i32;

/// Offset used before anything is known about a log position.
pub const UNKNOWN_OFFSET: Offset = -1;

/// Table and bucket identifier. The unit of leadership and replication.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TableBucket {
    pub table_id: i64,
    pub bucket: i32,
}

impl TableBucket {
    pub fn new(table_id: i64, bucket: i32) -> Self {
        Self { table_id, bucket }
    }
}

impl fmt::Display for TableBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.table_id, self.bucket)
    }
}

/// Database-qualified table name.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TablePath {
    pub database: String,
    pub table: String,
}

impl TablePath {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}
