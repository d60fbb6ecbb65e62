//! Durable entry store: expiration bookkeeping and the retry queue.
//!
//! Two repository traits describe what the rest of the engine needs from
//! persistent storage:
//!
//! - [`ExpirationRepository`]: one timestamp per (bucket, URL)
//! - [`QueueRepository`]: FIFO entries per queue name
//!
//! [`EntryStore`] implements both, either purely in memory or persisted to a
//! file. Any transactional key-value or relational store can implement the
//! traits instead.

use crate::background_sync::StorableRequest;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod entry_store;

pub use entry_store::EntryStore;

/// Last-access timestamp of one cached URL in one bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationRecord {
    pub bucket: String,
    /// Normalized URL (fragment removed)
    pub url: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl ExpirationRecord {
    /// Composite unique key of the record.
    pub fn id(bucket: &str, url: &str) -> String {
        format!("{}|{}", bucket, url)
    }
}

/// Fixed metadata carried by every queue entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Number of failed replay attempts so far.
    pub retry_count: u32,
    /// Free-form label supplied by the caller (e.g. the originating form).
    pub tag: Option<String>,
}

/// A stored failed request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Ordering key within the queue: smaller ids are older.
    pub id: i64,
    pub queue_name: String,
    pub request: StorableRequest,
    /// Milliseconds since the Unix epoch when the entry was first queued
    pub timestamp: i64,
    pub metadata: EntryMetadata,
}

/// A queue entry before the store assigns its id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewQueueEntry {
    pub request: StorableRequest,
    pub timestamp: i64,
    pub metadata: EntryMetadata,
}

/// Persistent storage for expiration timestamps.
#[async_trait]
pub trait ExpirationRepository: Send + Sync {
    /// Insert or update the timestamp of `url` in `bucket`.
    async fn set_timestamp(&self, bucket: &str, url: &str, timestamp: i64) -> Result<()>;

    /// Timestamp of `url` in `bucket`, if recorded.
    async fn get_timestamp(&self, bucket: &str, url: &str) -> Result<Option<i64>>;

    /// Delete the records of `bucket` that are older than `min_timestamp`, or
    /// that come after the `max_count` most recent ones.
    ///
    /// Records are walked newest-first. A `min_timestamp` of 0 disables the age
    /// bound. Returns the URLs whose records were deleted.
    async fn expire_entries(
        &self,
        bucket: &str,
        min_timestamp: i64,
        max_count: Option<usize>,
    ) -> Result<Vec<String>>;

    /// All records of `bucket`, newest first.
    async fn records(&self, bucket: &str) -> Result<Vec<ExpirationRecord>>;

    /// Delete every record of `bucket`; returns how many were removed.
    async fn delete_bucket(&self, bucket: &str) -> Result<usize>;
}

/// Persistent storage for retry queues.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Append an entry at the tail of `queue`; returns the assigned id.
    async fn push_entry(&self, queue: &str, entry: NewQueueEntry) -> Result<i64>;

    /// Insert an entry at the head of `queue`; returns the assigned id.
    async fn unshift_entry(&self, queue: &str, entry: NewQueueEntry) -> Result<i64>;

    /// Remove and return the newest entry of `queue`.
    async fn pop_entry(&self, queue: &str) -> Result<Option<QueueEntry>>;

    /// Remove and return the oldest entry of `queue`.
    async fn shift_entry(&self, queue: &str) -> Result<Option<QueueEntry>>;

    /// All entries of `queue`, oldest first.
    async fn entries(&self, queue: &str) -> Result<Vec<QueueEntry>>;

    async fn size(&self, queue: &str) -> Result<usize>;

    async fn delete_entry(&self, queue: &str, id: i64) -> Result<()>;
}
