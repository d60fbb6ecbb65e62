//! In-memory and file-backed implementation of the durable entry store.
//!
//! All mutations go through one async mutex, so writes to a bucket or queue
//! are serialized. When the store is backed by a file, every mutation is
//! applied to a copy of the tables, the copy is written to `<path>.tmp` and
//! renamed over `<path>`, and only then does the copy replace the live
//! tables. A failed write leaves both the file and memory untouched.

use super::{ExpirationRecord, ExpirationRepository, NewQueueEntry, QueueEntry, QueueRepository};
use crate::error::{Error, Result};
use crate::serialization::{deserialize_from_store, serialize_for_store};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TimestampRow {
    record: ExpirationRecord,
    /// Write sequence; orders records that share a timestamp.
    seq: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    timestamps: BTreeMap<String, TimestampRow>,
    requests: BTreeMap<(String, i64), QueueEntry>,
    next_id: i64,
    next_seq: u64,
}

impl Tables {
    fn queue_range(&self, queue: &str) -> impl DoubleEndedIterator<Item = &QueueEntry> {
        self.requests
            .range((queue.to_string(), i64::MIN)..=(queue.to_string(), i64::MAX))
            .map(|(_, entry)| entry)
    }

    fn take(&mut self, queue: &str, id: i64) -> Option<QueueEntry> {
        self.requests.remove(&(queue.to_string(), id))
    }

    fn insert_entry(&mut self, queue: &str, id: i64, entry: NewQueueEntry) {
        self.requests.insert(
            (queue.to_string(), id),
            QueueEntry {
                id,
                queue_name: queue.to_string(),
                request: entry.request,
                timestamp: entry.timestamp,
                metadata: entry.metadata,
            },
        );
    }

    fn bucket_rows_newest_first(&self, bucket: &str) -> Vec<&TimestampRow> {
        let mut rows: Vec<&TimestampRow> = self
            .timestamps
            .values()
            .filter(|row| row.record.bucket == bucket)
            .collect();
        rows.sort_by(|a, b| {
            (b.record.timestamp, b.seq).cmp(&(a.record.timestamp, a.seq))
        });
        rows
    }
}

struct StoreInner {
    tables: Mutex<Tables>,
    path: Option<PathBuf>,
}

/// Durable entry store implementing [`ExpirationRepository`] and [`QueueRepository`].
///
/// Cheap to clone: clones share the same tables.
///
/// # Example
///
/// ```no_run
/// use offline_kit::store::{EntryStore, ExpirationRepository};
///
/// #[tokio::main]
/// async fn main() -> offline_kit::Result<()> {
///     let store = EntryStore::open("/var/lib/app/offline.store").await?;
///     store.set_timestamp("runtime", "https://example.com/a", 1_700_000_000_000).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct EntryStore {
    inner: Arc<StoreInner>,
}

impl EntryStore {
    /// Create a store that lives only in memory.
    pub fn in_memory() -> Self {
        EntryStore {
            inner: Arc::new(StoreInner {
                tables: Mutex::new(Tables::default()),
                path: None,
            }),
        }
    }

    /// Open (or create) a store persisted at `path`.
    ///
    /// A file written by an incompatible schema version is discarded with a
    /// warning and the store starts empty.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageError` if the file exists but cannot be read.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => match deserialize_from_store::<Tables>(&bytes) {
                Ok(tables) => {
                    info!(
                        "✓ Opened entry store {} ({} timestamps, {} queued requests)",
                        path.display(),
                        tables.timestamps.len(),
                        tables.requests.len()
                    );
                    tables
                }
                Err(e) => {
                    warn!(
                        "⚠ Discarding unreadable entry store {}: {}",
                        path.display(),
                        e
                    );
                    Tables::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                debug!("Creating entry store {}", path.display());
                Tables::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(EntryStore {
            inner: Arc::new(StoreInner {
                tables: Mutex::new(tables),
                path: Some(path),
            }),
        })
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.inner.tables.lock().await;
        f(&tables)
    }

    async fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables = self.inner.tables.lock().await;
        match &self.inner.path {
            None => Ok(f(&mut tables)),
            Some(path) => {
                let mut next = tables.clone();
                let out = f(&mut next);
                persist(path, &next).await?;
                *tables = next;
                Ok(out)
            }
        }
    }
}

async fn persist(path: &Path, tables: &Tables) -> Result<()> {
    let bytes = serialize_for_store(tables)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
        error!("Entry store write failed for {}: {}", tmp.display(), e);
        Error::StorageError(e.to_string())
    })?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ExpirationRepository for EntryStore {
    async fn set_timestamp(&self, bucket: &str, url: &str, timestamp: i64) -> Result<()> {
        let id = ExpirationRecord::id(bucket, url);
        let record = ExpirationRecord {
            bucket: bucket.to_string(),
            url: url.to_string(),
            timestamp,
        };
        self.write(move |tables| {
            let seq = tables.next_seq;
            tables.next_seq += 1;
            tables.timestamps.insert(id, TimestampRow { record, seq });
        })
        .await
    }

    async fn get_timestamp(&self, bucket: &str, url: &str) -> Result<Option<i64>> {
        let id = ExpirationRecord::id(bucket, url);
        Ok(self
            .read(|tables| tables.timestamps.get(&id).map(|row| row.record.timestamp))
            .await)
    }

    async fn expire_entries(
        &self,
        bucket: &str,
        min_timestamp: i64,
        max_count: Option<usize>,
    ) -> Result<Vec<String>> {
        self.write(|tables| {
            let mut kept = 0usize;
            let mut expired = Vec::new();
            for row in tables.bucket_rows_newest_first(bucket) {
                let too_old = min_timestamp > 0 && row.record.timestamp < min_timestamp;
                let too_many = max_count.is_some_and(|max| kept >= max);
                if too_old || too_many {
                    expired.push(row.record.url.clone());
                } else {
                    kept += 1;
                }
            }
            for url in &expired {
                tables.timestamps.remove(&ExpirationRecord::id(bucket, url));
            }
            expired
        })
        .await
    }

    async fn records(&self, bucket: &str) -> Result<Vec<ExpirationRecord>> {
        Ok(self
            .read(|tables| {
                tables
                    .bucket_rows_newest_first(bucket)
                    .into_iter()
                    .map(|row| row.record.clone())
                    .collect()
            })
            .await)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<usize> {
        self.write(|tables| {
            let before = tables.timestamps.len();
            tables
                .timestamps
                .retain(|_, row| row.record.bucket != bucket);
            before - tables.timestamps.len()
        })
        .await
    }
}

#[async_trait]
impl QueueRepository for EntryStore {
    async fn push_entry(&self, queue: &str, entry: NewQueueEntry) -> Result<i64> {
        self.write(|tables| {
            let last = tables.queue_range(queue).next_back().map(|e| e.id);
            let id = match last {
                Some(last) if last >= tables.next_id => last + 1,
                _ => tables.next_id,
            };
            tables.next_id = id + 1;
            tables.insert_entry(queue, id, entry);
            id
        })
        .await
    }

    async fn unshift_entry(&self, queue: &str, entry: NewQueueEntry) -> Result<i64> {
        self.write(|tables| {
            let first = tables.queue_range(queue).next().map(|e| e.id);
            let id = match first {
                Some(first) => first - 1,
                None => {
                    let id = tables.next_id;
                    tables.next_id += 1;
                    id
                }
            };
            tables.insert_entry(queue, id, entry);
            id
        })
        .await
    }

    async fn pop_entry(&self, queue: &str) -> Result<Option<QueueEntry>> {
        self.write(|tables| {
            let last = tables.queue_range(queue).next_back().map(|e| e.id)?;
            tables.take(queue, last)
        })
        .await
    }

    async fn shift_entry(&self, queue: &str) -> Result<Option<QueueEntry>> {
        self.write(|tables| {
            let first = tables.queue_range(queue).next().map(|e| e.id)?;
            tables.take(queue, first)
        })
        .await
    }

    async fn entries(&self, queue: &str) -> Result<Vec<QueueEntry>> {
        Ok(self
            .read(|tables| tables.queue_range(queue).cloned().collect())
            .await)
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        Ok(self.read(|tables| tables.queue_range(queue).count()).await)
    }

    async fn delete_entry(&self, queue: &str, id: i64) -> Result<()> {
        self.write(|tables| {
            tables.take(queue, id);
        })
        .await
    }
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_sync::StorableRequest;
    use crate::store::EntryMetadata;
    use crate::http::Request;

    fn new_entry(url: &str, timestamp: i64) -> NewQueueEntry {
        let request = Request::parse_get(url).unwrap();
        NewQueueEntry {
            request: StorableRequest::from_request(&request),
            timestamp,
            metadata: EntryMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_queue_fifo_order() {
        let store = EntryStore::in_memory();
        for n in 1..=3 {
            store
                .push_entry("outbox", new_entry(&format!("https://example.com/{}", n), n))
                .await
                .unwrap();
        }

        let mut urls = Vec::new();
        while let Some(entry) = store.shift_entry("outbox").await.unwrap() {
            urls.push(entry.request.url.clone());
        }
        assert_eq!(
            urls,
            vec![
                "https://example.com/1",
                "https://example.com/2",
                "https://example.com/3"
            ]
        );
    }

    #[tokio::test]
    async fn test_unshift_goes_before_head() {
        let store = EntryStore::in_memory();
        store
            .push_entry("outbox", new_entry("https://example.com/b", 2))
            .await
            .unwrap();
        store
            .unshift_entry("outbox", new_entry("https://example.com/a", 1))
            .await
            .unwrap();

        let first = store.shift_entry("outbox").await.unwrap().unwrap();
        assert_eq!(first.request.url, "https://example.com/a");
        let last = store.pop_entry("outbox").await.unwrap().unwrap();
        assert_eq!(last.request.url, "https://example.com/b");
        assert_eq!(store.size("outbox").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unshift_into_empty_queue_then_push() {
        let store = EntryStore::in_memory();
        let first = store
            .unshift_entry("outbox", new_entry("https://example.com/a", 1))
            .await
            .unwrap();
        let second = store
            .push_entry("outbox", new_entry("https://example.com/b", 2))
            .await
            .unwrap();
        assert!(second > first);

        let urls: Vec<String> = store
            .entries("outbox")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.request.url)
            .collect();
        assert_eq!(urls, vec!["https://example.com/a", "https://example.com/b"]);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let store = EntryStore::in_memory();
        store
            .push_entry("a", new_entry("https://example.com/a", 1))
            .await
            .unwrap();
        store
            .unshift_entry("b", new_entry("https://example.com/b", 1))
            .await
            .unwrap();

        assert_eq!(store.size("a").await.unwrap(), 1);
        assert_eq!(store.size("b").await.unwrap(), 1);
        assert!(store.shift_entry("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_by_count_keeps_newest() {
        let store = EntryStore::in_memory();
        store.set_timestamp("runtime", "A", 1_000).await.unwrap();
        store.set_timestamp("runtime", "B", 2_000).await.unwrap();
        store.set_timestamp("runtime", "C", 3_000).await.unwrap();
        store.set_timestamp("other", "Z", 1).await.unwrap();

        let expired = store.expire_entries("runtime", 0, Some(2)).await.unwrap();
        assert_eq!(expired, vec!["A".to_string()]);
        assert!(store.get_timestamp("runtime", "A").await.unwrap().is_none());
        assert!(store.get_timestamp("other", "Z").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expire_by_age() {
        let store = EntryStore::in_memory();
        store.set_timestamp("runtime", "old", 100).await.unwrap();
        store.set_timestamp("runtime", "new", 300).await.unwrap();

        let expired = store.expire_entries("runtime", 200, None).await.unwrap();
        assert_eq!(expired, vec!["old".to_string()]);
        assert_eq!(store.records("runtime").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_bucket() {
        let store = EntryStore::in_memory();
        store.set_timestamp("runtime", "A", 1).await.unwrap();
        store.set_timestamp("runtime", "B", 2).await.unwrap();
        assert_eq!(store.delete_bucket("runtime").await.unwrap(), 2);
        assert!(store.records("runtime").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("offline.store");

        {
            let store = EntryStore::open(&path).await.unwrap();
            store
                .push_entry("outbox", new_entry("https://example.com/a", 1))
                .await
                .unwrap();
            store.set_timestamp("runtime", "A", 42).await.unwrap();
        }

        let reopened = EntryStore::open(&path).await.unwrap();
        assert_eq!(reopened.size("outbox").await.unwrap(), 1);
        assert_eq!(
            reopened.get_timestamp("runtime", "A").await.unwrap(),
            Some(42)
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.store");
        tokio::fs::write(&path, b"not a store").await.unwrap();

        let store = EntryStore::open(&path).await.unwrap();
        assert_eq!(store.size("outbox").await.unwrap(), 0);
    }
}
