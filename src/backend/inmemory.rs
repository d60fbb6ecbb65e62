//! In-memory cache storage (default, thread-safe, async).
//!
//! Uses DashMap for lock-free concurrent access: one map of buckets, each
//! bucket its own sharded map of entries.

use super::{storage_key, CacheRecord, CacheStorage, MatchOptions};
use crate::error::{Error, Result};
use crate::http::Response;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

type Bucket = Arc<DashMap<String, CacheRecord>>;

/// Thread-safe async in-memory cache storage.
///
/// Optionally bounded by a byte quota (sum of stored body sizes); a write that
/// would exceed it fails with `Error::QuotaExceeded`.
///
/// # Example
///
/// ```no_run
/// use offline_kit::backend::{CacheStorage, InMemoryCacheStorage, MatchOptions};
/// use offline_kit::http::Response;
/// use url::Url;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let storage = InMemoryCacheStorage::new();
///     let url = Url::parse("https://example.com/app.js")?;
///
///     storage.put("static", &url, Response::ok("console.log(1)")).await?;
///     let hit = storage.match_in("static", &url, MatchOptions::default()).await?;
///     assert!(hit.is_some());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryCacheStorage {
    buckets: Arc<DashMap<String, Bucket>>,
    usage: Arc<AtomicUsize>,
    quota: Option<usize>,
}

impl InMemoryCacheStorage {
    /// Create an unbounded storage.
    pub fn new() -> Self {
        InMemoryCacheStorage {
            buckets: Arc::new(DashMap::new()),
            usage: Arc::new(AtomicUsize::new(0)),
            quota: None,
        }
    }

    /// Create a storage that refuses writes beyond `bytes` of stored bodies.
    pub fn with_quota(bytes: usize) -> Self {
        InMemoryCacheStorage {
            quota: Some(bytes),
            ..Self::new()
        }
    }

    /// Bytes of response bodies currently stored.
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::SeqCst)
    }

    /// Number of entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket(&self, name: &str) -> Option<Bucket> {
        self.buckets.get(name).map(|b| Arc::clone(b.value()))
    }

    fn remove_record(&self, bucket: &Bucket, key: &str) -> bool {
        match bucket.remove(key) {
            Some((_, record)) => {
                self.usage
                    .fetch_sub(record.response.body.len(), Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryCacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn without_search(key: &str) -> &str {
    key.split_once('?').map(|(base, _)| base).unwrap_or(key)
}

#[async_trait]
impl CacheStorage for InMemoryCacheStorage {
    async fn open(&self, bucket: &str) -> Result<()> {
        self.buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()));
        Ok(())
    }

    async fn has(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.contains_key(bucket))
    }

    async fn delete(&self, bucket: &str) -> Result<bool> {
        match self.buckets.remove(bucket) {
            Some((_, entries)) => {
                let freed: usize = entries.iter().map(|r| r.response.body.len()).sum();
                self.usage.fetch_sub(freed, Ordering::SeqCst);
                warn!("⚠ InMemory DELETE bucket {} ({} entries)", bucket, entries.len());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn bucket_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.buckets.iter().map(|b| b.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn match_in(
        &self,
        bucket: &str,
        key: &Url,
        options: MatchOptions,
    ) -> Result<Option<Response>> {
        let Some(entries) = self.bucket(bucket) else {
            return Ok(None);
        };
        let key = storage_key(key);

        if !options.ignore_search {
            let hit = entries.get(&key).map(|r| r.response.clone());
            debug!(
                "✓ InMemory MATCH {} in {} -> {}",
                key,
                bucket,
                if hit.is_some() { "HIT" } else { "MISS" }
            );
            return Ok(hit);
        }

        let wanted = without_search(&key);
        let hit = entries
            .iter()
            .find(|r| without_search(r.key()) == wanted)
            .map(|r| r.response.clone());
        Ok(hit)
    }

    async fn put(&self, bucket: &str, key: &Url, response: Response) -> Result<()> {
        let key = storage_key(key);
        let size = response.body.len();
        let entries = match self.bucket(bucket) {
            Some(entries) => entries,
            None => {
                self.open(bucket).await?;
                self.bucket(bucket)
                    .ok_or_else(|| Error::StorageError(format!("Bucket vanished: {}", bucket)))?
            }
        };

        let replaced = entries
            .get(&key)
            .map(|r| r.response.body.len())
            .unwrap_or(0);
        if let Some(quota) = self.quota {
            let projected = self.usage().saturating_sub(replaced) + size;
            if projected > quota {
                warn!(
                    "⚠ InMemory PUT {} in {} refused: {} bytes over quota {}",
                    key, bucket, projected, quota
                );
                return Err(Error::QuotaExceeded {
                    bucket: bucket.to_string(),
                });
            }
        }

        let record = CacheRecord {
            cache_key: key.clone(),
            response,
            bucket: bucket.to_string(),
            stored_at: chrono::Utc::now().timestamp_millis(),
        };
        if let Some(old) = entries.insert(key.clone(), record) {
            self.usage
                .fetch_sub(old.response.body.len(), Ordering::SeqCst);
        }
        self.usage.fetch_add(size, Ordering::SeqCst);
        debug!("✓ InMemory PUT {} in {} ({} bytes)", key, bucket, size);
        Ok(())
    }

    async fn delete_entry(&self, bucket: &str, key: &Url, options: MatchOptions) -> Result<bool> {
        let Some(entries) = self.bucket(bucket) else {
            return Ok(false);
        };
        let key = storage_key(key);

        let deleted = if options.ignore_search {
            let wanted = without_search(&key).to_string();
            let matching: Vec<String> = entries
                .iter()
                .filter(|r| without_search(r.key()) == wanted)
                .map(|r| r.key().clone())
                .collect();
            let mut any = false;
            for k in matching {
                any |= self.remove_record(&entries, &k);
            }
            any
        } else {
            self.remove_record(&entries, &key)
        };

        if deleted {
            debug!("✓ InMemory DELETE {} from {}", key, bucket);
        }
        Ok(deleted)
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        Ok(self
            .bucket(bucket)
            .map(|entries| entries.iter().map(|r| r.key().clone()).collect())
            .unwrap_or_default())
    }

    async fn records(&self, bucket: &str) -> Result<Vec<CacheRecord>> {
        Ok(self
            .bucket(bucket)
            .map(|entries| entries.iter().map(|r| r.value().clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://example.com{}", path)).unwrap()
    }

    #[tokio::test]
    async fn test_put_match_roundtrip_is_byte_identical() {
        let storage = InMemoryCacheStorage::new();
        let response = Response::ok(vec![0u8, 159, 146, 150]).with_header("Content-Type", "x");
        storage
            .put("runtime", &url("/bin"), response.clone())
            .await
            .expect("Failed to put");

        let hit = storage
            .match_in("runtime", &url("/bin"), MatchOptions::default())
            .await
            .expect("Failed to match");
        assert_eq!(hit, Some(response));
    }

    #[tokio::test]
    async fn test_miss_on_unknown_bucket() {
        let storage = InMemoryCacheStorage::new();
        let hit = storage
            .match_in("nope", &url("/a"), MatchOptions::default())
            .await
            .expect("Failed to match");
        assert!(hit.is_none());
        assert!(!storage.has("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_ignore_search() {
        let storage = InMemoryCacheStorage::new();
        storage
            .put("runtime", &url("/a?v=1"), Response::ok("a"))
            .await
            .unwrap();

        let strict = storage
            .match_in("runtime", &url("/a"), MatchOptions::default())
            .await
            .unwrap();
        assert!(strict.is_none());

        let loose = storage
            .match_in("runtime", &url("/a"), MatchOptions::ignoring_search())
            .await
            .unwrap();
        assert!(loose.is_some());

        assert!(storage
            .delete_entry("runtime", &url("/a?v=2"), MatchOptions::ignoring_search())
            .await
            .unwrap());
        assert!(storage.keys("runtime").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let storage = InMemoryCacheStorage::with_quota(8);
        storage
            .put("runtime", &url("/a"), Response::ok("12345"))
            .await
            .unwrap();

        let err = storage
            .put("runtime", &url("/b"), Response::ok("12345"))
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());

        // Replacing an entry only counts the difference.
        storage
            .put("runtime", &url("/a"), Response::ok("1234567"))
            .await
            .unwrap();
        assert_eq!(storage.usage(), 7);
    }

    #[tokio::test]
    async fn test_delete_bucket_frees_usage() {
        let storage = InMemoryCacheStorage::new();
        storage
            .put("runtime", &url("/a"), Response::ok("abc"))
            .await
            .unwrap();
        assert_eq!(storage.usage(), 3);

        assert!(storage.delete("runtime").await.unwrap());
        assert_eq!(storage.usage(), 0);
        assert!(storage.bucket_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_puts() {
        let storage = InMemoryCacheStorage::new();
        let mut handles = vec![];

        for i in 0..10 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .put("runtime", &url(&format!("/{}", i)), Response::ok("x"))
                    .await
                    .expect("Failed to put");
            }));
        }

        for handle in handles {
            handle.await.expect("Task failed");
        }

        assert_eq!(storage.len(), 10);
    }
}
