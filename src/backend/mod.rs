//! Cache storage: named buckets of stored responses.

use crate::error::Result;
use crate::http::Response;
use async_trait::async_trait;
use url::Url;

pub mod inmemory;

pub use inmemory::InMemoryCacheStorage;

/// Options controlling how a stored entry is matched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatchOptions {
    /// Ignore the query string of both the lookup key and stored keys.
    pub ignore_search: bool,
    /// Accepted for parity with platform caches; variant matching is not performed.
    pub ignore_vary: bool,
}

impl MatchOptions {
    pub fn ignoring_search() -> Self {
        MatchOptions {
            ignore_search: true,
            ..Default::default()
        }
    }
}

/// One stored response.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheRecord {
    /// Key the response is stored under (absolute URL, no fragment)
    pub cache_key: String,
    pub response: Response,
    pub bucket: String,
    /// Milliseconds since the Unix epoch
    pub stored_at: i64,
}

/// Trait for cache storage implementations.
///
/// A storage is a set of named buckets; each bucket maps a cache key (an
/// absolute URL) to a response. All methods take `&self`: implementations use
/// interior mutability and must tolerate concurrent callers.
///
/// Implementations: in-memory (provided), or any persistent blob store.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create `bucket` if it does not exist yet.
    async fn open(&self, bucket: &str) -> Result<()>;

    async fn has(&self, bucket: &str) -> Result<bool>;

    /// Delete `bucket` and everything in it; returns whether it existed.
    async fn delete(&self, bucket: &str) -> Result<bool>;

    /// Names of all buckets.
    async fn bucket_names(&self) -> Result<Vec<String>>;

    /// Look up `key` in `bucket`.
    ///
    /// # Returns
    /// - `Ok(Some(response))` - entry found
    /// - `Ok(None)` - no such bucket or entry
    async fn match_in(
        &self,
        bucket: &str,
        key: &Url,
        options: MatchOptions,
    ) -> Result<Option<Response>>;

    /// Look up `key` across all buckets, in bucket-name order.
    async fn match_any(&self, key: &Url, options: MatchOptions) -> Result<Option<Response>> {
        for bucket in self.bucket_names().await? {
            if let Some(response) = self.match_in(&bucket, key, options).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Store `response` under `key`, creating the bucket if needed.
    ///
    /// # Errors
    /// Returns `Error::QuotaExceeded` when the storage is full.
    async fn put(&self, bucket: &str, key: &Url, response: Response) -> Result<()>;

    /// Delete the entry under `key`; returns whether something was deleted.
    async fn delete_entry(&self, bucket: &str, key: &Url, options: MatchOptions) -> Result<bool>;

    /// Cache keys stored in `bucket`.
    async fn keys(&self, bucket: &str) -> Result<Vec<String>>;

    /// All records stored in `bucket`.
    async fn records(&self, bucket: &str) -> Result<Vec<CacheRecord>>;
}

/// Normalized storage key of a URL: the URL without its fragment.
pub fn storage_key(url: &Url) -> String {
    crate::http::strip_fragment(url).to_string()
}
