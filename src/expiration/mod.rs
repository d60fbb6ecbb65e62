//! Cache expiration: bound a bucket by entry count and/or entry age.
//!
//! Every read hit and every write records an access timestamp for the URL in
//! the durable store. A sweep walks the bucket's timestamps newest-first and
//! deletes, from both the store and cache storage, every entry older than the
//! maximum age or beyond the maximum count.

use crate::backend::{CacheStorage, MatchOptions};
use crate::context::CacheContext;
use crate::error::{Error, Result};
use crate::http::strip_fragment;
use crate::observability::CacheMetrics;
use crate::store::ExpirationRepository;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub mod plugin;

pub use plugin::ExpirationPlugin;

/// Bounds of one bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpirationConfig {
    pub max_entries: Option<usize>,
    pub max_age: Option<Duration>,
    /// Used when deleting expired entries from cache storage.
    pub match_options: MatchOptions,
    /// Delete every managed bucket when storage runs out of quota.
    pub purge_on_quota_error: bool,
}

impl ExpirationConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_age_seconds(self, seconds: u64) -> Self {
        self.with_max_age(Duration::from_secs(seconds))
    }

    pub fn with_match_options(mut self, match_options: MatchOptions) -> Self {
        self.match_options = match_options;
        self
    }

    pub fn with_purge_on_quota_error(mut self, purge: bool) -> Self {
        self.purge_on_quota_error = purge;
        self
    }

    /// # Errors
    ///
    /// Returns `Error::ExpirationConfigInvalid` when neither bound is set.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries.is_none() && self.max_age.is_none() {
            return Err(Error::ExpirationConfigInvalid);
        }
        Ok(())
    }

    fn max_age_millis(&self) -> Option<i64> {
        self.max_age.map(|age| age.as_millis() as i64)
    }
}

#[derive(Default)]
struct SweepState {
    running: bool,
    rerun: bool,
}

/// Clears the running flag of a sweep that ends early, by error or because
/// its future was dropped.
struct SweepGuard<'a> {
    state: &'a Mutex<SweepState>,
    finished: bool,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.state.lock();
            state.running = false;
            state.rerun = false;
        }
    }
}

/// Expiration manager of one bucket.
pub struct CacheExpiration {
    cache_name: String,
    config: ExpirationConfig,
    repository: Arc<dyn ExpirationRepository>,
    storage: Arc<dyn CacheStorage>,
    metrics: Arc<dyn CacheMetrics>,
    sweep: Mutex<SweepState>,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalized form of a URL as stored in expiration records.
pub fn normalize_url(url: &Url) -> String {
    strip_fragment(url).to_string()
}

impl CacheExpiration {
    /// # Errors
    ///
    /// Returns `Error::ExpirationConfigInvalid` when neither bound is set.
    pub fn new(
        context: &CacheContext,
        cache_name: impl Into<String>,
        config: ExpirationConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(CacheExpiration {
            cache_name: cache_name.into(),
            config,
            repository: Arc::clone(&context.expirations),
            storage: Arc::clone(&context.storage),
            metrics: Arc::clone(&context.metrics),
            sweep: Mutex::new(SweepState::default()),
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn config(&self) -> &ExpirationConfig {
        &self.config
    }

    /// Record an access to `url` now.
    pub async fn update_timestamp(&self, url: &Url) -> Result<()> {
        self.repository
            .set_timestamp(&self.cache_name, &normalize_url(url), now_millis())
            .await
    }

    /// Delete expired entries; returns the URLs deleted.
    ///
    /// A call made while a sweep is running returns immediately and makes the
    /// running sweep go around once more.
    pub async fn expire_entries(&self) -> Result<Vec<String>> {
        {
            let mut state = self.sweep.lock();
            if state.running {
                state.rerun = true;
                debug!("Sweep of {} already running, rerun requested", self.cache_name);
                return Ok(Vec::new());
            }
            state.running = true;
        }

        let mut guard = SweepGuard {
            state: &self.sweep,
            finished: false,
        };
        let mut expired = Vec::new();
        loop {
            expired.extend(self.sweep_once().await?);

            let mut state = self.sweep.lock();
            if !state.rerun {
                state.running = false;
                guard.finished = true;
                break;
            }
            state.rerun = false;
        }
        Ok(expired)
    }

    async fn sweep_once(&self) -> Result<Vec<String>> {
        let min_timestamp = self
            .config
            .max_age_millis()
            .map(|age| now_millis() - age)
            .unwrap_or(0);

        let expired = self
            .repository
            .expire_entries(&self.cache_name, min_timestamp, self.config.max_entries)
            .await?;

        for url in &expired {
            let parsed = Url::parse(url)?;
            self.storage
                .delete_entry(&self.cache_name, &parsed, self.config.match_options)
                .await?;
            self.metrics.record_delete(&self.cache_name, url);
        }

        if !expired.is_empty() {
            info!(
                "Expired {} entr{} from {}",
                expired.len(),
                if expired.len() == 1 { "y" } else { "ies" },
                self.cache_name
            );
        }
        Ok(expired)
    }

    /// Whether `url` was last accessed longer ago than the maximum age.
    ///
    /// Always `false` without a maximum age; `true` for URLs never recorded.
    pub async fn is_url_expired(&self, url: &Url) -> Result<bool> {
        let Some(max_age) = self.config.max_age_millis() else {
            debug!("is_url_expired called on {} without max_age", self.cache_name);
            return Ok(false);
        };
        let timestamp = self
            .repository
            .get_timestamp(&self.cache_name, &normalize_url(url))
            .await?;
        Ok(match timestamp {
            Some(timestamp) => timestamp < now_millis() - max_age,
            None => true,
        })
    }

    /// Drop every expiration record of the bucket.
    pub async fn delete(&self) -> Result<()> {
        self.sweep.lock().rerun = false;
        let removed = self.repository.delete_bucket(&self.cache_name).await?;
        debug!("Deleted {} expiration records of {}", removed, self.cache_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use crate::strategies::test_support::{fixture, url};

    const BUCKET: &str = "images";

    async fn seed(fx: &crate::strategies::test_support::Fixture, path: &str, age: Duration) {
        fx.storage
            .put(BUCKET, &url(path), Response::ok(path))
            .await
            .unwrap();
        fx.store
            .set_timestamp(
                BUCKET,
                &normalize_url(&url(path)),
                now_millis() - age.as_millis() as i64,
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_requires_a_bound() {
        assert!(matches!(
            ExpirationConfig::default().validate(),
            Err(Error::ExpirationConfigInvalid)
        ));
    }

    #[tokio::test]
    async fn test_count_bound_evicts_oldest() {
        let fx = fixture();
        seed(&fx, "/1", Duration::from_secs(30)).await;
        seed(&fx, "/2", Duration::from_secs(20)).await;
        seed(&fx, "/3", Duration::from_secs(10)).await;

        let expiration = CacheExpiration::new(
            &fx.context,
            BUCKET,
            ExpirationConfig::default().with_max_entries(2),
        )
        .unwrap();
        let expired = expiration.expire_entries().await.expect("Failed to expire");

        assert_eq!(expired, vec!["https://example.com/1".to_string()]);
        let mut keys = fx.storage.keys(BUCKET).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["https://example.com/2", "https://example.com/3"]);
    }

    #[tokio::test]
    async fn test_age_bound() {
        let fx = fixture();
        seed(&fx, "/old", Duration::from_secs(61)).await;
        seed(&fx, "/recent", Duration::from_secs(59)).await;

        let expiration = CacheExpiration::new(
            &fx.context,
            BUCKET,
            ExpirationConfig::default().with_max_age_seconds(60),
        )
        .unwrap();

        assert!(expiration.is_url_expired(&url("/old")).await.unwrap());
        assert!(!expiration.is_url_expired(&url("/recent")).await.unwrap());

        expiration.expire_entries().await.expect("Failed to expire");
        assert_eq!(fx.storage.keys(BUCKET).await.unwrap(), vec!["https://example.com/recent"]);
        assert!(fx
            .store
            .get_timestamp(BUCKET, "https://example.com/old")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_timestamp_strips_fragment() {
        let fx = fixture();
        let expiration = CacheExpiration::new(
            &fx.context,
            BUCKET,
            ExpirationConfig::default().with_max_entries(5),
        )
        .unwrap();

        expiration.update_timestamp(&url("/a#section")).await.unwrap();
        assert!(fx
            .store
            .get_timestamp(BUCKET, "https://example.com/a")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_coalesce() {
        let fx = fixture();
        for i in 0..5 {
            seed(&fx, &format!("/{}", i), Duration::from_secs(100 - i)).await;
        }
        let expiration = Arc::new(
            CacheExpiration::new(
                &fx.context,
                BUCKET,
                ExpirationConfig::default().with_max_entries(1),
            )
            .unwrap(),
        );

        let a = tokio::spawn({
            let expiration = Arc::clone(&expiration);
            async move { expiration.expire_entries().await }
        });
        let b = tokio::spawn({
            let expiration = Arc::clone(&expiration);
            async move { expiration.expire_entries().await }
        });
        let total = a.await.unwrap().unwrap().len() + b.await.unwrap().unwrap().len();

        assert_eq!(total, 4);
        assert_eq!(fx.storage.keys(BUCKET).await.unwrap(), vec!["https://example.com/4"]);
    }

    /// Repository whose first sweep never completes.
    struct StallOnce {
        inner: Arc<dyn ExpirationRepository>,
        stalled: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ExpirationRepository for StallOnce {
        async fn set_timestamp(&self, bucket: &str, url: &str, timestamp: i64) -> Result<()> {
            self.inner.set_timestamp(bucket, url, timestamp).await
        }

        async fn get_timestamp(&self, bucket: &str, url: &str) -> Result<Option<i64>> {
            self.inner.get_timestamp(bucket, url).await
        }

        async fn expire_entries(
            &self,
            bucket: &str,
            min_timestamp: i64,
            max_count: Option<usize>,
        ) -> Result<Vec<String>> {
            if !self.stalled.swap(true, std::sync::atomic::Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            self.inner.expire_entries(bucket, min_timestamp, max_count).await
        }

        async fn records(&self, bucket: &str) -> Result<Vec<crate::store::ExpirationRecord>> {
            self.inner.records(bucket).await
        }

        async fn delete_bucket(&self, bucket: &str) -> Result<usize> {
            self.inner.delete_bucket(bucket).await
        }
    }

    #[tokio::test]
    async fn test_dropped_sweep_does_not_block_later_sweeps() {
        use futures::FutureExt;

        let fx = fixture();
        seed(&fx, "/old", Duration::from_secs(20)).await;
        seed(&fx, "/new", Duration::from_secs(10)).await;

        let mut context = fx.context.clone();
        context.expirations = Arc::new(StallOnce {
            inner: Arc::clone(&fx.context.expirations),
            stalled: std::sync::atomic::AtomicBool::new(false),
        });
        let expiration = CacheExpiration::new(
            &context,
            BUCKET,
            ExpirationConfig::default().with_max_entries(1),
        )
        .unwrap();

        assert!(expiration.expire_entries().now_or_never().is_none());

        let expired = expiration.expire_entries().await.expect("Failed to expire");
        assert_eq!(expired, vec!["https://example.com/old".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_drops_records() {
        let fx = fixture();
        seed(&fx, "/a", Duration::from_secs(1)).await;
        let expiration = CacheExpiration::new(
            &fx.context,
            BUCKET,
            ExpirationConfig::default().with_max_entries(1),
        )
        .unwrap();

        expiration.delete().await.unwrap();
        assert!(fx.store.records(BUCKET).await.unwrap().is_empty());
    }
}
