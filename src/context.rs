//! Shared services every strategy and plugin works against.

use crate::backend::CacheStorage;
use crate::config::{CacheNames, EngineConfig};
use crate::fetch::Fetcher;
use crate::observability::{CacheMetrics, LogMetrics};
use crate::quota::QuotaCallbacks;
use crate::store::ExpirationRepository;
use std::sync::Arc;

/// Handles to cache storage, the network, the durable store and the quota
/// callbacks. Cheap to clone.
#[derive(Clone)]
pub struct CacheContext {
    pub storage: Arc<dyn CacheStorage>,
    pub fetcher: Arc<dyn Fetcher>,
    pub expirations: Arc<dyn ExpirationRepository>,
    pub quota: QuotaCallbacks,
    pub metrics: Arc<dyn CacheMetrics>,
    pub cache_names: CacheNames,
}

impl CacheContext {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        expirations: Arc<dyn ExpirationRepository>,
    ) -> Self {
        CacheContext {
            storage,
            fetcher,
            expirations,
            quota: QuotaCallbacks::new(),
            metrics: Arc::new(LogMetrics),
            cache_names: EngineConfig::default().cache_names(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_cache_names(mut self, cache_names: CacheNames) -> Self {
        self.cache_names = cache_names;
        self
    }

    pub fn with_quota(mut self, quota: QuotaCallbacks) -> Self {
        self.quota = quota;
        self
    }
}
