//! Observability and metrics collection for cache operations.
//!
//! Implement the `CacheMetrics` trait to feed cache behavior into your
//! monitoring system:
//!
//! ```ignore
//! use offline_kit::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, bucket: &str, key: &str, duration: Duration) {
//!         // counter!("offline_cache_hits", "bucket" => bucket).inc();
//!     }
//!     // ... implement other methods
//! }
//!
//! let engine = OfflineEngine::builder(config)
//!     .with_metrics(Arc::new(PrometheusMetrics))
//!     .build()?;
//! ```
//!
//! # Metrics Methods
//!
//! - `record_hit()` - cache read found an entry
//! - `record_miss()` - cache read found nothing
//! - `record_put()` - response written to a bucket
//! - `record_delete()` - entry evicted or removed
//! - `record_error()` - operation failure with error message
//!
//! The engine defaults to `LogMetrics`, which logs through the `log` crate;
//! `CounterMetrics` keeps in-process counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, bucket: &str, key: &str, duration: Duration) {
        debug!("Cache HIT: {} in {} took {:?}", key, bucket, duration);
    }

    /// Record a cache miss.
    fn record_miss(&self, bucket: &str, key: &str, duration: Duration) {
        debug!("Cache MISS: {} in {} took {:?}", key, bucket, duration);
    }

    /// Record a cache write.
    fn record_put(&self, bucket: &str, key: &str, duration: Duration) {
        debug!("Cache PUT: {} in {} took {:?}", key, bucket, duration);
    }

    /// Record an eviction or delete.
    fn record_delete(&self, bucket: &str, key: &str) {
        debug!("Cache DELETE: {} from {}", key, bucket);
    }

    /// Record an error.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Metrics that only log (the trait defaults).
#[derive(Clone, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}

/// Metrics implementation that records nothing.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _bucket: &str, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _bucket: &str, _key: &str, _duration: Duration) {}
    fn record_put(&self, _bucket: &str, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _bucket: &str, _key: &str) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

/// In-process counters, handy for tests and simple status pages.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub puts: AtomicU64,
    pub deletes: AtomicU64,
    pub errors: AtomicU64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// (hits, misses, puts, deletes, errors)
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.puts.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

impl CacheMetrics for CounterMetrics {
    fn record_hit(&self, _bucket: &str, _key: &str, _duration: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self, _bucket: &str, _key: &str, _duration: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_put(&self, _bucket: &str, _key: &str, _duration: Duration) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delete(&self, _bucket: &str, _key: &str) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_metrics() {
        let metrics = NoOpMetrics;
        metrics.record_hit("runtime", "key", Duration::from_secs(1));
        metrics.record_miss("runtime", "key", Duration::from_secs(2));
    }

    #[test]
    fn test_counter_metrics() {
        let metrics = CounterMetrics::new();
        metrics.record_hit("runtime", "a", Duration::ZERO);
        metrics.record_hit("runtime", "b", Duration::ZERO);
        metrics.record_miss("runtime", "c", Duration::ZERO);
        metrics.record_delete("runtime", "a");
        metrics.record_error("d", "offline");

        assert_eq!(metrics.snapshot(), (2, 1, 0, 1, 1));
    }
}
