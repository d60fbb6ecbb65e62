//! Engine configuration.
//!
//! Configuration is plain data: it can be built in code with the `with_*`
//! builders or loaded from JSON. Every field has a default, so a JSON file only
//! needs the fields it changes:
//!
//! ```json
//! {
//!   "scope": "https://app.example.com/",
//!   "version": "2024.06.1",
//!   "precache_route": { "clean_urls": false }
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default retention of queued requests: 7 days.
pub const DEFAULT_QUEUE_RETENTION_MINUTES: u64 = 60 * 24 * 7;

/// Options of the precache route's URL variation matching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecacheRouteOptions {
    /// Regular expressions; matching search parameter names are dropped
    /// before lookup.
    pub ignore_url_parameters_matching: Vec<String>,
    /// File appended to URLs ending in `/`.
    pub directory_index: Option<String>,
    /// Also try the URL with `.html` appended.
    pub clean_urls: bool,
}

impl Default for PrecacheRouteOptions {
    fn default() -> Self {
        PrecacheRouteOptions {
            ignore_url_parameters_matching: vec!["^utm_".to_string(), "^fbclid$".to_string()],
            directory_index: Some("index.html".to_string()),
            clean_urls: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Absolute URL the engine controls; relative URLs resolve against it.
    pub scope: String,
    pub cache_prefix: String,
    pub cache_suffix: String,
    pub precache_name: String,
    pub runtime_name: String,
    /// Version string reported by `GET_VERSION`.
    pub version: String,
    /// Delete precache buckets of older versions on activation.
    pub cleanup_outdated_caches: bool,
    pub precache_route: PrecacheRouteOptions,
    pub queue_retention_minutes: u64,
    /// Timeout of the default HTTP fetcher, in seconds.
    pub fetch_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            scope: "http://localhost/".to_string(),
            cache_prefix: "offline-kit".to_string(),
            cache_suffix: String::new(),
            precache_name: "precache-v2".to_string(),
            runtime_name: "runtime".to_string(),
            version: crate::VERSION.to_string(),
            cleanup_outdated_caches: false,
            precache_route: PrecacheRouteOptions::default(),
            queue_retention_minutes: DEFAULT_QUEUE_RETENTION_MINUTES,
            fetch_timeout_secs: Some(30),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeserializationError` for malformed JSON and
    /// `Error::ConfigError` if the result does not validate.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        debug!("Loaded engine config from {}", path.display());
        Self::from_json_str(&contents)
    }

    /// Check the fields that can be wrong.
    pub fn validate(&self) -> Result<()> {
        let scope = self.scope_url()?;
        if scope.cannot_be_a_base() {
            return Err(Error::ConfigError(format!(
                "Scope must be a base URL: {}",
                self.scope
            )));
        }
        if self.precache_name.is_empty() || self.runtime_name.is_empty() {
            return Err(Error::ConfigError(
                "Cache names must not be empty".to_string(),
            ));
        }
        for pattern in &self.precache_route.ignore_url_parameters_matching {
            regex::Regex::new(pattern).map_err(|e| {
                Error::ConfigError(format!("Invalid ignore pattern {}: {}", pattern, e))
            })?;
        }
        Ok(())
    }

    /// The parsed scope URL.
    pub fn scope_url(&self) -> Result<Url> {
        Url::parse(&self.scope)
            .map_err(|e| Error::ConfigError(format!("Invalid scope {}: {}", self.scope, e)))
    }

    /// Bucket names derived from prefix, suffix and base names.
    pub fn cache_names(&self) -> CacheNames {
        CacheNames {
            precache: join_name(&self.cache_prefix, &self.precache_name, &self.cache_suffix),
            runtime: join_name(&self.cache_prefix, &self.runtime_name, &self.cache_suffix),
            prefix: self.cache_prefix.clone(),
            suffix: self.cache_suffix.clone(),
        }
    }

    pub fn queue_retention(&self) -> Duration {
        Duration::from_secs(self.queue_retention_minutes * 60)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_secs.map(Duration::from_secs)
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    pub fn with_cache_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.cache_suffix = suffix.into();
        self
    }

    pub fn with_precache_name(mut self, name: impl Into<String>) -> Self {
        self.precache_name = name.into();
        self
    }

    pub fn with_runtime_name(mut self, name: impl Into<String>) -> Self {
        self.runtime_name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_cleanup_outdated_caches(mut self, enabled: bool) -> Self {
        self.cleanup_outdated_caches = enabled;
        self
    }

    pub fn with_precache_route(mut self, options: PrecacheRouteOptions) -> Self {
        self.precache_route = options;
        self
    }

    pub fn with_queue_retention_minutes(mut self, minutes: u64) -> Self {
        self.queue_retention_minutes = minutes;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout_secs = timeout.map(|d| d.as_secs());
        self
    }
}

/// Resolved bucket names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheNames {
    pub precache: String,
    pub runtime: String,
    pub prefix: String,
    pub suffix: String,
}

impl CacheNames {
    /// Full bucket name for a caller-chosen base name.
    pub fn custom(&self, name: &str) -> String {
        join_name(&self.prefix, name, &self.suffix)
    }
}

fn join_name(prefix: &str, name: &str, suffix: &str) -> String {
    [prefix, name, suffix]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
}
