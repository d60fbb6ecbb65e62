//! Precaching: a versioned manifest of URLs fetched and stored at install
//! time, and served from then on.
//!
//! A manifest entry with a revision is stored under a cache key carrying the
//! revision as the `__revision__` search parameter, so a new revision is a new
//! cache key: install fetches it, activate deletes the old one.

use crate::backend::CacheStorage;
use crate::error::Result;
use crate::http::{strip_fragment, CacheMode};
use serde::{Deserialize, Serialize};
use url::Url;

pub mod controller;
pub mod fallback;
pub mod route;
pub mod strategy;

pub use controller::PrecacheController;
pub use fallback::PrecacheFallbackPlugin;
pub use route::PrecacheRoute;
pub use strategy::PrecacheStrategy;

/// Search parameter carrying the revision in a cache key.
pub const REVISION_SEARCH_PARAM: &str = "__revision__";

/// One entry of a precache manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

impl PrecacheEntry {
    pub fn new(url: impl Into<String>) -> Self {
        PrecacheEntry {
            url: url.into(),
            revision: None,
            integrity: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    /// Parse a JSON manifest (an array of entries).
    pub fn parse_manifest(json: &str) -> Result<Vec<PrecacheEntry>> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<&str> for PrecacheEntry {
    fn from(url: &str) -> Self {
        PrecacheEntry::new(url)
    }
}

/// Resolved form of a manifest entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
    /// Absolute URL, fragment removed.
    pub url: Url,
    /// URL the response is stored under.
    pub cache_key: Url,
    pub cache_mode: CacheMode,
}

/// Resolve `entry` against `base` and derive its cache key.
pub fn create_cache_key(entry: &PrecacheEntry, base: &Url) -> Result<CacheKey> {
    let url = strip_fragment(&base.join(&entry.url)?);

    match &entry.revision {
        Some(revision) if !revision.is_empty() => {
            let mut cache_key = url.clone();
            cache_key
                .query_pairs_mut()
                .append_pair(REVISION_SEARCH_PARAM, revision);
            Ok(CacheKey {
                url,
                cache_key,
                cache_mode: CacheMode::Reload,
            })
        }
        _ => Ok(CacheKey {
            cache_key: url.clone(),
            url,
            cache_mode: CacheMode::Default,
        }),
    }
}

/// URLs that were fetched and URLs already present during an install.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallResult {
    pub updated_urls: Vec<String>,
    pub not_updated_urls: Vec<String>,
}

/// Cache keys deleted during activation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupResult {
    pub deleted_cache_keys: Vec<String>,
}

/// Delete precache buckets of other versions.
///
/// A bucket is outdated when its name contains `-precache-` and differs from
/// `current`. Returns the deleted bucket names.
pub async fn cleanup_outdated_caches(storage: &dyn CacheStorage, current: &str) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in storage.bucket_names().await? {
        if name != current && name.contains("-precache-") {
            storage.delete(&name).await?;
            info!("Deleted outdated precache bucket {}", name);
            deleted.push(name);
        }
    }
    Ok(deleted)
}
