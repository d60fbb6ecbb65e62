//! Registration, installation and activation of the precache manifest.

use super::strategy::PrecacheStrategy;
use super::{create_cache_key, CleanupResult, InstallResult, PrecacheEntry};
use crate::backend::MatchOptions;
use crate::context::CacheContext;
use crate::error::{Error, Result};
use crate::http::{strip_fragment, CacheMode, Request, Response};
use crate::lifetime::{EventKind, ExtendableEvent};
use crate::router::RouteHandler;
use crate::strategies::{HandleAll, HandlerParams, Strategy, StrategyOptions};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use url::Url;

/// Registered manifest entries, shared with the cache-key plugin and routes.
#[derive(Debug, Default)]
pub(crate) struct Manifest {
    urls: Vec<String>,
    cache_keys: HashMap<String, Url>,
    cache_modes: HashMap<String, CacheMode>,
    integrities: HashMap<String, String>,
}

pub(crate) type SharedManifest = Arc<RwLock<Manifest>>;

impl Manifest {
    pub(crate) fn cache_key_for(&self, url: &Url) -> Option<Url> {
        self.cache_keys.get(strip_fragment(url).as_str()).cloned()
    }

    pub(crate) fn integrity_for(&self, cache_key: &Url) -> Option<String> {
        self.integrities.get(cache_key.as_str()).cloned()
    }
}

/// Owns the precache manifest and the strategy used to fill and serve the
/// precache bucket.
#[derive(Clone)]
pub struct PrecacheController {
    context: CacheContext,
    base: Url,
    manifest: SharedManifest,
    strategy: PrecacheStrategy,
}

impl PrecacheController {
    /// Controller resolving relative manifest URLs against `base`, writing
    /// to the context's precache bucket.
    pub fn new(context: &CacheContext, base: Url) -> Self {
        let options = StrategyOptions::new(context.clone())
            .with_cache_name(context.cache_names.precache.clone());
        Self::with_strategy(context, base, PrecacheStrategy::new(options))
    }

    pub fn with_strategy(context: &CacheContext, base: Url, strategy: PrecacheStrategy) -> Self {
        let manifest = SharedManifest::default();
        PrecacheController {
            context: context.clone(),
            base,
            strategy: strategy.with_manifest(Arc::clone(&manifest)),
            manifest,
        }
    }

    pub fn strategy(&self) -> &PrecacheStrategy {
        &self.strategy
    }

    pub fn cache_name(&self) -> &str {
        self.strategy.cache_name()
    }

    pub(crate) fn manifest(&self) -> SharedManifest {
        Arc::clone(&self.manifest)
    }

    /// Register manifest entries.
    ///
    /// Entries are validated as a batch; on error nothing is registered.
    ///
    /// # Errors
    ///
    /// - `Error::ConflictingPrecacheEntry` when a URL is registered with two
    ///   different cache keys
    /// - `Error::ConflictingIntegrity` when a cache key is registered with two
    ///   different integrity values
    pub fn add_entries<I, E>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = E>,
        E: Into<PrecacheEntry>,
    {
        let mut manifest = self.manifest.write();

        let mut staged_keys: HashMap<String, (Url, CacheMode)> = HashMap::new();
        let mut staged_integrities: HashMap<String, String> = HashMap::new();
        let mut order = Vec::new();
        let mut without_revision = Vec::new();

        for entry in entries {
            let entry: PrecacheEntry = entry.into();
            if entry.revision.is_none() {
                without_revision.push(entry.url.clone());
            }

            let key = create_cache_key(&entry, &self.base)?;
            let url = key.url.to_string();

            let known = staged_keys
                .get(&url)
                .map(|(k, _)| k)
                .or_else(|| manifest.cache_keys.get(&url));
            match known {
                Some(existing) if *existing != key.cache_key => {
                    return Err(Error::ConflictingPrecacheEntry {
                        first_entry: existing.to_string(),
                        second_entry: key.cache_key.to_string(),
                    });
                }
                Some(_) => {}
                None => order.push(url.clone()),
            }

            if let Some(integrity) = &entry.integrity {
                let cache_key = key.cache_key.to_string();
                let known = staged_integrities
                    .get(&cache_key)
                    .or_else(|| manifest.integrities.get(&cache_key));
                if let Some(existing) = known {
                    if existing != integrity {
                        return Err(Error::ConflictingIntegrity { url });
                    }
                }
                staged_integrities.insert(cache_key, integrity.clone());
            }

            staged_keys.insert(url, (key.cache_key, key.cache_mode));
        }

        if !without_revision.is_empty() {
            warn!(
                "⚠ {} precache entr{} without a revision; make sure the URL itself is versioned: {}",
                without_revision.len(),
                if without_revision.len() == 1 { "y" } else { "ies" },
                without_revision.join(", ")
            );
        }

        for (url, (cache_key, cache_mode)) in staged_keys {
            manifest.cache_keys.insert(url.clone(), cache_key);
            manifest.cache_modes.insert(url, cache_mode);
        }
        manifest.integrities.extend(staged_integrities);
        manifest.urls.extend(order);

        debug!("Precache manifest holds {} URLs", manifest.urls.len());
        Ok(())
    }

    /// Fetch and store every manifest entry not yet in the precache bucket.
    ///
    /// Entries are processed one at a time, in registration order. The first
    /// failure aborts the install.
    pub async fn install(&self, event: &ExtendableEvent) -> Result<InstallResult> {
        if event.kind() != EventKind::Install {
            return Err(Error::ConfigError(format!(
                "Precache install requires an install event, got {:?}",
                event.kind()
            )));
        }

        let entries: Vec<(String, Url, CacheMode, Option<String>)> = {
            let manifest = self.manifest.read();
            manifest
                .urls
                .iter()
                .filter_map(|url| {
                    let cache_key = manifest.cache_keys.get(url)?.clone();
                    let mode = manifest.cache_modes.get(url).copied().unwrap_or_default();
                    let integrity = manifest.integrity_for(&cache_key);
                    Some((url.clone(), cache_key, mode, integrity))
                })
                .collect()
        };

        let mut result = InstallResult::default();
        for (url, cache_key, cache_mode, integrity) in entries {
            let present = self
                .context
                .storage
                .match_in(self.cache_name(), &cache_key, MatchOptions::default())
                .await?
                .is_some();
            if present {
                result.not_updated_urls.push(url);
                continue;
            }

            let mut request = Request::parse_get(&url)?.with_cache_mode(cache_mode);
            if let Some(integrity) = &integrity {
                request = request.with_integrity(integrity.clone());
            }
            let params = HandlerParams {
                cache_key: Some(cache_key),
                integrity,
                ..Default::default()
            };

            let HandleAll { response, done } = self.strategy.handle_all(request, params, event);
            let (response, done) = futures::join!(response, done);
            response?;
            done?;
            result.updated_urls.push(url);
        }

        info!(
            "✓ Precached {} URL{}, {} already cached",
            result.updated_urls.len(),
            if result.updated_urls.len() == 1 { "" } else { "s" },
            result.not_updated_urls.len()
        );
        Ok(result)
    }

    /// Delete entries of the precache bucket that are no longer in the
    /// manifest.
    pub async fn activate(&self) -> Result<CleanupResult> {
        let expected: HashSet<String> = self
            .manifest
            .read()
            .cache_keys
            .values()
            .map(|key| key.to_string())
            .collect();

        let mut result = CleanupResult::default();
        for key in self.context.storage.keys(self.cache_name()).await? {
            if expected.contains(&key) {
                continue;
            }
            let url = Url::parse(&key)?;
            self.context
                .storage
                .delete_entry(self.cache_name(), &url, MatchOptions::default())
                .await?;
            result.deleted_cache_keys.push(key);
        }

        if !result.deleted_cache_keys.is_empty() {
            info!(
                "Deleted {} outdated precache entries",
                result.deleted_cache_keys.len()
            );
        }
        Ok(result)
    }

    /// Registered URLs, in registration order.
    pub fn cached_urls(&self) -> Vec<String> {
        self.manifest.read().urls.clone()
    }

    /// URL to cache key mapping of every registered entry.
    pub fn url_to_cache_keys(&self) -> Vec<(String, Url)> {
        let manifest = self.manifest.read();
        manifest
            .urls
            .iter()
            .filter_map(|url| Some((url.clone(), manifest.cache_keys.get(url)?.clone())))
            .collect()
    }

    pub fn cache_key_for_url(&self, url: &Url) -> Option<Url> {
        self.manifest.read().cache_key_for(url)
    }

    /// Cache key of `url`, resolved against the base URL.
    pub fn lookup(&self, url: &str) -> Option<Url> {
        let resolved = self.base.join(url).ok()?;
        self.cache_key_for_url(&resolved)
    }

    pub fn integrity_for_cache_key(&self, cache_key: &Url) -> Option<String> {
        self.manifest.read().integrity_for(cache_key)
    }

    /// The precached response for `url`, read directly from storage.
    pub async fn match_precache(&self, url: &str) -> Result<Option<Response>> {
        let Some(cache_key) = self.lookup(url) else {
            return Ok(None);
        };
        self.context
            .storage
            .match_in(self.cache_name(), &cache_key, MatchOptions::default())
            .await
    }

    /// A route handler that always answers with the precached `url`,
    /// whatever the request.
    ///
    /// # Errors
    ///
    /// Returns `Error::NonPrecachedUrl` when `url` is not in the manifest.
    pub fn create_bound_handler(&self, url: &str) -> Result<Arc<dyn RouteHandler>> {
        let cache_key = self
            .lookup(url)
            .ok_or_else(|| Error::NonPrecachedUrl(url.to_string()))?;
        let url = self.base.join(url)?;
        Ok(Arc::new(BoundPrecacheHandler {
            integrity: self.integrity_for_cache_key(&cache_key),
            strategy: self.strategy.clone(),
            url,
            cache_key,
        }))
    }
}

struct BoundPrecacheHandler {
    strategy: PrecacheStrategy,
    url: Url,
    cache_key: Url,
    integrity: Option<String>,
}

impl RouteHandler for BoundPrecacheHandler {
    fn handle_route(
        &self,
        _request: Request,
        params: HandlerParams,
        event: &ExtendableEvent,
    ) -> BoxFuture<'static, Result<Response>> {
        let params = HandlerParams {
            cache_key: Some(self.cache_key.clone()),
            integrity: self.integrity.clone(),
            ..params
        };
        self.strategy
            .handle(Request::get(self.url.clone()), params, event)
    }
}
