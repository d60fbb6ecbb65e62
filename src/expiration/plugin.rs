//! Strategy plugin applying expiration to the buckets it sees.

use super::{now_millis, CacheExpiration, ExpirationConfig};
use crate::context::CacheContext;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::plugin::{Hook, Plugin};
use crate::strategies::StrategyHandler;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Applies one [`ExpirationConfig`] to every bucket of the strategies it is
/// attached to.
///
/// - on a cache hit: the `Date` header is checked against the maximum age
///   (stale responses are dropped from the result), the access is recorded
///   and a sweep is started in the background
/// - after a cache write: the access is recorded and a sweep runs
///
/// Attaching it to a strategy that uses the precache bucket is a
/// configuration error, reported on first use.
#[derive(Clone)]
pub struct ExpirationPlugin {
    inner: Arc<PluginInner>,
}

struct PluginInner {
    context: CacheContext,
    config: ExpirationConfig,
    expirations: Mutex<HashMap<String, Arc<CacheExpiration>>>,
}

impl ExpirationPlugin {
    /// # Errors
    ///
    /// Returns `Error::ExpirationConfigInvalid` when neither bound is set.
    pub fn new(context: &CacheContext, config: ExpirationConfig) -> Result<Self> {
        config.validate()?;

        let plugin = ExpirationPlugin {
            inner: Arc::new(PluginInner {
                context: context.clone(),
                config,
                expirations: Mutex::new(HashMap::new()),
            }),
        };

        if plugin.inner.config.purge_on_quota_error {
            let weak: Weak<PluginInner> = Arc::downgrade(&plugin.inner);
            context.quota.register(Arc::new(move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let plugin = ExpirationPlugin { inner };
                    if let Err(e) = plugin.delete_cache_and_metadata().await {
                        warn!("⚠ Purge on quota error failed: {}", e);
                    }
                }
                .boxed()
            }));
        }

        Ok(plugin)
    }

    /// The expiration manager of `cache_name`, created on first use.
    pub fn cache_expiration(&self, cache_name: &str) -> Result<Arc<CacheExpiration>> {
        if cache_name == self.inner.context.cache_names.precache {
            return Err(Error::ConfigError(format!(
                "Expiration cannot be applied to the precache bucket {}",
                cache_name
            )));
        }

        let mut expirations = self.inner.expirations.lock();
        if let Some(expiration) = expirations.get(cache_name) {
            return Ok(Arc::clone(expiration));
        }
        let expiration = Arc::new(CacheExpiration::new(
            &self.inner.context,
            cache_name,
            self.inner.config.clone(),
        )?);
        expirations.insert(cache_name.to_string(), Arc::clone(&expiration));
        Ok(expiration)
    }

    /// Delete every bucket this plugin manages, and their expiration records.
    pub async fn delete_cache_and_metadata(&self) -> Result<()> {
        let expirations: Vec<(String, Arc<CacheExpiration>)> =
            self.inner.expirations.lock().drain().collect();

        for (cache_name, expiration) in expirations {
            self.inner.context.storage.delete(&cache_name).await?;
            expiration.delete().await?;
            warn!("⚠ Purged bucket {} and its expiration records", cache_name);
        }
        Ok(())
    }

    fn is_response_date_fresh(&self, response: &Response) -> bool {
        let Some(max_age) = self.inner.config.max_age_millis() else {
            return true;
        };
        let Some(date) = response.headers.get("date") else {
            return true;
        };
        match chrono::DateTime::parse_from_rfc2822(date) {
            Ok(date) => date.timestamp_millis() >= now_millis() - max_age,
            Err(_) => true,
        }
    }
}

#[async_trait]
impl Plugin for ExpirationPlugin {
    fn handles(&self, hook: Hook) -> bool {
        matches!(hook, Hook::CachedResponseWillBeUsed | Hook::CacheDidUpdate)
    }

    async fn cached_response_will_be_used(
        &self,
        handler: &StrategyHandler,
        cache_name: &str,
        request: &Request,
        cached: Option<Response>,
    ) -> Result<Option<Response>> {
        let Some(cached) = cached else {
            return Ok(None);
        };

        let fresh = self.is_response_date_fresh(&cached);
        let expiration = self.cache_expiration(cache_name)?;

        let sweep = Arc::clone(&expiration);
        handler.wait_until(async move { sweep.expire_entries().await.map(|_| ()) });
        let url = request.url.clone();
        handler.wait_until(async move { expiration.update_timestamp(&url).await });

        if !fresh {
            debug!("Cached response for {} is older than max_age", request.url);
        }
        Ok(fresh.then_some(cached))
    }

    async fn cache_did_update(
        &self,
        _handler: &StrategyHandler,
        cache_name: &str,
        request: &Request,
        _old_response: Option<&Response>,
        _new_response: &Response,
    ) -> Result<()> {
        let expiration = self.cache_expiration(cache_name)?;
        expiration.update_timestamp(&request.url).await?;
        expiration.expire_entries().await?;
        Ok(())
    }
}
