//! The strategy serving precached responses.

use super::controller::SharedManifest;
use crate::error::{Error, Result};
use crate::http::{Request, RequestMode, Response, ResponseKind};
use crate::lifetime::EventKind;
use crate::plugin::{CacheKeyMode, Hook, Plugin};
use crate::strategies::handler::PutOutcome;
use crate::strategies::{Strategy, StrategyHandler, StrategyOptions};
use async_trait::async_trait;
use std::sync::Arc;

/// Serves from the precache bucket.
///
/// - during install: fetches the request and requires it to be stored,
///   failing with `Error::BadPrecachingResponse` when the response is refused
///   and `Error::QuotaExceeded` when storage is full
/// - on a miss outside install: falls back to the network when
///   `fallback_to_network` is set (the default), repairing the cache entry
///   when the manifest carries an integrity value; otherwise fails with
///   `Error::MissingPrecacheEntry`
#[derive(Clone)]
pub struct PrecacheStrategy {
    options: StrategyOptions,
    fallback_to_network: bool,
}

impl PrecacheStrategy {
    /// Unless `options` already has a `cache_will_update` plugin, responses
    /// with status >= 400, error responses and opaque redirects are refused.
    pub fn new(mut options: StrategyOptions) -> Self {
        if !options.has_hook(Hook::CacheWillUpdate) {
            options.plugins.push(Arc::new(PrecacheCacheabilityPlugin));
        }
        PrecacheStrategy {
            options,
            fallback_to_network: true,
        }
    }

    pub fn with_fallback_to_network(mut self, fallback: bool) -> Self {
        self.fallback_to_network = fallback;
        self
    }

    pub(crate) fn with_manifest(mut self, manifest: SharedManifest) -> Self {
        self.options
            .plugins
            .insert(0, Arc::new(PrecacheCacheKeyPlugin { manifest }));
        self
    }

    async fn handle_install(&self, request: &Request, handler: &StrategyHandler) -> Result<Response> {
        let response = handler.fetch(request.clone()).await.map_err(|e| {
            warn!("⚠ Precache fetch of {} failed: {}", request.url, e);
            Error::BadPrecachingResponse {
                url: request.url.to_string(),
                status: None,
            }
        })?;

        match handler
            .put_in_cache(request.clone(), response.clone())
            .await?
        {
            PutOutcome::Stored => Ok(response),
            PutOutcome::Refused => Err(Error::BadPrecachingResponse {
                url: request.url.to_string(),
                status: Some(response.status),
            }),
            PutOutcome::QuotaExceeded => Err(Error::QuotaExceeded {
                bucket: self.options.cache_name.clone(),
            }),
        }
    }

    async fn handle_fetch(&self, request: &Request, handler: &StrategyHandler) -> Result<Response> {
        if !self.fallback_to_network {
            return Err(Error::MissingPrecacheEntry {
                cache_name: self.options.cache_name.clone(),
                url: request.url.to_string(),
            });
        }

        let in_manifest = handler.params().integrity.clone();
        let in_request = request.integrity.clone();
        let no_conflict = in_request.is_none() || in_request == in_manifest;
        let cors = request.mode != RequestMode::NoCors;

        let mut network_request = request.clone();
        network_request.integrity = if cors {
            in_request.or_else(|| in_manifest.clone())
        } else {
            None
        };

        warn!(
            "⚠ Precached response for {} missing from {}, falling back to the network",
            request.url, self.options.cache_name
        );
        let response = handler
            .fetch(network_request)
            .await
            .map_err(|e| Error::no_response(request.url.as_str(), Some(&e)))?;

        if in_manifest.is_some() && no_conflict && cors {
            let repaired = handler
                .cache_put(request.clone(), response.clone())
                .await?;
            if repaired {
                info!("Repaired precache entry for {}", request.url);
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl Strategy for PrecacheStrategy {
    fn options(&self) -> &StrategyOptions {
        &self.options
    }

    async fn handle_request(&self, request: &Request, handler: &StrategyHandler) -> Result<Response> {
        if let Some(cached) = handler.cache_match(request.clone()).await? {
            return Ok(cached);
        }

        if handler.event().kind() == EventKind::Install {
            return self.handle_install(request, handler).await;
        }
        self.handle_fetch(request, handler).await
    }
}

/// Maps request URLs to their revisioned cache keys.
struct PrecacheCacheKeyPlugin {
    manifest: SharedManifest,
}

#[async_trait]
impl Plugin for PrecacheCacheKeyPlugin {
    fn handles(&self, hook: Hook) -> bool {
        hook == Hook::CacheKeyWillBeUsed
    }

    async fn cache_key_will_be_used(
        &self,
        handler: &StrategyHandler,
        request: Request,
        _mode: CacheKeyMode,
    ) -> Result<Request> {
        let cache_key = handler
            .params()
            .cache_key
            .clone()
            .or_else(|| self.manifest.read().cache_key_for(&request.url));

        Ok(match cache_key {
            Some(cache_key) => {
                let mut keyed = Request::get(cache_key);
                keyed.headers = request.headers;
                keyed
            }
            None => request,
        })
    }
}

/// Refuses unusable precache responses; stores redirected responses as
/// plain ones.
struct PrecacheCacheabilityPlugin;

#[async_trait]
impl Plugin for PrecacheCacheabilityPlugin {
    fn handles(&self, hook: Hook) -> bool {
        hook == Hook::CacheWillUpdate
    }

    async fn cache_will_update(
        &self,
        _handler: &StrategyHandler,
        _request: &Request,
        mut response: Response,
    ) -> Result<Option<Response>> {
        if response.status >= 400
            || matches!(response.kind, ResponseKind::Error | ResponseKind::OpaqueRedirect)
        {
            return Ok(None);
        }
        response.redirected = false;
        Ok(Some(response))
    }
}
