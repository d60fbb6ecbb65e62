//! Per-request helper shared by all strategies.

use super::{HandlerParams, StrategyOptions};
use crate::backend::storage_key;
use crate::context::CacheContext;
use crate::error::{Error, Result};
use crate::fetch::verify_integrity;
use crate::http::{strip_search_params, Method, Request, Response};
use crate::lifetime::{ExtendableEvent, PendingWork};
use crate::plugin::{CacheKeyMode, Hook, Plugin};
use crate::precache::REVISION_SEARCH_PARAM;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// What a cache write did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Stored,
    /// A cacheability check turned the response down.
    Refused,
    QuotaExceeded,
}

/// Everything a strategy needs while answering one request.
///
/// Wraps cache reads and writes and network fetches with the plugin hooks,
/// and tracks background work that must finish before the invocation is
/// complete. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StrategyHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    options: StrategyOptions,
    request: Request,
    params: HandlerParams,
    event: ExtendableEvent,
    pending: PendingWork,
    cache_keys: Mutex<HashMap<(String, CacheKeyMode), Request>>,
}

impl StrategyHandler {
    pub fn new(
        options: StrategyOptions,
        request: Request,
        params: HandlerParams,
        event: ExtendableEvent,
    ) -> Self {
        StrategyHandler {
            inner: Arc::new(HandlerInner {
                options,
                request,
                params,
                event,
                pending: PendingWork::new(),
                cache_keys: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The request the strategy was invoked with.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn params(&self) -> &HandlerParams {
        &self.inner.params
    }

    pub fn event(&self) -> &ExtendableEvent {
        &self.inner.event
    }

    pub fn cache_name(&self) -> &str {
        &self.inner.options.cache_name
    }

    pub fn context(&self) -> &CacheContext {
        &self.inner.options.context
    }

    pub fn options(&self) -> &StrategyOptions {
        &self.inner.options
    }

    /// Plugins implementing `hook`, in registration order.
    pub fn plugins_for(&self, hook: Hook) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.inner
            .options
            .plugins
            .iter()
            .filter(move |p| p.handles(hook))
    }

    pub fn has_callback(&self, hook: Hook) -> bool {
        self.inner.options.has_hook(hook)
    }

    /// Fetch `request` from the network, running the fetch hooks.
    ///
    /// A request with an integrity value fails with
    /// `Error::IntegrityMismatch` when the body does not match it.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        let original = request.clone();

        let mut request = request;
        for plugin in self.plugins_for(Hook::RequestWillFetch) {
            request = plugin.request_will_fetch(self, request).await?;
        }

        let outcome = match self.context().fetcher.fetch(&request).await {
            Ok(response) => match &request.integrity {
                Some(integrity) if !verify_integrity(integrity, &response.body) => {
                    warn!("⚠ Integrity check failed for {}", request.url);
                    Err(Error::IntegrityMismatch {
                        url: request.url.to_string(),
                    })
                }
                _ => Ok(response),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(mut response) => {
                for plugin in self.plugins_for(Hook::FetchDidSucceed) {
                    response = plugin.fetch_did_succeed(self, &request, response).await?;
                }
                Ok(response)
            }
            Err(error) => {
                debug!("Network request for {} failed: {}", request.url, error);
                for plugin in self.plugins_for(Hook::FetchDidFail) {
                    if let Err(e) = plugin.fetch_did_fail(self, &original, &request, &error).await {
                        warn!("⚠ fetch_did_fail plugin failed for {}: {}", request.url, e);
                    }
                }
                self.context()
                    .metrics
                    .record_error(request.url.as_str(), &error.to_string());
                Err(error)
            }
        }
    }

    /// Fetch `request`, then store a copy of the response in the background.
    pub async fn fetch_and_cache_put(&self, request: Request) -> Result<Response> {
        let response = self.fetch(request.clone()).await?;

        let handler = self.clone();
        let copy = response.clone();
        self.wait_until(async move { handler.cache_put(request, copy).await.map(|_| ()) });

        Ok(response)
    }

    /// Read `request` from the strategy's bucket, running the read hooks.
    pub async fn cache_match(&self, request: Request) -> Result<Option<Response>> {
        let effective = self.cache_key(&request, CacheKeyMode::Read).await?;
        let cache_name = self.cache_name();
        let key = storage_key(&effective.url);

        let start = Instant::now();
        let mut cached = self
            .context()
            .storage
            .match_in(cache_name, &effective.url, self.inner.options.match_options)
            .await?;
        let elapsed = start.elapsed();

        match &cached {
            Some(_) => {
                debug!("✓ Found cached response for {} in {}", key, cache_name);
                self.context().metrics.record_hit(cache_name, &key, elapsed);
            }
            None => {
                debug!("No cached response for {} in {}", key, cache_name);
                self.context().metrics.record_miss(cache_name, &key, elapsed);
            }
        }

        for plugin in self.plugins_for(Hook::CachedResponseWillBeUsed) {
            cached = plugin
                .cached_response_will_be_used(self, cache_name, &effective, cached)
                .await?;
        }
        Ok(cached)
    }

    /// Store `response` under `request` in the strategy's bucket.
    ///
    /// Returns `Ok(false)` when a cacheability check refused the response or
    /// the storage quota was exhausted (after running the quota callbacks).
    pub async fn cache_put(&self, request: Request, response: Response) -> Result<bool> {
        Ok(self.put_in_cache(request, response).await? == PutOutcome::Stored)
    }

    pub(crate) async fn put_in_cache(&self, request: Request, response: Response) -> Result<PutOutcome> {
        let effective = self.cache_key(&request, CacheKeyMode::Write).await?;

        if effective.method != Method::Get {
            return Err(Error::StorageError(format!(
                "Cannot cache {} request for {}",
                effective.method, effective.url
            )));
        }

        if let Some(vary) = response.headers.get("vary") {
            warn!(
                "⚠ Response for {} has 'Vary: {}'; variants are not distinguished when matching",
                effective.url, vary
            );
        }

        let Some(to_cache) = self.ensure_response_safe_to_cache(response).await? else {
            debug!("Response for {} will not be cached", effective.url);
            return Ok(PutOutcome::Refused);
        };

        let cache_name = self.cache_name().to_string();
        let old_response = if self.has_callback(Hook::CacheDidUpdate) {
            self.match_ignoring_revision(&cache_name, &effective).await?
        } else {
            None
        };

        let start = Instant::now();
        match self
            .context()
            .storage
            .put(&cache_name, &effective.url, to_cache.clone())
            .await
        {
            Ok(()) => {
                self.context().metrics.record_put(
                    &cache_name,
                    &storage_key(&effective.url),
                    start.elapsed(),
                );
            }
            Err(e) if e.is_quota_exceeded() => {
                warn!("⚠ Quota exceeded caching {} in {}", effective.url, cache_name);
                self.context().quota.run_all().await;
                return Ok(PutOutcome::QuotaExceeded);
            }
            Err(e) => {
                self.context()
                    .metrics
                    .record_error(effective.url.as_str(), &e.to_string());
                return Err(e);
            }
        }

        for plugin in self.plugins_for(Hook::CacheDidUpdate) {
            plugin
                .cache_did_update(self, &cache_name, &effective, old_response.as_ref(), &to_cache)
                .await?;
        }
        Ok(PutOutcome::Stored)
    }

    /// The request used as cache key for `request`, memoized per mode.
    pub async fn cache_key(&self, request: &Request, mode: CacheKeyMode) -> Result<Request> {
        let memo = (request.url.to_string(), mode);
        if let Some(key) = self.inner.cache_keys.lock().get(&memo) {
            return Ok(key.clone());
        }

        let ignored = &self.inner.options.ignored_search_params;
        let mut effective = if ignored.is_empty() {
            request.clone()
        } else {
            request.with_url(strip_search_params(&request.url, |name| {
                ignored.iter().any(|pattern| pattern.is_match(name))
            }))
        };

        for plugin in self.plugins_for(Hook::CacheKeyWillBeUsed) {
            effective = plugin.cache_key_will_be_used(self, effective, mode).await?;
        }

        self.inner.cache_keys.lock().insert(memo, effective.clone());
        Ok(effective)
    }

    /// Run the `cache_will_update` chain. Without such plugins only status
    /// 200 is cacheable.
    async fn ensure_response_safe_to_cache(&self, response: Response) -> Result<Option<Response>> {
        let mut plugin_used = false;
        let mut to_cache = Some(response);

        for plugin in self.plugins_for(Hook::CacheWillUpdate) {
            plugin_used = true;
            let Some(candidate) = to_cache.take() else { break };
            to_cache = plugin
                .cache_will_update(self, self.request(), candidate)
                .await?;
            if to_cache.is_none() {
                break;
            }
        }

        if !plugin_used {
            to_cache = to_cache.filter(|r| r.status == 200);
        }
        Ok(to_cache)
    }

    async fn match_ignoring_revision(
        &self,
        cache_name: &str,
        request: &Request,
    ) -> Result<Option<Response>> {
        let strip = |url: &url::Url| {
            storage_key(&strip_search_params(url, |name| name == REVISION_SEARCH_PARAM))
        };
        let wanted = strip(&request.url);
        let options = self.inner.options.match_options;

        for record in self.context().storage.records(cache_name).await? {
            let Ok(key) = url::Url::parse(&record.cache_key) else {
                continue;
            };
            let same = if options.ignore_search {
                key.path() == request.url.path() && key.origin() == request.url.origin()
            } else {
                strip(&key) == wanted
            };
            if same {
                return Ok(Some(record.response));
            }
        }
        Ok(None)
    }

    /// Keep the invocation alive until `work` completes.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.pending.wait_until(work);
    }

    /// Wait for all work registered through `wait_until`.
    pub async fn done_waiting(&self) -> Result<()> {
        self.inner.pending.done_waiting().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CacheStorage;
    use crate::lifetime::EventKind;
    use crate::strategies::test_support::{fixture, url};
    use async_trait::async_trait;

    fn handler_for(options: StrategyOptions, path: &str) -> StrategyHandler {
        StrategyHandler::new(
            options,
            Request::get(url(path)),
            HandlerParams::default(),
            ExtendableEvent::new(EventKind::Fetch),
        )
    }

    #[tokio::test]
    async fn test_default_cacheability_is_status_200() {
        let fx = fixture();
        let handler = handler_for(StrategyOptions::new(fx.context.clone()), "/a");

        let stored = handler
            .cache_put(Request::get(url("/a")), Response::new(404, "nope"))
            .await
            .expect("Failed to put");
        assert!(!stored);

        let stored = handler
            .cache_put(Request::get(url("/a")), Response::ok("yes"))
            .await
            .expect("Failed to put");
        assert!(stored);
    }

    #[tokio::test]
    async fn test_non_get_cannot_be_cached() {
        let fx = fixture();
        let handler = handler_for(StrategyOptions::new(fx.context.clone()), "/a");
        let post = Request::new(Method::Post, url("/a"));
        assert!(handler.cache_put(post, Response::ok("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_ignored_search_params_strip_cache_key() {
        let fx = fixture();
        let options = StrategyOptions::new(fx.context.clone())
            .with_ignored_search_param(regex::Regex::new("^utm_").unwrap());
        let handler = handler_for(options, "/a");

        handler
            .cache_put(Request::get(url("/a?utm_source=mail")), Response::ok("x"))
            .await
            .expect("Failed to put");

        let keys = fx.storage.keys("offline-kit-runtime").await.unwrap();
        assert_eq!(keys, vec!["https://example.com/a".to_string()]);
    }

    #[tokio::test]
    async fn test_integrity_mismatch_is_fetch_failure() {
        let fx = fixture();
        fx.fetcher.respond("https://example.com/app.js", Response::ok("tampered"));
        let handler = handler_for(StrategyOptions::new(fx.context.clone()), "/app.js");

        let request = Request::get(url("/app.js"))
            .with_integrity(crate::fetch::sha256_integrity(b"original"));
        let err = handler.fetch(request).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));
    }

    struct RecordOld(Mutex<Vec<Option<Vec<u8>>>>);

    #[async_trait]
    impl Plugin for RecordOld {
        fn handles(&self, hook: Hook) -> bool {
            hook == Hook::CacheDidUpdate
        }

        async fn cache_did_update(
            &self,
            _handler: &StrategyHandler,
            _cache_name: &str,
            _request: &Request,
            old_response: Option<&Response>,
            _new_response: &Response,
        ) -> Result<()> {
            self.0.lock().push(old_response.map(|r| r.body.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cache_did_update_sees_previous_revision() {
        let fx = fixture();
        let recorder = Arc::new(RecordOld(Mutex::new(Vec::new())));
        let options = StrategyOptions::new(fx.context.clone()).with_plugin(recorder.clone());
        let handler = handler_for(options, "/a");

        handler
            .cache_put(Request::get(url("/a?__revision__=1")), Response::ok("v1"))
            .await
            .unwrap();
        handler
            .cache_put(Request::get(url("/a?__revision__=2")), Response::ok("v2"))
            .await
            .unwrap();

        let seen = recorder.0.lock().clone();
        assert_eq!(seen, vec![None, Some(b"v1".to_vec())]);
    }

    #[tokio::test]
    async fn test_quota_exceeded_runs_callbacks_and_is_swallowed() {
        use crate::backend::InMemoryCacheStorage;
        use futures::FutureExt;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fx = fixture();
        let storage: Arc<dyn CacheStorage> = Arc::new(InMemoryCacheStorage::with_quota(2));
        let mut context = fx.context.clone();
        context.storage = storage;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        context.quota.register(Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));

        let handler = handler_for(StrategyOptions::new(context), "/a");
        let stored = handler
            .cache_put(Request::get(url("/a")), Response::ok("too large"))
            .await
            .expect("Quota errors are not surfaced");
        assert!(!stored);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
