//! Runtime caching strategies.
//!
//! A strategy combines cache storage and the network to answer one request.
//! All five strategies share the same driver:
//!
//! 1. `handler_will_start` plugins run
//! 2. the strategy's `handle_request` produces a response or an error
//! 3. on error, `handler_did_error` plugins may supply a replacement
//! 4. `handler_will_respond` plugins may rewrite the response
//! 5. once the response is out, `handler_did_respond` runs, the handler's
//!    background work is drained, and `handler_did_complete` runs
//!
//! Steps 1-4 form the response future, step 5 the done future. See
//! [`Strategy::handle_all`].
//!
//! | Strategy | Cache | Network |
//! |----------|-------|---------|
//! | `CacheFirst` | first | on miss, result stored |
//! | `NetworkFirst` | on failure or timeout | first, result stored |
//! | `StaleWhileRevalidate` | first | always, in background, result stored |
//! | `NetworkOnly` | never | always |
//! | `CacheOnly` | always | never |

use crate::backend::MatchOptions;
use crate::context::CacheContext;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::lifetime::ExtendableEvent;
use crate::plugin::{Hook, Plugin};
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use regex::Regex;
use std::sync::Arc;
use url::Url;

pub mod cache_first;
pub mod cache_only;
pub mod handler;
pub mod network_first;
pub mod network_only;
pub mod stale_while_revalidate;

pub use cache_first::CacheFirst;
pub use cache_only::CacheOnly;
pub use handler::StrategyHandler;
pub use network_first::NetworkFirst;
pub use network_only::NetworkOnly;
pub use stale_while_revalidate::StaleWhileRevalidate;

/// Values a route match hands to its handler.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandlerParams {
    /// Regular expression capture groups, in order.
    pub captures: Vec<String>,
    /// Cache key to read and write instead of the request URL.
    pub cache_key: Option<Url>,
    /// Integrity value registered for the cache key.
    pub integrity: Option<String>,
}

impl HandlerParams {
    pub fn from_captures(captures: Vec<String>) -> Self {
        HandlerParams {
            captures,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.cache_key.is_none() && self.integrity.is_none()
    }
}

/// Options shared by all strategies.
#[derive(Clone)]
pub struct StrategyOptions {
    pub context: CacheContext,
    /// Bucket to read from and write to.
    pub cache_name: String,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub match_options: MatchOptions,
    /// Search parameters that do not contribute to the cache key.
    pub ignored_search_params: Vec<Regex>,
}

impl StrategyOptions {
    /// Options writing to the runtime bucket, without plugins.
    pub fn new(context: CacheContext) -> Self {
        StrategyOptions {
            cache_name: context.cache_names.runtime.clone(),
            context,
            plugins: Vec::new(),
            match_options: MatchOptions::default(),
            ignored_search_params: Vec::new(),
        }
    }

    pub fn with_cache_name(mut self, cache_name: impl Into<String>) -> Self {
        self.cache_name = cache_name.into();
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_plugins(mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    pub fn with_match_options(mut self, match_options: MatchOptions) -> Self {
        self.match_options = match_options;
        self
    }

    pub fn with_ignored_search_param(mut self, pattern: Regex) -> Self {
        self.ignored_search_params.push(pattern);
        self
    }

    /// Whether any plugin implements `hook`.
    pub fn has_hook(&self, hook: Hook) -> bool {
        self.plugins.iter().any(|p| p.handles(hook))
    }
}

/// The two futures of one strategy invocation.
pub struct HandleAll {
    /// Resolves to the response. Cloneable.
    pub response: Shared<BoxFuture<'static, Result<Response>>>,
    /// Resolves once the handler's background work is complete.
    pub done: BoxFuture<'static, Result<()>>,
}

/// A caching strategy.
///
/// Implementors supply `handle_request`; the provided methods run it inside
/// the plugin lifecycle. Strategies are cheap to clone (their options hold
/// `Arc`s), which lets a response future own its strategy.
#[async_trait]
pub trait Strategy: Send + Sync + 'static {
    fn options(&self) -> &StrategyOptions;

    /// Produce a response for `request`.
    ///
    /// Returning an error-kind response is the same as failing with
    /// `Error::NoResponse`.
    async fn handle_request(&self, request: &Request, handler: &StrategyHandler) -> Result<Response>;

    fn cache_name(&self) -> &str {
        &self.options().cache_name
    }

    /// Run the strategy for `request`, returning the response future and the
    /// done future separately.
    fn handle_all(&self, request: Request, params: HandlerParams, event: &ExtendableEvent) -> HandleAll
    where
        Self: Clone + Sized,
    {
        let handler = StrategyHandler::new(
            self.options().clone(),
            request.clone(),
            params,
            event.clone(),
        );

        let response = {
            let strategy = self.clone();
            let handler = handler.clone();
            let request = request.clone();
            async move { get_response(&strategy, &handler, request).await }
                .boxed()
                .shared()
        };

        let done = {
            let response = response.clone();
            async move { await_complete(response, handler, request).await }.boxed()
        };

        HandleAll { response, done }
    }

    /// Run the strategy, extending `event` until its background work is done.
    fn handle(
        &self,
        request: Request,
        params: HandlerParams,
        event: &ExtendableEvent,
    ) -> BoxFuture<'static, Result<Response>>
    where
        Self: Clone + Sized,
    {
        let HandleAll { response, done } = self.handle_all(request, params, event);
        event.wait_until(done);
        response.boxed()
    }
}

async fn get_response<S: Strategy>(
    strategy: &S,
    handler: &StrategyHandler,
    request: Request,
) -> Result<Response> {
    for plugin in handler.plugins_for(Hook::HandlerWillStart) {
        plugin.handler_will_start(handler, &request).await?;
    }

    let outcome = match strategy.handle_request(&request, handler).await {
        Ok(response) if response.is_error() => Err(Error::no_response(request.url.as_str(), None)),
        other => other,
    };

    let mut response = match outcome {
        Ok(response) => response,
        Err(error) => {
            let mut replacement = None;
            for plugin in handler.plugins_for(Hook::HandlerDidError) {
                replacement = plugin.handler_did_error(handler, &request, &error).await?;
                if replacement.is_some() {
                    break;
                }
            }
            match replacement {
                Some(response) => {
                    debug!("Recovered {} from error: {}", request.url, error);
                    response
                }
                None => return Err(error),
            }
        }
    };

    for plugin in handler.plugins_for(Hook::HandlerWillRespond) {
        response = plugin
            .handler_will_respond(handler, &request, response)
            .await?;
    }
    Ok(response)
}

async fn await_complete(
    response: Shared<BoxFuture<'static, Result<Response>>>,
    handler: StrategyHandler,
    request: Request,
) -> Result<()> {
    let response = response.await.ok();

    let mut error = None;
    for plugin in handler.plugins_for(Hook::HandlerDidRespond) {
        if let Err(e) = plugin
            .handler_did_respond(&handler, &request, response.as_ref())
            .await
        {
            error = Some(e);
            break;
        }
    }
    if error.is_none() {
        if let Err(e) = handler.done_waiting().await {
            error = Some(e);
        }
    }

    for plugin in handler.plugins_for(Hook::HandlerDidComplete) {
        plugin
            .handler_did_complete(&handler, &request, response.as_ref(), error.as_ref())
            .await?;
    }

    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Plugin that stores responses whose status is 200 or that are opaque.
///
/// Added by `NetworkFirst` and `StaleWhileRevalidate` when the caller
/// supplied no `cache_will_update` plugin of their own.
pub(crate) fn default_cacheable_plugin() -> Arc<dyn Plugin> {
    Arc::new(crate::cacheable::CacheableResponsePlugin::from(
        crate::cacheable::CacheableResponse::with_statuses([0, 200]),
    ))
}

pub(crate) fn with_default_cacheability(mut options: StrategyOptions) -> StrategyOptions {
    if !options.has_hook(Hook::CacheWillUpdate) {
        options.plugins.insert(0, default_cacheable_plugin());
    }
    options
}
