//! Strategy plugins.
//!
//! A plugin hooks into the life of one strategy invocation. Each plugin
//! declares the hooks it implements through [`Plugin::handles`]; the
//! [`StrategyHandler`] only calls declared hooks, in plugin registration
//! order. Undeclared hooks are never called, so their default bodies are
//! pass-throughs.
//!
//! Chained hooks feed the output of one plugin into the next:
//! `cache_key_will_be_used`, `cache_will_update` (stops at the first `None`),
//! `cached_response_will_be_used`, `request_will_fetch`, `fetch_did_succeed`
//! and `handler_will_respond`. `handler_did_error` stops at the first plugin
//! that supplies a response.

use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::strategies::StrategyHandler;
use async_trait::async_trait;

/// Plugin hook identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hook {
    CacheKeyWillBeUsed,
    CacheWillUpdate,
    CacheDidUpdate,
    CachedResponseWillBeUsed,
    RequestWillFetch,
    FetchDidSucceed,
    FetchDidFail,
    HandlerWillStart,
    HandlerWillRespond,
    HandlerDidRespond,
    HandlerDidComplete,
    HandlerDidError,
}

/// Whether a cache key is computed for reading or writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKeyMode {
    Read,
    Write,
}

/// A strategy plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Whether this plugin implements `hook`.
    fn handles(&self, hook: Hook) -> bool;

    /// Rewrite the request used as cache key.
    async fn cache_key_will_be_used(
        &self,
        _handler: &StrategyHandler,
        request: Request,
        _mode: CacheKeyMode,
    ) -> Result<Request> {
        Ok(request)
    }

    /// Decide whether (and what) to store. `None` prevents the write.
    async fn cache_will_update(
        &self,
        _handler: &StrategyHandler,
        _request: &Request,
        response: Response,
    ) -> Result<Option<Response>> {
        Ok(Some(response))
    }

    /// Called after a successful write.
    async fn cache_did_update(
        &self,
        _handler: &StrategyHandler,
        _cache_name: &str,
        _request: &Request,
        _old_response: Option<&Response>,
        _new_response: &Response,
    ) -> Result<()> {
        Ok(())
    }

    /// Inspect or veto a cache read.
    async fn cached_response_will_be_used(
        &self,
        _handler: &StrategyHandler,
        _cache_name: &str,
        _request: &Request,
        cached: Option<Response>,
    ) -> Result<Option<Response>> {
        Ok(cached)
    }

    /// Rewrite a request before it goes to the network.
    async fn request_will_fetch(&self, _handler: &StrategyHandler, request: Request) -> Result<Request> {
        Ok(request)
    }

    /// Rewrite a response received from the network.
    async fn fetch_did_succeed(
        &self,
        _handler: &StrategyHandler,
        _request: &Request,
        response: Response,
    ) -> Result<Response> {
        Ok(response)
    }

    /// Called when the network could not be reached.
    ///
    /// `original` is the request as the strategy issued it, `request` the one
    /// actually sent after `request_will_fetch`.
    async fn fetch_did_fail(
        &self,
        _handler: &StrategyHandler,
        _original: &Request,
        _request: &Request,
        _error: &Error,
    ) -> Result<()> {
        Ok(())
    }

    async fn handler_will_start(&self, _handler: &StrategyHandler, _request: &Request) -> Result<()> {
        Ok(())
    }

    async fn handler_will_respond(
        &self,
        _handler: &StrategyHandler,
        _request: &Request,
        response: Response,
    ) -> Result<Response> {
        Ok(response)
    }

    async fn handler_did_respond(
        &self,
        _handler: &StrategyHandler,
        _request: &Request,
        _response: Option<&Response>,
    ) -> Result<()> {
        Ok(())
    }

    async fn handler_did_complete(
        &self,
        _handler: &StrategyHandler,
        _request: &Request,
        _response: Option<&Response>,
        _error: Option<&Error>,
    ) -> Result<()> {
        Ok(())
    }

    /// Supply a replacement response after the strategy failed.
    async fn handler_did_error(
        &self,
        _handler: &StrategyHandler,
        _request: &Request,
        _error: &Error,
    ) -> Result<Option<Response>> {
        Ok(None)
    }
}
