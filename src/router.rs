//! Request routing: match an intercepted request to the handler that answers
//! it.
//!
//! Routes are kept per HTTP method in registration order; the first route
//! whose matcher accepts the request handles it. A request no route matches
//! goes to the method's default handler, if any, and is otherwise left
//! unhandled (`Ok(None)`).

use crate::error::{Error, Result};
use crate::http::{strip_fragment, Method, Request, Response};
use crate::lifetime::ExtendableEvent;
use crate::strategies::{HandlerParams, Strategy};
use futures::future::{self, BoxFuture};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Something that can answer a routed request.
pub trait RouteHandler: Send + Sync {
    fn handle_route(
        &self,
        request: Request,
        params: HandlerParams,
        event: &ExtendableEvent,
    ) -> BoxFuture<'static, Result<Response>>;
}

impl<S: Strategy + Clone> RouteHandler for S {
    fn handle_route(
        &self,
        request: Request,
        params: HandlerParams,
        event: &ExtendableEvent,
    ) -> BoxFuture<'static, Result<Response>> {
        self.handle(request, params, event)
    }
}

/// Route handler built from a closure. See [`handler_fn`].
pub struct HandlerFn<F>(F);

/// Wrap a closure as a [`RouteHandler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(Request, HandlerParams) -> BoxFuture<'static, Result<Response>> + Send + Sync,
{
    HandlerFn(f)
}

impl<F> RouteHandler for HandlerFn<F>
where
    F: Fn(Request, HandlerParams) -> BoxFuture<'static, Result<Response>> + Send + Sync,
{
    fn handle_route(
        &self,
        request: Request,
        params: HandlerParams,
        _event: &ExtendableEvent,
    ) -> BoxFuture<'static, Result<Response>> {
        (self.0)(request, params)
    }
}

/// What a matcher sees of a request.
#[derive(Clone, Copy, Debug)]
pub struct MatchInput<'a> {
    pub url: &'a Url,
    pub request: &'a Request,
    /// Whether the request URL has the scope's origin.
    pub same_origin: bool,
    pub scope: &'a Url,
}

pub type MatchFn = Arc<dyn Fn(&MatchInput<'_>) -> Option<HandlerParams> + Send + Sync>;

/// Decides whether a route handles a request.
#[derive(Clone)]
pub enum RouteMatcher {
    /// The URL, resolved against the scope, equals the request URL.
    Exact(String),
    /// The pattern matches the full request URL. Capture groups become the
    /// handler's params. A cross-origin URL only matches when the match
    /// starts at its first character.
    Regex(Regex),
    Custom(MatchFn),
}

impl RouteMatcher {
    pub fn exact(url: impl Into<String>) -> Self {
        RouteMatcher::Exact(url.into())
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an invalid pattern.
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(RouteMatcher::Regex)
            .map_err(|e| Error::ConfigError(format!("Invalid route pattern {}: {}", pattern, e)))
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&MatchInput<'_>) -> Option<HandlerParams> + Send + Sync + 'static,
    {
        RouteMatcher::Custom(Arc::new(f))
    }

    /// Handler params when `input` matches.
    pub fn matches(&self, input: &MatchInput<'_>) -> Option<HandlerParams> {
        match self {
            RouteMatcher::Exact(target) => {
                let target = input.scope.join(target).ok()?;
                (strip_fragment(&target) == strip_fragment(input.url)).then(HandlerParams::default)
            }
            RouteMatcher::Regex(pattern) => {
                let captures = pattern.captures(input.url.as_str())?;
                let whole = captures.get(0)?;
                if !input.same_origin && whole.start() != 0 {
                    debug!(
                        "Pattern {} matched cross-origin {} past its start; ignored",
                        pattern, input.url
                    );
                    return None;
                }
                let groups = captures
                    .iter()
                    .skip(1)
                    .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                Some(HandlerParams::from_captures(groups))
            }
            RouteMatcher::Custom(f) => f(input),
        }
    }
}

impl fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMatcher::Exact(url) => f.debug_tuple("Exact").field(url).finish(),
            RouteMatcher::Regex(pattern) => f.debug_tuple("Regex").field(&pattern.as_str()).finish(),
            RouteMatcher::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A matcher, the handler it routes to, and the method it applies to.
pub struct Route {
    matcher: RouteMatcher,
    handler: Arc<dyn RouteHandler>,
    method: Method,
    catch_handler: Option<Arc<dyn RouteHandler>>,
}

impl Route {
    /// A GET route.
    pub fn new(matcher: RouteMatcher, handler: Arc<dyn RouteHandler>) -> Self {
        Route {
            matcher,
            handler,
            method: Method::Get,
            catch_handler: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Handler answering when this route's handler fails.
    pub fn with_catch_handler(mut self, handler: Arc<dyn RouteHandler>) -> Self {
        self.catch_handler = Some(handler);
        self
    }

    pub fn matcher(&self) -> &RouteMatcher {
        &self.matcher
    }

    pub fn method(&self) -> Method {
        self.method
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("matcher", &self.matcher)
            .field("method", &self.method)
            .field("catch_handler", &self.catch_handler.is_some())
            .finish()
    }
}

/// Ordered route table.
pub struct Router {
    scope: Url,
    routes: RwLock<HashMap<Method, Vec<Arc<Route>>>>,
    default_handlers: RwLock<HashMap<Method, Arc<dyn RouteHandler>>>,
    catch_handler: RwLock<Option<Arc<dyn RouteHandler>>>,
}

impl Router {
    /// Router resolving relative route URLs against `scope`.
    pub fn new(scope: Url) -> Self {
        Router {
            scope,
            routes: RwLock::new(HashMap::new()),
            default_handlers: RwLock::new(HashMap::new()),
            catch_handler: RwLock::new(None),
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Append `route` to its method's list. Registering an equivalent route
    /// twice is allowed; the later one is shadowed.
    pub fn register_route(&self, route: Arc<Route>) {
        debug!("Registered route {:?}", route);
        self.routes
            .write()
            .entry(route.method)
            .or_default()
            .push(route);
    }

    /// Remove `route` (by identity). Returns whether it was registered.
    pub fn unregister_route(&self, route: &Arc<Route>) -> bool {
        let mut routes = self.routes.write();
        let Some(list) = routes.get_mut(&route.method) else {
            return false;
        };
        match list.iter().position(|r| Arc::ptr_eq(r, route)) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of registered routes, all methods together.
    pub fn len(&self) -> usize {
        self.routes.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler for requests of `method` no route matches.
    pub fn set_default_handler(&self, handler: Arc<dyn RouteHandler>, method: Method) {
        self.default_handlers.write().insert(method, handler);
    }

    /// Handler answering when a route (or the default handler) fails and the
    /// route has no catch handler of its own, or that one failed too.
    pub fn set_catch_handler(&self, handler: Arc<dyn RouteHandler>) {
        *self.catch_handler.write() = Some(handler);
    }

    /// The first route matching `request`, with its params.
    pub fn find_matching_route(&self, request: &Request) -> Option<(Arc<Route>, HandlerParams)> {
        let input = MatchInput {
            url: &request.url,
            request,
            same_origin: request.url.origin() == self.scope.origin(),
            scope: &self.scope,
        };
        let routes = self.routes.read();
        routes
            .get(&request.method)?
            .iter()
            .find_map(|route| Some((Arc::clone(route), route.matcher.matches(&input)?)))
    }

    /// Answer `request`, or `Ok(None)` when nothing handles it.
    pub async fn handle_request(
        &self,
        request: Request,
        event: &ExtendableEvent,
    ) -> Result<Option<Response>> {
        if !matches!(request.url.scheme(), "http" | "https") {
            debug!("Not routing non-http request {}", request.url);
            return Ok(None);
        }

        let (handler, params, route_catch) = match self.find_matching_route(&request) {
            Some((route, params)) => {
                debug!("Routing {} {} via {:?}", request.method, request.url, route.matcher);
                (Arc::clone(&route.handler), params, route.catch_handler.clone())
            }
            None => {
                let default = self.default_handlers.read().get(&request.method).cloned();
                match default {
                    Some(handler) => {
                        debug!("Routing {} {} to the default handler", request.method, request.url);
                        (handler, HandlerParams::default(), None)
                    }
                    None => {
                        debug!("No route for {} {}", request.method, request.url);
                        return Ok(None);
                    }
                }
            }
        };

        let mut error = match handler
            .handle_route(request.clone(), params.clone(), event)
            .await
        {
            Ok(response) => return Ok(Some(response)),
            Err(e) => e,
        };

        if let Some(catch) = route_catch {
            warn!("⚠ Route for {} failed, trying its catch handler: {}", request.url, error);
            match catch
                .handle_route(request.clone(), params.clone(), event)
                .await
            {
                Ok(response) => return Ok(Some(response)),
                Err(e) => error = e,
            }
        }

        let global = self.catch_handler.read().clone();
        if let Some(catch) = global {
            warn!("⚠ Routing {} failed, trying the global catch handler: {}", request.url, error);
            return catch.handle_route(request, params, event).await.map(Some);
        }
        Err(error)
    }

    /// Route a GET request for each URL (relative URLs resolve against the
    /// scope), letting the matched strategies cache them. Fails with the
    /// first error; unmatched URLs are skipped.
    pub async fn cache_urls(&self, urls: &[String], event: &ExtendableEvent) -> Result<()> {
        let mut requests = Vec::with_capacity(urls.len());
        for url in urls {
            requests.push(Request::get(self.scope.join(url)?));
        }

        let outcomes =
            future::join_all(requests.into_iter().map(|request| self.handle_request(request, event)))
                .await;
        let handled = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
        debug!(
            "Cached {} of {} URL(s) via routes",
            handled.iter().filter(|r| r.is_some()).count(),
            handled.len()
        );
        Ok(())
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("scope", &self.scope.as_str())
            .field("routes", &self.len())
            .finish()
    }
}
