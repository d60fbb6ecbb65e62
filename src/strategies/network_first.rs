use super::{with_default_cacheability, Strategy, StrategyHandler, StrategyOptions};
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::time::Duration;

/// Result of the network leg: the response to use (fresh or cached
/// fallback), and the fetch error if the network failed.
#[derive(Clone)]
struct NetworkOutcome {
    response: Option<Response>,
    error: Option<Error>,
}

/// Try the network first; fall back to the cache.
///
/// With a network timeout, a cached response is served once the timer fires;
/// the network request keeps running and still updates the cache.
///
/// Unless a `cache_will_update` plugin is configured, responses with status
/// 200 and opaque responses are cached.
#[derive(Clone)]
pub struct NetworkFirst {
    options: StrategyOptions,
    network_timeout: Option<Duration>,
}

impl NetworkFirst {
    pub fn new(options: StrategyOptions) -> Self {
        NetworkFirst {
            options: with_default_cacheability(options),
            network_timeout: None,
        }
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    fn network_leg(
        handler: &StrategyHandler,
        request: &Request,
    ) -> Shared<BoxFuture<'static, Result<NetworkOutcome>>> {
        let handler = handler.clone();
        let request = request.clone();
        async move {
            match handler.fetch_and_cache_put(request.clone()).await {
                Ok(response) => Ok(NetworkOutcome {
                    response: Some(response),
                    error: None,
                }),
                Err(error) => {
                    debug!(
                        "NetworkFirst: network failed for {}, trying the cache",
                        request.url
                    );
                    let cached = handler.cache_match(request).await?;
                    Ok(NetworkOutcome {
                        response: cached,
                        error: Some(error),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[async_trait]
impl Strategy for NetworkFirst {
    fn options(&self) -> &StrategyOptions {
        &self.options
    }

    async fn handle_request(&self, request: &Request, handler: &StrategyHandler) -> Result<Response> {
        let network = Self::network_leg(handler, request);

        let background = network.clone();
        handler.wait_until(async move { background.await.map(|_| ()) });

        let outcome = match self.network_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, network.clone()).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    debug!(
                        "NetworkFirst: no network response for {} within {:?}",
                        request.url, timeout
                    );
                    if let Some(cached) = handler.cache_match(request.clone()).await? {
                        return Ok(cached);
                    }
                    network.await?
                }
            },
            None => network.await?,
        };

        match outcome.response {
            Some(response) => Ok(response),
            None => Err(Error::no_response(
                request.url.as_str(),
                outcome.error.as_ref(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CacheStorage;
    use crate::lifetime::ExtendableEvent;
    use crate::strategies::test_support::{fixture, url};
    use crate::strategies::HandlerParams;

    const BUCKET: &str = "offline-kit-runtime";

    #[tokio::test]
    async fn test_network_response_updates_cache() {
        let fx = fixture();
        fx.fetcher.respond("https://example.com/feed", Response::ok("fresh"));
        fx.storage
            .put(BUCKET, &url("/feed"), Response::ok("stale"))
            .await
            .unwrap();
        let strategy = NetworkFirst::new(StrategyOptions::new(fx.context.clone()));

        let event = ExtendableEvent::fetch();
        let response = strategy
            .handle(Request::get(url("/feed")), HandlerParams::default(), &event)
            .await
            .expect("Failed to handle");
        event.settled().await.unwrap();

        assert_eq!(response.body, b"fresh");
        let cached = fx
            .storage
            .match_in(BUCKET, &url("/feed"), Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, b"fresh");
    }

    #[tokio::test]
    async fn test_offline_falls_back_to_cache() {
        let fx = fixture();
        fx.fetcher.set_offline(true);
        fx.storage
            .put(BUCKET, &url("/feed"), Response::ok("stale"))
            .await
            .unwrap();
        let strategy = NetworkFirst::new(StrategyOptions::new(fx.context.clone()));

        let response = strategy
            .handle(Request::get(url("/feed")), HandlerParams::default(), &ExtendableEvent::fetch())
            .await
            .expect("Failed to fall back");
        assert_eq!(response.body, b"stale");
    }

    #[tokio::test]
    async fn test_timeout_serves_cache_and_network_still_updates() {
        let fx = fixture();
        fx.fetcher.respond_after(
            "https://example.com/feed",
            Response::ok("fresh"),
            Duration::from_millis(100),
        );
        fx.storage
            .put(BUCKET, &url("/feed"), Response::ok("stale"))
            .await
            .unwrap();
        let strategy = NetworkFirst::new(StrategyOptions::new(fx.context.clone()))
            .with_network_timeout(Duration::from_millis(10));

        let event = ExtendableEvent::fetch();
        let response = strategy
            .handle(Request::get(url("/feed")), HandlerParams::default(), &event)
            .await
            .expect("Failed to handle");
        assert_eq!(response.body, b"stale");

        event.settled().await.expect("Failed to settle");
        let cached = fx
            .storage
            .match_in(BUCKET, &url("/feed"), Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, b"fresh");
    }

    #[tokio::test]
    async fn test_opaque_responses_are_cached_by_default() {
        let fx = fixture();
        fx.fetcher
            .respond("https://cdn.example.net/lib.js", Response::opaque());
        let strategy = NetworkFirst::new(StrategyOptions::new(fx.context.clone()));

        let event = ExtendableEvent::fetch();
        strategy
            .handle(
                Request::parse_get("https://cdn.example.net/lib.js").unwrap(),
                HandlerParams::default(),
                &event,
            )
            .await
            .expect("Failed to handle");
        event.settled().await.unwrap();

        assert_eq!(fx.storage.keys(BUCKET).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_both_failing_is_no_response() {
        let fx = fixture();
        fx.fetcher.set_offline(true);
        let strategy = NetworkFirst::new(StrategyOptions::new(fx.context.clone()));

        let err = strategy
            .handle(Request::get(url("/feed")), HandlerParams::default(), &ExtendableEvent::fetch())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResponse { cause: Some(_), .. }));
    }
}
