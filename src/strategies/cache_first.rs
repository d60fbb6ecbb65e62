use super::{Strategy, StrategyHandler, StrategyOptions};
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use async_trait::async_trait;

/// Serve from cache; on a miss fetch, store and return.
///
/// Suited to revisioned assets (hashed file names) that never change under
/// the same URL.
#[derive(Clone)]
pub struct CacheFirst {
    options: StrategyOptions,
}

impl CacheFirst {
    pub fn new(options: StrategyOptions) -> Self {
        CacheFirst { options }
    }
}

#[async_trait]
impl Strategy for CacheFirst {
    fn options(&self) -> &StrategyOptions {
        &self.options
    }

    async fn handle_request(&self, request: &Request, handler: &StrategyHandler) -> Result<Response> {
        if let Some(cached) = handler.cache_match(request.clone()).await? {
            debug!("✓ CacheFirst HIT {}", request.url);
            return Ok(cached);
        }

        debug!("CacheFirst MISS {}, going to the network", request.url);
        handler
            .fetch_and_cache_put(request.clone())
            .await
            .map_err(|e| Error::no_response(request.url.as_str(), Some(&e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::ExtendableEvent;
    use crate::strategies::test_support::{fixture, url};
    use crate::strategies::HandlerParams;

    #[tokio::test]
    async fn test_miss_then_byte_identical_hit() {
        let fx = fixture();
        let body = vec![0u8, 1, 2, 255, 254];
        fx.fetcher.respond(
            "https://example.com/logo.png",
            Response::ok(body.clone()).with_header("Content-Type", "image/png"),
        );
        let strategy = CacheFirst::new(StrategyOptions::new(fx.context.clone()));

        let event = ExtendableEvent::fetch();
        let first = strategy
            .handle(Request::get(url("/logo.png")), HandlerParams::default(), &event)
            .await
            .expect("Failed to handle");
        event.settled().await.expect("Failed to settle");

        fx.fetcher.set_offline(true);
        let event = ExtendableEvent::fetch();
        let second = strategy
            .handle(Request::get(url("/logo.png")), HandlerParams::default(), &event)
            .await
            .expect("Failed to handle from cache");

        assert_eq!(second.body, body);
        assert_eq!(second, first);
        assert_eq!(fx.fetcher.calls("https://example.com/logo.png"), 1);
    }

    #[tokio::test]
    async fn test_miss_and_offline_is_no_response() {
        let fx = fixture();
        fx.fetcher.set_offline(true);
        let strategy = CacheFirst::new(StrategyOptions::new(fx.context.clone()));

        let err = strategy
            .handle(
                Request::get(url("/missing")),
                HandlerParams::default(),
                &ExtendableEvent::fetch(),
            )
            .await
            .unwrap_err();

        match err {
            Error::NoResponse { cause, .. } => assert!(cause.is_some()),
            other => panic!("Expected NoResponse, got {:?}", other),
        }
    }
}
