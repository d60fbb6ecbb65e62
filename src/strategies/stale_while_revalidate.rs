use super::{with_default_cacheability, Strategy, StrategyHandler, StrategyOptions};
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use async_trait::async_trait;
use futures::FutureExt;

/// Serve the cached copy immediately and refresh it in the background.
///
/// On a miss the background fetch is awaited instead. Unless a
/// `cache_will_update` plugin is configured, responses with status 200 and
/// opaque responses are cached.
#[derive(Clone)]
pub struct StaleWhileRevalidate {
    options: StrategyOptions,
}

impl StaleWhileRevalidate {
    pub fn new(options: StrategyOptions) -> Self {
        StaleWhileRevalidate {
            options: with_default_cacheability(options),
        }
    }
}

#[async_trait]
impl Strategy for StaleWhileRevalidate {
    fn options(&self) -> &StrategyOptions {
        &self.options
    }

    async fn handle_request(&self, request: &Request, handler: &StrategyHandler) -> Result<Response> {
        let revalidate = {
            let handler = handler.clone();
            let request = request.clone();
            async move { handler.fetch_and_cache_put(request).await }
                .boxed()
                .shared()
        };

        let background = revalidate.clone();
        handler.wait_until(async move {
            // Failures surface through the response path when there is no cached copy.
            let _ = background.await;
            Ok(())
        });

        if let Some(cached) = handler.cache_match(request.clone()).await? {
            debug!("✓ StaleWhileRevalidate HIT {}, revalidating", request.url);
            return Ok(cached);
        }

        revalidate
            .await
            .map_err(|e| Error::no_response(request.url.as_str(), Some(&e)))
    }
}
