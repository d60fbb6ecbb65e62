use super::{Strategy, StrategyHandler, StrategyOptions};
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use async_trait::async_trait;

/// Serve from cache only; a miss is `Error::NoResponse`.
#[derive(Clone)]
pub struct CacheOnly {
    options: StrategyOptions,
}

impl CacheOnly {
    pub fn new(options: StrategyOptions) -> Self {
        CacheOnly { options }
    }
}

#[async_trait]
impl Strategy for CacheOnly {
    fn options(&self) -> &StrategyOptions {
        &self.options
    }

    async fn handle_request(&self, request: &Request, handler: &StrategyHandler) -> Result<Response> {
        handler
            .cache_match(request.clone())
            .await?
            .ok_or_else(|| Error::no_response(request.url.as_str(), None))
    }
}
