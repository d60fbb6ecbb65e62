use super::{Strategy, StrategyHandler, StrategyOptions};
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use async_trait::async_trait;
use futures::FutureExt;
use std::time::Duration;

/// Always go to the network. Nothing is cached.
///
/// With a network timeout, a slow response counts as a failure; the request
/// itself keeps running in the background.
#[derive(Clone)]
pub struct NetworkOnly {
    options: StrategyOptions,
    network_timeout: Option<Duration>,
}

impl NetworkOnly {
    pub fn new(options: StrategyOptions) -> Self {
        NetworkOnly {
            options,
            network_timeout: None,
        }
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Strategy for NetworkOnly {
    fn options(&self) -> &StrategyOptions {
        &self.options
    }

    async fn handle_request(&self, request: &Request, handler: &StrategyHandler) -> Result<Response> {
        let fetch = {
            let handler = handler.clone();
            let request = request.clone();
            async move { handler.fetch(request).await }.boxed().shared()
        };

        let outcome = match self.network_timeout {
            Some(timeout) => {
                let background = fetch.clone();
                handler.wait_until(async move {
                    let _ = background.await;
                    Ok(())
                });
                match tokio::time::timeout(timeout, fetch).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "Timed out the network response for {} after {:?}",
                        request.url, timeout
                    ))),
                }
            }
            None => fetch.await,
        };

        outcome.map_err(|e| Error::no_response(request.url.as_str(), Some(&e)))
    }
}
