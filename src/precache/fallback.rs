use super::controller::PrecacheController;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::plugin::{Hook, Plugin};
use crate::strategies::StrategyHandler;
use async_trait::async_trait;

/// Answers a failed strategy with a precached fallback response, such as an
/// offline page.
#[derive(Clone)]
pub struct PrecacheFallbackPlugin {
    fallback_url: String,
    controller: PrecacheController,
}

impl PrecacheFallbackPlugin {
    pub fn new(controller: &PrecacheController, fallback_url: impl Into<String>) -> Self {
        PrecacheFallbackPlugin {
            fallback_url: fallback_url.into(),
            controller: controller.clone(),
        }
    }
}

#[async_trait]
impl Plugin for PrecacheFallbackPlugin {
    fn handles(&self, hook: Hook) -> bool {
        hook == Hook::HandlerDidError
    }

    async fn handler_did_error(
        &self,
        _handler: &StrategyHandler,
        request: &Request,
        error: &Error,
    ) -> Result<Option<Response>> {
        debug!(
            "Serving fallback {} for {} after: {}",
            self.fallback_url, request.url, error
        );
        self.controller.match_precache(&self.fallback_url).await
    }
}
