use super::{Queue, QueuedRequest};
use crate::error::{Error, Result};
use crate::http::Request;
use crate::plugin::{Hook, Plugin};
use crate::strategies::StrategyHandler;
use async_trait::async_trait;
use std::sync::Arc;

/// Queues requests whose fetch failed, for replay on the next sync.
#[derive(Clone)]
pub struct BackgroundSyncPlugin {
    queue: Arc<Queue>,
}

impl BackgroundSyncPlugin {
    pub fn new(queue: Arc<Queue>) -> Self {
        BackgroundSyncPlugin { queue }
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

#[async_trait]
impl Plugin for BackgroundSyncPlugin {
    fn handles(&self, hook: Hook) -> bool {
        hook == Hook::FetchDidFail
    }

    async fn fetch_did_fail(
        &self,
        _handler: &StrategyHandler,
        _original: &Request,
        request: &Request,
        error: &Error,
    ) -> Result<()> {
        // The replay must carry what request_will_fetch plugins added.
        info!(
            "Queueing {} {} in '{}' after: {}",
            request.method,
            request.url,
            self.queue.name(),
            error
        );
        self.queue
            .push_request(QueuedRequest::new(request.clone()))
            .await
    }
}
