//! Callbacks run when cache storage reports that its quota is exhausted.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;

/// A quota callback. Failures are the callback's own business to log.
pub type QuotaCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Ordered, shared list of quota callbacks.
#[derive(Clone, Default)]
pub struct QuotaCallbacks {
    callbacks: Arc<RwLock<Vec<QuotaCallback>>>,
}

impl QuotaCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: QuotaCallback) {
        self.callbacks.write().push(callback);
        debug!("Registered quota callback #{}", self.len());
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every callback, one after the other, in registration order.
    pub async fn run_all(&self) {
        let callbacks: Vec<QuotaCallback> = self.callbacks.read().clone();
        info!("Running {} quota callback(s)", callbacks.len());
        for callback in callbacks {
            callback().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_callbacks_run_in_order() {
        let quota = QuotaCallbacks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            quota.register(Arc::new(move || {
                let order = Arc::clone(&order);
                async move { order.lock().push(i) }.boxed()
            }));
        }

        quota.run_all().await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
