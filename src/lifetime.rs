//! Lifetime extension of background work.
//!
//! Work that must finish before an event is considered complete (cache writes
//! after a response was returned, timestamp updates, queue replays) is spawned
//! onto the runtime and tracked in a [`PendingWork`] list. The owner drains the
//! list with [`PendingWork::done_waiting`]; work registered while draining is
//! drained too.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Ordered list of spawned background tasks.
#[derive(Clone, Default)]
pub struct PendingWork {
    tasks: Arc<Mutex<VecDeque<JoinHandle<Result<()>>>>>,
}

impl PendingWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` and keep its handle until the next drain.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.tasks.lock().push_back(handle);
    }

    /// Number of tasks not drained yet.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await every registered task, including tasks registered meanwhile.
    ///
    /// All tasks are awaited even if one fails; the first failure is returned.
    pub async fn done_waiting(&self) -> Result<()> {
        let mut first_error = None;
        loop {
            let next = self.tasks.lock().pop_front();
            let Some(handle) = next else { break };

            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Other(format!("Background task panicked: {}", e))),
            };
            if let Err(e) = outcome {
                warn!("⚠ Background work failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PendingWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWork")
            .field("pending", &self.len())
            .finish()
    }
}

/// Kind of event that triggered some work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
    Sync,
}

/// An event whose completion can be extended by background work.
///
/// Cloning an event shares its pending work.
#[derive(Clone, Debug)]
pub struct ExtendableEvent {
    kind: EventKind,
    pending: PendingWork,
}

impl ExtendableEvent {
    pub fn new(kind: EventKind) -> Self {
        ExtendableEvent {
            kind,
            pending: PendingWork::new(),
        }
    }

    pub fn fetch() -> Self {
        Self::new(EventKind::Fetch)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Extend the event until `work` completes.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.pending.wait_until(work);
    }

    /// Wait for every piece of work registered on this event.
    pub async fn settled(&self) -> Result<()> {
        self.pending.done_waiting().await
    }
}
