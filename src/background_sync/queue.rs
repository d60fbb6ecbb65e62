//! Named retry queues and their registry.

use super::{QueuedRequest, StorableRequest, SyncEvent, SYNC_TAG_PREFIX};
use crate::config::DEFAULT_QUEUE_RETENTION_MINUTES;
use crate::error::{Error, Result};
use crate::expiration::now_millis;
use crate::fetch::Fetcher;
use crate::store::{NewQueueEntry, QueueEntry, QueueRepository};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Replaces the default replay of a queue when its sync event fires.
pub type SyncCallback = Arc<dyn Fn(Arc<Queue>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Options of one queue.
#[derive(Clone)]
pub struct QueueOptions {
    /// Entries older than this are dropped instead of replayed.
    pub max_retention: Duration,
    /// Failed replays allowed per entry before it is dropped. `None` retries
    /// until the entry expires.
    pub max_retries: Option<u32>,
    /// Replay at engine activation instead of waiting for a sync event.
    pub force_sync_fallback: bool,
    pub on_sync: Option<SyncCallback>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            max_retention: Duration::from_secs(DEFAULT_QUEUE_RETENTION_MINUTES * 60),
            max_retries: None,
            force_sync_fallback: false,
            on_sync: None,
        }
    }
}

impl QueueOptions {
    pub fn with_max_retention(mut self, max_retention: Duration) -> Self {
        self.max_retention = max_retention;
        self
    }

    pub fn with_max_retention_minutes(self, minutes: u64) -> Self {
        self.with_max_retention(Duration::from_secs(minutes * 60))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_force_sync_fallback(mut self, force: bool) -> Self {
        self.force_sync_fallback = force;
        self
    }

    pub fn with_on_sync(mut self, on_sync: SyncCallback) -> Self {
        self.on_sync = Some(on_sync);
        self
    }
}

#[derive(Debug, Default)]
struct SyncState {
    registered: bool,
    in_progress: bool,
    added_during_sync: bool,
}

enum Position {
    Tail,
    Head,
}

/// A durable FIFO queue of failed requests.
pub struct Queue {
    name: String,
    options: QueueOptions,
    repository: Arc<dyn QueueRepository>,
    fetcher: Arc<dyn Fetcher>,
    sync_lock: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<SyncState>,
}

impl Queue {
    fn new(
        name: String,
        options: QueueOptions,
        repository: Arc<dyn QueueRepository>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Queue {
            name,
            options,
            repository,
            fetcher,
            sync_lock: tokio::sync::Mutex::new(()),
            state: parking_lot::Mutex::new(SyncState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Tag of the sync event that replays this queue.
    pub fn sync_tag(&self) -> String {
        format!("{}:{}", SYNC_TAG_PREFIX, self.name)
    }

    /// Append `entry` at the tail.
    pub async fn push_request(&self, entry: QueuedRequest) -> Result<()> {
        self.add_request(entry, Position::Tail).await
    }

    /// Insert `entry` at the head.
    pub async fn unshift_request(&self, entry: QueuedRequest) -> Result<()> {
        self.add_request(entry, Position::Head).await
    }

    /// Remove and return the newest entry that has not expired.
    pub async fn pop_request(&self) -> Result<Option<QueuedRequest>> {
        self.remove_request(Position::Tail).await
    }

    /// Remove and return the oldest entry that has not expired.
    pub async fn shift_request(&self) -> Result<Option<QueuedRequest>> {
        self.remove_request(Position::Head).await
    }

    /// Every entry that has not expired, oldest first. Expired entries are
    /// deleted.
    pub async fn get_all(&self) -> Result<Vec<QueuedRequest>> {
        let now = now_millis();
        let mut live = Vec::new();
        for entry in self.repository.entries(&self.name).await? {
            if self.is_expired(&entry, now) {
                self.repository.delete_entry(&self.name, entry.id).await?;
                debug!("Dropped expired request {} from queue '{}'", entry.request.url, self.name);
            } else {
                live.push(to_queued(entry)?);
            }
        }
        Ok(live)
    }

    /// Number of stored entries, expired ones included.
    pub async fn size(&self) -> Result<usize> {
        self.repository.size(&self.name).await
    }

    /// Replay every entry, oldest first.
    ///
    /// The first request that fails at the network level goes back to the
    /// head of the queue with its retry count incremented (or is dropped once
    /// it exceeds `max_retries`) and the replay stops with
    /// `Error::ReplayFailed`. HTTP error statuses count as delivered.
    pub async fn replay_requests(&self) -> Result<()> {
        while let Some(mut entry) = self.shift_request().await? {
            match self.fetcher.fetch(&entry.request).await {
                Ok(response) => {
                    debug!(
                        "✓ Replayed {} {} from queue '{}' ({})",
                        entry.request.method, entry.request.url, self.name, response.status
                    );
                }
                Err(e) => {
                    entry.metadata.retry_count += 1;
                    let exhausted = self
                        .options
                        .max_retries
                        .is_some_and(|max| entry.metadata.retry_count > max);

                    if exhausted {
                        warn!(
                            "⚠ Dropping {} from queue '{}' after {} failed replays: {}",
                            entry.request.url, self.name, entry.metadata.retry_count, e
                        );
                    } else {
                        warn!(
                            "⚠ Replay of {} from queue '{}' failed, requeued: {}",
                            entry.request.url, self.name, e
                        );
                        self.unshift_request(entry).await?;
                    }
                    return Err(Error::ReplayFailed {
                        queue: self.name.clone(),
                    });
                }
            }
        }
        info!("✓ All requests in queue '{}' have been replayed", self.name);
        Ok(())
    }

    /// Handle the sync event of this queue.
    ///
    /// Runs the `on_sync` callback (default: [`Queue::replay_requests`]), one
    /// sync at a time. Requests queued meanwhile register a new sync,
    /// unless the replay failed and the platform will retry anyway.
    pub async fn on_sync(self: &Arc<Self>, event: &SyncEvent) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        {
            let mut state = self.state.lock();
            state.registered = false;
            state.in_progress = true;
            state.added_during_sync = false;
        }
        debug!("Sync '{}' started (last chance: {})", event.tag, event.last_chance);

        let outcome = match &self.options.on_sync {
            Some(callback) => callback(Arc::clone(self)).await,
            None => self.replay_requests().await,
        };

        let added_during_sync = {
            let mut state = self.state.lock();
            state.in_progress = false;
            std::mem::take(&mut state.added_during_sync)
        };
        let platform_retries = outcome.is_err() && !event.last_chance;
        if added_during_sync && !platform_retries {
            self.register_sync();
        }
        outcome
    }

    /// Ask for a sync event. Queues replaying at activation never register.
    pub fn register_sync(&self) {
        if self.options.force_sync_fallback {
            return;
        }
        let mut state = self.state.lock();
        if !state.registered {
            state.registered = true;
            debug!("Registered sync '{}'", self.sync_tag());
        }
    }

    pub fn is_sync_registered(&self) -> bool {
        self.state.lock().registered
    }

    fn is_expired(&self, entry: &QueueEntry, now: i64) -> bool {
        now - entry.timestamp > self.options.max_retention.as_millis() as i64
    }

    async fn add_request(&self, entry: QueuedRequest, position: Position) -> Result<()> {
        let new_entry = NewQueueEntry {
            request: StorableRequest::from_request(&entry.request),
            timestamp: entry.timestamp.unwrap_or_else(now_millis),
            metadata: entry.metadata,
        };

        match position {
            Position::Tail => self.repository.push_entry(&self.name, new_entry).await?,
            Position::Head => self.repository.unshift_entry(&self.name, new_entry).await?,
        };
        debug!(
            "Queued {} {} in '{}'",
            entry.request.method, entry.request.url, self.name
        );

        let in_progress = {
            let mut state = self.state.lock();
            if state.in_progress {
                state.added_during_sync = true;
            }
            state.in_progress
        };
        if !in_progress {
            self.register_sync();
        }
        Ok(())
    }

    async fn remove_request(&self, position: Position) -> Result<Option<QueuedRequest>> {
        loop {
            let entry = match position {
                Position::Head => self.repository.shift_entry(&self.name).await?,
                Position::Tail => self.repository.pop_entry(&self.name).await?,
            };
            let Some(entry) = entry else {
                return Ok(None);
            };

            if self.is_expired(&entry, now_millis()) {
                debug!("Dropped expired request {} from queue '{}'", entry.request.url, self.name);
                continue;
            }
            return to_queued(entry).map(Some);
        }
    }
}

fn to_queued(entry: QueueEntry) -> Result<QueuedRequest> {
    Ok(QueuedRequest {
        request: entry.request.to_request()?,
        timestamp: Some(entry.timestamp),
        metadata: entry.metadata,
    })
}

/// Registry of queues by unique name.
#[derive(Clone)]
pub struct QueueRegistry {
    repository: Arc<dyn QueueRepository>,
    fetcher: Arc<dyn Fetcher>,
    queues: Arc<DashMap<String, Arc<Queue>>>,
}

impl QueueRegistry {
    pub fn new(repository: Arc<dyn QueueRepository>, fetcher: Arc<dyn Fetcher>) -> Self {
        QueueRegistry {
            repository,
            fetcher,
            queues: Arc::new(DashMap::new()),
        }
    }

    /// Create the queue `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateQueueName` if a queue of that name exists.
    pub fn create(&self, name: impl Into<String>, options: QueueOptions) -> Result<Arc<Queue>> {
        let name = name.into();
        match self.queues.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateQueueName(name)),
            Entry::Vacant(slot) => {
                let queue = Arc::new(Queue::new(
                    name,
                    options,
                    Arc::clone(&self.repository),
                    Arc::clone(&self.fetcher),
                ));
                info!("Created queue '{}'", queue.name());
                slot.insert(Arc::clone(&queue));
                Ok(queue)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    /// All queues, by name.
    pub fn queues(&self) -> Vec<Arc<Queue>> {
        let mut queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| Arc::clone(q.value())).collect();
        queues.sort_by(|a, b| a.name().cmp(b.name()));
        queues
    }

    /// Tags of the queues waiting for a sync event.
    pub fn registered_tags(&self) -> Vec<String> {
        self.queues()
            .into_iter()
            .filter(|q| q.is_sync_registered())
            .map(|q| q.sync_tag())
            .collect()
    }

    /// Route `event` to the queue owning its tag. Returns `Ok(false)` when no
    /// queue owns it.
    pub async fn dispatch_sync(&self, event: &SyncEvent) -> Result<bool> {
        let queue = self
            .queues
            .iter()
            .find(|q| q.value().sync_tag() == event.tag)
            .map(|q| Arc::clone(q.value()));

        match queue {
            Some(queue) => {
                queue.on_sync(event).await?;
                Ok(true)
            }
            None => {
                debug!("No queue owns sync tag '{}'", event.tag);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ScriptedFetcher;
    use crate::http::{Method, Request, Response};
    use crate::store::EntryStore;
    use futures::FutureExt;
    use url::Url;

    struct Harness {
        registry: QueueRegistry,
        fetcher: Arc<ScriptedFetcher>,
        store: Arc<EntryStore>,
    }

    fn harness() -> Harness {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let store = Arc::new(EntryStore::in_memory());
        Harness {
            registry: QueueRegistry::new(store.clone(), fetcher.clone()),
            fetcher,
            store,
        }
    }

    fn post(path: &str) -> QueuedRequest {
        let url = Url::parse(&format!("https://api.example.com{}", path)).unwrap();
        QueuedRequest::new(Request::new(Method::Post, url).with_body(path))
    }

    fn path_of(entry: &QueuedRequest) -> String {
        entry.request.url.path().to_string()
    }

    #[test]
    fn test_duplicate_queue_name() {
        let h = harness();
        h.registry.create("forms", QueueOptions::default()).unwrap();
        assert!(matches!(
            h.registry.create("forms", QueueOptions::default()),
            Err(Error::DuplicateQueueName(name)) if name == "forms"
        ));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let h = harness();
        let queue = h.registry.create("forms", QueueOptions::default()).unwrap();
        for path in ["/a", "/b", "/c"] {
            queue.push_request(post(path)).await.unwrap();
        }
        queue.unshift_request(post("/first")).await.unwrap();

        let newest = queue.pop_request().await.unwrap().unwrap();
        assert_eq!(path_of(&newest), "/c");

        let mut order = Vec::new();
        while let Some(entry) = queue.shift_request().await.unwrap() {
            order.push(path_of(&entry));
        }
        assert_eq!(order, vec!["/first", "/a", "/b"]);
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let h = harness();
        let queue = h
            .registry
            .create("forms", QueueOptions::default().with_max_retention_minutes(60))
            .unwrap();
        let two_hours_ago = now_millis() - 2 * 60 * 60 * 1000;
        queue
            .push_request(post("/stale").with_timestamp(two_hours_ago))
            .await
            .unwrap();
        queue.push_request(post("/fresh")).await.unwrap();

        let all = queue.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(path_of(&all[0]), "/fresh");
        assert_eq!(h.store.size("forms").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shift_skips_expired_head() {
        let h = harness();
        let queue = h
            .registry
            .create("forms", QueueOptions::default().with_max_retention_minutes(1))
            .unwrap();
        queue
            .push_request(post("/stale").with_timestamp(now_millis() - 120_000))
            .await
            .unwrap();

        assert!(queue.shift_request().await.unwrap().is_none());
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_stops_and_requeues_on_failure() {
        let h = harness();
        let queue = h.registry.create("forms", QueueOptions::default()).unwrap();
        for path in ["/a", "/b", "/c"] {
            queue.push_request(post(path)).await.unwrap();
        }
        h.fetcher.respond("https://api.example.com/a", Response::ok(""));
        h.fetcher.fail("https://api.example.com/b");

        let err = queue.replay_requests().await.unwrap_err();
        assert!(matches!(err, Error::ReplayFailed { .. }));

        let remaining = queue.get_all().await.unwrap();
        let paths: Vec<String> = remaining.iter().map(path_of).collect();
        assert_eq!(paths, vec!["/b", "/c"]);
        assert_eq!(remaining[0].metadata.retry_count, 1);
        assert_eq!(h.fetcher.calls("https://api.example.com/c"), 0);
    }

    #[tokio::test]
    async fn test_http_error_status_counts_as_delivered() {
        let h = harness();
        let queue = h.registry.create("forms", QueueOptions::default()).unwrap();
        queue.push_request(post("/a")).await.unwrap();
        h.fetcher.respond("https://api.example.com/a", Response::new(500, ""));

        queue.replay_requests().await.expect("Failed to replay");
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_max_retries_drops_entry() {
        let h = harness();
        let queue = h
            .registry
            .create("forms", QueueOptions::default().with_max_retries(1))
            .unwrap();
        queue.push_request(post("/a")).await.unwrap();
        h.fetcher.fail("https://api.example.com/a");

        assert!(queue.replay_requests().await.is_err());
        assert_eq!(queue.size().await.unwrap(), 1);
        assert!(queue.replay_requests().await.is_err());
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_registration() {
        let h = harness();
        let queue = h.registry.create("forms", QueueOptions::default()).unwrap();
        assert_eq!(queue.sync_tag(), "background-sync:forms");
        assert!(!queue.is_sync_registered());

        queue.push_request(post("/a")).await.unwrap();
        assert!(queue.is_sync_registered());
        assert_eq!(h.registry.registered_tags(), vec!["background-sync:forms"]);

        h.fetcher.respond("https://api.example.com/a", Response::ok(""));
        let handled = h
            .registry
            .dispatch_sync(&SyncEvent::new("background-sync:forms"))
            .await
            .unwrap();
        assert!(handled);
        assert!(!queue.is_sync_registered());
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requests_added_during_sync_register_again() {
        let h = harness();
        let on_sync: SyncCallback = Arc::new(|queue: Arc<Queue>| {
            async move { queue.push_request(post("/late")).await }.boxed()
        });
        let queue = h
            .registry
            .create("forms", QueueOptions::default().with_on_sync(on_sync))
            .unwrap();

        queue.on_sync(&SyncEvent::new(queue.sync_tag())).await.unwrap();
        assert!(queue.is_sync_registered());
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_force_sync_fallback_never_registers() {
        let h = harness();
        let queue = h
            .registry
            .create("forms", QueueOptions::default().with_force_sync_fallback(true))
            .unwrap();
        queue.push_request(post("/a")).await.unwrap();
        assert!(!queue.is_sync_registered());
    }

    #[tokio::test]
    async fn test_unknown_sync_tag() {
        let h = harness();
        assert!(!h
            .registry
            .dispatch_sync(&SyncEvent::new("background-sync:none"))
            .await
            .unwrap());
    }
}
