//! The engine: one context object owning precache, routing, retry queues and
//! the version lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use offline_kit::{EngineConfig, OfflineEngine, PrecacheEntry};
//! use offline_kit::config::PrecacheRouteOptions;
//!
//! let engine = OfflineEngine::builder(EngineConfig::default()).build()?;
//! engine.precache_and_route(
//!     [PrecacheEntry::new("/index.html").with_revision("3")],
//!     PrecacheRouteOptions::default(),
//! )?;
//!
//! engine.on_install().await?;
//! engine.on_activate().await?;
//!
//! let event = ExtendableEvent::fetch();
//! let response = engine.handle_fetch(request, &event).await?;
//! event.settled().await?;
//! ```

use crate::background_sync::{Queue, QueueOptions, QueueRegistry, SyncEvent};
use crate::backend::{CacheStorage, InMemoryCacheStorage};
use crate::config::{EngineConfig, PrecacheRouteOptions};
use crate::context::CacheContext;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::http::{Request, Response};
use crate::lifetime::{EventKind, ExtendableEvent};
use crate::observability::CacheMetrics;
use crate::precache::{
    cleanup_outdated_caches, CleanupResult, InstallResult, PrecacheController, PrecacheEntry,
    PrecacheRoute,
};
use crate::router::{Route, Router};
use crate::store::EntryStore;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Build timestamp (seconds since the Unix epoch) reported by `GET_VERSION`.
pub const BUILD_TIMESTAMP: &str = env!("OFFLINE_KIT_BUILD_TIMESTAMP");

/// Lifecycle of one engine version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Parsed,
    Installing,
    /// Installed, waiting for activation.
    Installed,
    Activating,
    Activated,
    /// Install failed; this version will never control requests.
    Redundant,
}

/// Messages a client page can send to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    SkipWaiting,
    GetVersion,
    CacheUrls {
        #[serde(rename = "urlsToCache")]
        urls_to_cache: Vec<String>,
    },
}

impl ControlMessage {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Answer to a [`ControlMessage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageReply {
    Ack,
    Version {
        version: String,
        build_timestamp: String,
    },
    Cached {
        count: usize,
    },
}

/// Builder of [`OfflineEngine`].
pub struct OfflineEngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn CacheStorage>>,
    store: Option<Arc<EntryStore>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    metrics: Option<Arc<dyn CacheMetrics>>,
}

impl OfflineEngineBuilder {
    /// Cache storage; defaults to [`InMemoryCacheStorage`].
    pub fn with_storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Durable entry store; defaults to an in-memory store.
    pub fn with_store(mut self, store: Arc<EntryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Network fetcher; defaults to `HttpFetcher` with the `http` feature.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an invalid configuration, or when no
    /// fetcher was given and the `http` feature is disabled.
    pub fn build(self) -> Result<OfflineEngine> {
        self.config.validate()?;
        let scope = self.config.scope_url()?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => default_fetcher(&self.config)?,
        };
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryCacheStorage::new()));
        let store = self.store.unwrap_or_default();

        let mut context = CacheContext::new(storage, Arc::clone(&fetcher), store.clone())
            .with_cache_names(self.config.cache_names());
        if let Some(metrics) = self.metrics {
            context = context.with_metrics(metrics);
        }

        let precache = PrecacheController::new(&context, scope.clone());
        info!(
            "Engine {} built for scope {} (precache bucket {})",
            self.config.version,
            scope,
            precache.cache_name()
        );

        Ok(OfflineEngine {
            inner: Arc::new(EngineInner {
                router: Router::new(scope),
                queues: QueueRegistry::new(store, fetcher),
                precache,
                context,
                config: self.config,
                precache_route: Mutex::new(None),
                state: RwLock::new(LifecycleState::Parsed),
                skip_waiting: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(feature = "http")]
fn default_fetcher(config: &EngineConfig) -> Result<Arc<dyn Fetcher>> {
    Ok(Arc::new(crate::fetch::HttpFetcher::new(config.fetch_timeout())?))
}

#[cfg(not(feature = "http"))]
fn default_fetcher(_config: &EngineConfig) -> Result<Arc<dyn Fetcher>> {
    Err(Error::ConfigError(
        "No fetcher configured and the http feature is disabled".to_string(),
    ))
}

/// Offline caching engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OfflineEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    context: CacheContext,
    router: Router,
    precache: PrecacheController,
    precache_route: Mutex<Option<Arc<Route>>>,
    queues: QueueRegistry,
    state: RwLock<LifecycleState>,
    skip_waiting: AtomicBool,
}

impl OfflineEngine {
    pub fn builder(config: EngineConfig) -> OfflineEngineBuilder {
        OfflineEngineBuilder {
            config,
            storage: None,
            store: None,
            fetcher: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &CacheContext {
        &self.inner.context
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn precache_controller(&self) -> &PrecacheController {
        &self.inner.precache
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.inner.queues
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.read()
    }

    fn set_state(&self, state: LifecycleState) {
        let mut current = self.inner.state.write();
        debug!("Lifecycle {:?} -> {:?}", *current, state);
        *current = state;
    }

    /// Add entries to the precache manifest.
    pub fn precache<I, E>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = E>,
        E: Into<PrecacheEntry>,
    {
        self.inner.precache.add_entries(entries)
    }

    /// Add entries to the precache manifest and serve them through the
    /// precache route. The route is registered once, ahead of routes
    /// registered later.
    pub fn precache_and_route<I, E>(&self, entries: I, options: PrecacheRouteOptions) -> Result<()>
    where
        I: IntoIterator<Item = E>,
        E: Into<PrecacheEntry>,
    {
        self.precache(entries)?;

        let mut registered = self.inner.precache_route.lock();
        if registered.is_none() {
            let route = Arc::new(PrecacheRoute::new(&self.inner.precache, options)?.into_route());
            self.inner.router.register_route(Arc::clone(&route));
            *registered = Some(route);
        }
        Ok(())
    }

    pub fn register_route(&self, route: Route) -> Arc<Route> {
        let route = Arc::new(route);
        self.inner.router.register_route(Arc::clone(&route));
        route
    }

    /// Queue options with the configured retention.
    pub fn default_queue_options(&self) -> QueueOptions {
        QueueOptions::default().with_max_retention(self.inner.config.queue_retention())
    }

    /// # Errors
    ///
    /// Returns `Error::DuplicateQueueName` if the name is taken.
    pub fn create_queue(&self, name: impl Into<String>, options: QueueOptions) -> Result<Arc<Queue>> {
        self.inner.queues.create(name, options)
    }

    /// Install this version: fill the precache bucket.
    ///
    /// A failed install leaves the engine `Redundant`. When `skip_waiting`
    /// was requested the engine activates right away.
    pub async fn on_install(&self) -> Result<InstallResult> {
        self.set_state(LifecycleState::Installing);

        let event = ExtendableEvent::new(EventKind::Install);
        let installed = match self.inner.precache.install(&event).await {
            Ok(result) => event.settled().await.map(|_| result),
            Err(e) => Err(e),
        };

        let result = match installed {
            Ok(result) => result,
            Err(e) => {
                error!("Install of {} failed: {}", self.inner.config.version, e);
                self.set_state(LifecycleState::Redundant);
                return Err(e);
            }
        };
        self.set_state(LifecycleState::Installed);

        if self.inner.skip_waiting.load(Ordering::SeqCst) {
            self.on_activate().await?;
        }
        Ok(result)
    }

    /// Activate this version: delete precache entries (and, when configured,
    /// precache buckets) of older versions, and replay queues that do not
    /// wait for sync events.
    ///
    /// A failed activation leaves the engine `Installed`, so it can be
    /// retried.
    pub async fn on_activate(&self) -> Result<CleanupResult> {
        let state = self.state();
        if state != LifecycleState::Installed {
            return Err(Error::ConfigError(format!(
                "Cannot activate from state {:?}",
                state
            )));
        }
        self.set_state(LifecycleState::Activating);

        match self.run_activation().await {
            Ok(cleanup) => {
                self.set_state(LifecycleState::Activated);
                info!("✓ Version {} activated", self.inner.config.version);
                Ok(cleanup)
            }
            Err(e) => {
                // Still the waiting version: activation can be retried.
                error!("Activation of {} failed: {}", self.inner.config.version, e);
                self.set_state(LifecycleState::Installed);
                Err(e)
            }
        }
    }

    async fn run_activation(&self) -> Result<CleanupResult> {
        let event = ExtendableEvent::new(EventKind::Activate);
        let cleanup = self.inner.precache.activate().await?;

        if self.inner.config.cleanup_outdated_caches {
            let storage = Arc::clone(&self.inner.context.storage);
            let current = self.inner.precache.cache_name().to_string();
            event.wait_until(async move {
                cleanup_outdated_caches(storage.as_ref(), &current)
                    .await
                    .map(|_| ())
            });
        }

        for queue in self.inner.queues.queues() {
            if !queue.options().force_sync_fallback {
                continue;
            }
            event.wait_until(async move {
                if let Err(e) = queue.replay_requests().await {
                    warn!("⚠ Replay of queue '{}' at activation failed: {}", queue.name(), e);
                }
                Ok(())
            });
        }

        event.settled().await?;
        Ok(cleanup)
    }

    /// Activate as soon as installed, without waiting.
    pub async fn skip_waiting(&self) -> Result<()> {
        self.inner.skip_waiting.store(true, Ordering::SeqCst);
        if self.state() == LifecycleState::Installed {
            self.on_activate().await?;
        }
        Ok(())
    }

    /// Answer an intercepted request. `Ok(None)` means the request is not
    /// handled and should go to the network untouched; that is always the
    /// case until the engine is activated.
    pub async fn handle_fetch(
        &self,
        request: Request,
        event: &ExtendableEvent,
    ) -> Result<Option<Response>> {
        if self.state() != LifecycleState::Activated {
            debug!("Not handling {}: engine is not active", request.url);
            return Ok(None);
        }
        self.inner.router.handle_request(request, event).await
    }

    pub async fn handle_message(&self, message: ControlMessage) -> Result<MessageReply> {
        match message {
            ControlMessage::SkipWaiting => {
                self.skip_waiting().await?;
                Ok(MessageReply::Ack)
            }
            ControlMessage::GetVersion => Ok(MessageReply::Version {
                version: self.inner.config.version.clone(),
                build_timestamp: BUILD_TIMESTAMP.to_string(),
            }),
            ControlMessage::CacheUrls { urls_to_cache } => {
                let event = ExtendableEvent::new(EventKind::Message);
                self.inner.router.cache_urls(&urls_to_cache, &event).await?;
                event.settled().await?;
                Ok(MessageReply::Cached {
                    count: urls_to_cache.len(),
                })
            }
        }
    }

    /// Deliver a platform sync event to the queue owning its tag. Returns
    /// whether a queue handled it.
    pub async fn on_sync(&self, event: SyncEvent) -> Result<bool> {
        self.inner.queues.dispatch_sync(&event).await
    }

    /// Storage reported that its quota is exhausted.
    pub async fn on_quota_exceeded(&self) {
        self.inner.context.quota.run_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_sync::{BackgroundSyncPlugin, QueuedRequest};
    use crate::fetch::ScriptedFetcher;
    use crate::http::Method;
    use crate::router::RouteMatcher;
    use crate::strategies::{NetworkOnly, StaleWhileRevalidate, StrategyOptions};
    use url::Url;

    struct Harness {
        engine: OfflineEngine,
        fetcher: Arc<ScriptedFetcher>,
        storage: Arc<InMemoryCacheStorage>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let storage = Arc::new(InMemoryCacheStorage::new());
        let engine = OfflineEngine::builder(config)
            .with_fetcher(fetcher.clone())
            .with_storage(storage.clone())
            .build()
            .expect("Failed to build engine");
        Harness {
            engine,
            fetcher,
            storage,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default().with_scope("https://example.com/")
    }

    fn get(path: &str) -> Request {
        Request::parse_get(&format!("https://example.com{}", path)).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_and_precache_route() {
        let h = harness(config());
        h.fetcher.respond("https://example.com/index.html", Response::ok("home"));
        h.engine
            .precache_and_route(
                [PrecacheEntry::new("/index.html").with_revision("1")],
                PrecacheRouteOptions::default(),
            )
            .unwrap();
        assert_eq!(h.engine.state(), LifecycleState::Parsed);

        let event = ExtendableEvent::fetch();
        assert!(h.engine.handle_fetch(get("/"), &event).await.unwrap().is_none());

        h.engine.on_install().await.expect("Failed to install");
        assert_eq!(h.engine.state(), LifecycleState::Installed);
        h.engine.on_activate().await.expect("Failed to activate");
        assert_eq!(h.engine.state(), LifecycleState::Activated);

        h.fetcher.set_offline(true);
        let response = h
            .engine
            .handle_fetch(get("/"), &event)
            .await
            .unwrap()
            .expect("Precached response");
        assert_eq!(response.body, b"home");
    }

    #[tokio::test]
    async fn test_failed_install_is_redundant() {
        let h = harness(config());
        h.engine.precache(["/missing.js"]).unwrap();

        assert!(h.engine.on_install().await.is_err());
        assert_eq!(h.engine.state(), LifecycleState::Redundant);
        assert!(h.engine.on_activate().await.is_err());
    }

    #[tokio::test]
    async fn test_skip_waiting_activates_after_install() {
        let h = harness(config());
        let reply = h
            .engine
            .handle_message(ControlMessage::from_json(r#"{"type":"SKIP_WAITING"}"#).unwrap())
            .await
            .unwrap();
        assert_eq!(reply, MessageReply::Ack);

        h.engine.on_install().await.unwrap();
        assert_eq!(h.engine.state(), LifecycleState::Activated);
    }

    #[tokio::test]
    async fn test_get_version() {
        let h = harness(config().with_version("2024.06.1"));
        let reply = h.engine.handle_message(ControlMessage::GetVersion).await.unwrap();
        match reply {
            MessageReply::Version { version, build_timestamp } => {
                assert_eq!(version, "2024.06.1");
                assert!(!build_timestamp.is_empty());
            }
            other => panic!("Unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cache_urls_message() {
        let h = harness(config());
        h.fetcher.respond("https://example.com/articles/1", Response::ok("one"));
        h.engine.register_route(Route::new(
            RouteMatcher::regex("/articles/").unwrap(),
            Arc::new(StaleWhileRevalidate::new(
                StrategyOptions::new(h.engine.context().clone()).with_cache_name("articles"),
            )),
        ));

        let message = ControlMessage::from_json(
            r#"{"type":"CACHE_URLS","payload":{"urlsToCache":["/articles/1"]}}"#,
        )
        .unwrap();
        let reply = h.engine.handle_message(message).await.unwrap();
        assert_eq!(reply, MessageReply::Cached { count: 1 });
        assert_eq!(
            h.storage.keys("articles").await.unwrap(),
            vec!["https://example.com/articles/1"]
        );
    }

    #[tokio::test]
    async fn test_activation_cleans_outdated_precaches() {
        let h = harness(config().with_cleanup_outdated_caches(true));
        let url = Url::parse("https://example.com/").unwrap();
        h.storage
            .put("offline-kit-precache-v1", &url, Response::ok("old"))
            .await
            .unwrap();

        h.engine.on_install().await.unwrap();
        h.engine.on_activate().await.unwrap();
        assert!(!h.storage.has("offline-kit-precache-v1").await.unwrap());
    }

    /// Storage whose first bucket listing fails.
    struct FlakyListing {
        inner: InMemoryCacheStorage,
        failed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl CacheStorage for FlakyListing {
        async fn open(&self, bucket: &str) -> Result<()> {
            self.inner.open(bucket).await
        }
        async fn has(&self, bucket: &str) -> Result<bool> {
            self.inner.has(bucket).await
        }
        async fn delete(&self, bucket: &str) -> Result<bool> {
            self.inner.delete(bucket).await
        }
        async fn bucket_names(&self) -> Result<Vec<String>> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(Error::StorageError("transient".to_string()));
            }
            self.inner.bucket_names().await
        }
        async fn match_in(
            &self,
            bucket: &str,
            key: &Url,
            options: crate::backend::MatchOptions,
        ) -> Result<Option<Response>> {
            self.inner.match_in(bucket, key, options).await
        }
        async fn put(&self, bucket: &str, key: &Url, response: Response) -> Result<()> {
            self.inner.put(bucket, key, response).await
        }
        async fn delete_entry(
            &self,
            bucket: &str,
            key: &Url,
            options: crate::backend::MatchOptions,
        ) -> Result<bool> {
            self.inner.delete_entry(bucket, key, options).await
        }
        async fn keys(&self, bucket: &str) -> Result<Vec<String>> {
            self.inner.keys(bucket).await
        }
        async fn records(&self, bucket: &str) -> Result<Vec<crate::backend::CacheRecord>> {
            self.inner.records(bucket).await
        }
    }

    #[tokio::test]
    async fn test_failed_activation_can_be_retried() {
        let storage = Arc::new(FlakyListing {
            inner: InMemoryCacheStorage::new(),
            failed: AtomicBool::new(false),
        });
        let engine = OfflineEngine::builder(config().with_cleanup_outdated_caches(true))
            .with_fetcher(Arc::new(ScriptedFetcher::new()))
            .with_storage(storage)
            .build()
            .expect("Failed to build engine");

        engine.on_install().await.expect("Failed to install");
        let err = engine.on_activate().await.unwrap_err();
        assert!(matches!(err, Error::StorageError(_)));
        assert_eq!(engine.state(), LifecycleState::Installed);

        engine.on_activate().await.expect("Failed to activate on retry");
        assert_eq!(engine.state(), LifecycleState::Activated);
    }

    #[tokio::test]
    async fn test_force_sync_fallback_replays_at_activation() {
        let h = harness(config());
        let queue = h
            .engine
            .create_queue("forms", QueueOptions::default().with_force_sync_fallback(true))
            .unwrap();
        let request = Request::new(Method::Post, Url::parse("https://example.com/api").unwrap());
        queue.push_request(QueuedRequest::new(request)).await.unwrap();
        h.fetcher.respond("https://example.com/api", Response::ok(""));

        h.engine.on_install().await.unwrap();
        h.engine.on_activate().await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_event_replays_queue() {
        let h = harness(config());
        let queue = h
            .engine
            .create_queue("forms", h.engine.default_queue_options())
            .unwrap();
        h.engine.register_route(
            Route::new(
                RouteMatcher::exact("/api/items"),
                Arc::new(NetworkOnly::new(
                    StrategyOptions::new(h.engine.context().clone())
                        .with_plugin(Arc::new(BackgroundSyncPlugin::new(Arc::clone(&queue)))),
                )),
            )
            .with_method(Method::Post),
        );
        h.engine.on_install().await.unwrap();
        h.engine.on_activate().await.unwrap();

        h.fetcher.set_offline(true);
        let post = Request::new(Method::Post, Url::parse("https://example.com/api/items").unwrap())
            .with_body("item");
        let event = ExtendableEvent::fetch();
        assert!(h.engine.handle_fetch(post, &event).await.is_err());
        assert_eq!(queue.size().await.unwrap(), 1);

        h.fetcher.set_offline(false);
        h.fetcher.respond("https://example.com/api/items", Response::new(201, ""));
        let handled = h
            .engine
            .on_sync(SyncEvent::new("background-sync:forms"))
            .await
            .unwrap();
        assert!(handled);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[test]
    fn test_duplicate_queue() {
        let h = harness(config());
        h.engine.create_queue("forms", QueueOptions::default()).unwrap();
        assert!(matches!(
            h.engine.create_queue("forms", QueueOptions::default()),
            Err(Error::DuplicateQueueName(_))
        ));
    }
}
