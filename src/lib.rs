//! # offline-kit
//!
//! An embedded offline caching and request-replay engine: serve, version and
//! evict cached network responses, and replay failed mutating requests once
//! connectivity returns.
//!
//! ## Features
//!
//! - **Precaching:** install a versioned manifest of URLs; new revisions
//!   replace old ones on activation
//! - **Runtime strategies:** cache-first, network-first (with timeout),
//!   stale-while-revalidate, network-only and cache-only, all extensible
//!   through lifecycle plugins
//! - **Routing:** exact, regular-expression and custom matchers per HTTP
//!   method, with default and catch handlers
//! - **Expiration:** bound any runtime bucket by entry count and/or age
//! - **Background sync:** durable FIFO queues of failed requests, replayed in
//!   order with retry accounting
//! - **Backend agnostic:** cache storage, durable store and network are
//!   traits; in-memory, file-backed and `reqwest` implementations included
//!
//! ## Quick Start
//!
//! ```ignore
//! use offline_kit::{
//!     EngineConfig, OfflineEngine, PrecacheEntry,
//!     config::PrecacheRouteOptions,
//!     expiration::{ExpirationConfig, ExpirationPlugin},
//!     router::{Route, RouteMatcher},
//!     strategies::{CacheFirst, StrategyOptions},
//! };
//! use std::sync::Arc;
//!
//! let engine = OfflineEngine::builder(EngineConfig::from_file("offline.json")?).build()?;
//!
//! // 1. Precache the app shell
//! engine.precache_and_route(
//!     PrecacheEntry::parse_manifest(MANIFEST_JSON)?,
//!     PrecacheRouteOptions::default(),
//! )?;
//!
//! // 2. Cache images, at most 50 of them
//! let images = ExpirationPlugin::new(
//!     engine.context(),
//!     ExpirationConfig::default().with_max_entries(50),
//! )?;
//! engine.register_route(Route::new(
//!     RouteMatcher::regex(r"\.(png|jpg|svg)$")?,
//!     Arc::new(CacheFirst::new(
//!         StrategyOptions::new(engine.context().clone())
//!             .with_cache_name("images")
//!             .with_plugin(Arc::new(images)),
//!     )),
//! ));
//!
//! // 3. Run the lifecycle, then answer requests
//! engine.on_install().await?;
//! engine.on_activate().await?;
//! let response = engine.handle_fetch(request, &event).await?;
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod background_sync;
pub mod cacheable;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod fetch;
pub mod http;
pub mod lifetime;
pub mod observability;
pub mod plugin;
pub mod precache;
pub mod quota;
pub mod router;
pub mod serialization;
pub mod store;
pub mod strategies;

// Re-exports for convenience
pub use backend::{CacheStorage, InMemoryCacheStorage};
pub use background_sync::{BackgroundSyncPlugin, Queue, QueueOptions, QueuedRequest, SyncEvent};
pub use config::EngineConfig;
pub use context::CacheContext;
pub use engine::{ControlMessage, LifecycleState, MessageReply, OfflineEngine};
pub use error::{Error, Result};
pub use fetch::Fetcher;
pub use http::{Method, Request, Response};
pub use lifetime::ExtendableEvent;
pub use precache::{PrecacheController, PrecacheEntry};
pub use router::{Route, RouteMatcher, Router};
pub use store::EntryStore;
pub use strategies::{Strategy, StrategyOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
