//! Background sync: durable retry queues for requests that failed to reach
//! the network.
//!
//! A failed request is converted to a [`StorableRequest`] and appended to a
//! named [`Queue`] backed by the durable entry store. When connectivity
//! returns the platform fires a sync event tagged `background-sync:<name>`,
//! and the queue replays its requests oldest first. A replay that fails puts
//! the request back at the head of the queue and stops, so ordering survives
//! any number of attempts.

use crate::error::Result;
use crate::http::{CacheMode, Headers, Method, Request, RequestMode};
use crate::store::EntryMetadata;
use serde::{Deserialize, Serialize};
use url::Url;

pub mod plugin;
pub mod queue;

pub use plugin::BackgroundSyncPlugin;
pub use queue::{Queue, QueueOptions, QueueRegistry, SyncCallback};

/// Prefix of the sync tag of every queue.
pub const SYNC_TAG_PREFIX: &str = "background-sync";

/// A request in a form that can be written to the durable store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorableRequest {
    pub url: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub mode: RequestMode,
    pub integrity: Option<String>,
    pub cache_mode: CacheMode,
}

impl StorableRequest {
    /// Capture `request`.
    ///
    /// A navigation cannot be re-issued as such, so its mode is stored as
    /// `SameOrigin`. Bodies of `GET` and `HEAD` requests are not kept.
    pub fn from_request(request: &Request) -> Self {
        let mode = match request.mode {
            RequestMode::Navigate => RequestMode::SameOrigin,
            other => other,
        };
        StorableRequest {
            url: request.url.to_string(),
            method: request.method,
            headers: request.headers.clone(),
            body: request
                .body
                .clone()
                .filter(|_| request.method.has_body()),
            mode,
            integrity: request.integrity.clone(),
            cache_mode: request.cache_mode,
        }
    }

    /// Rebuild a request that can be handed to the fetcher.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUrl` if the stored URL no longer parses.
    pub fn to_request(&self) -> Result<Request> {
        let mut request = Request::new(self.method, Url::parse(&self.url)?);
        request.headers = self.headers.clone();
        request.body = self.body.clone();
        request.mode = self.mode;
        request.integrity = self.integrity.clone();
        request.cache_mode = self.cache_mode;
        Ok(request)
    }
}

/// A request entering or leaving a queue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedRequest {
    pub request: Request,
    /// Milliseconds since the Unix epoch; `None` means now.
    pub timestamp: Option<i64>,
    pub metadata: EntryMetadata,
}

impl QueuedRequest {
    pub fn new(request: Request) -> Self {
        QueuedRequest {
            request,
            timestamp: None,
            metadata: EntryMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A platform sync trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEvent {
    pub tag: String,
    /// Set when the platform will not retry after this attempt.
    pub last_chance: bool,
}

impl SyncEvent {
    pub fn new(tag: impl Into<String>) -> Self {
        SyncEvent {
            tag: tag.into(),
            last_chance: false,
        }
    }

    pub fn last_chance(mut self) -> Self {
        self.last_chance = true;
        self
    }
}
