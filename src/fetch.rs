//! The fetch primitive: how the engine reaches the network.
//!
//! [`Fetcher`] is the seam between the strategies and the network. Two
//! implementations ship with the crate:
//!
//! - `HttpFetcher` (feature `http`): a `reqwest` client
//! - [`ScriptedFetcher`]: canned responses held in memory, with an offline
//!   switch, for tests and simulations

use crate::error::{Error, Result};
use crate::http::{strip_fragment, Request, Response};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Trait for network access.
///
/// A fetch fails (`Err`) only when no response was received at all; HTTP
/// error statuses are successful fetches.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Check `body` against a subresource integrity value.
///
/// `integrity` is a whitespace-separated list of `<alg>-<base64 digest>`
/// tokens. Only the strongest algorithm present is considered; the body
/// passes if it matches any digest of that algorithm. A value with no
/// supported algorithm passes.
pub fn verify_integrity(integrity: &str, body: &[u8]) -> bool {
    let tokens: Vec<(u8, &str, &str)> = integrity
        .split_whitespace()
        .filter_map(|token| {
            let token = token.split('?').next().unwrap_or(token);
            let (alg, digest) = token.split_once('-')?;
            let strength = match alg {
                "sha256" => 1,
                "sha384" => 2,
                "sha512" => 3,
                _ => return None,
            };
            Some((strength, alg, digest))
        })
        .collect();

    let Some(strongest) = tokens.iter().map(|(s, _, _)| *s).max() else {
        return true;
    };

    tokens
        .iter()
        .filter(|(s, _, _)| *s == strongest)
        .any(|(_, alg, expected)| {
            let actual = match *alg {
                "sha256" => STANDARD.encode(Sha256::digest(body)),
                "sha384" => STANDARD.encode(Sha384::digest(body)),
                _ => STANDARD.encode(Sha512::digest(body)),
            };
            actual == *expected
        })
}

/// Compute a `sha256-<base64>` integrity value for `body`.
pub fn sha256_integrity(body: &[u8]) -> String {
    format!("sha256-{}", STANDARD.encode(Sha256::digest(body)))
}

#[derive(Clone)]
enum Scripted {
    Respond(Response, Option<Duration>),
    Fail(String),
}

/// In-memory fetcher with scripted replies.
///
/// Unknown URLs answer `404`. While offline every fetch fails. Every request
/// received is recorded, including failed ones.
///
/// # Example
///
/// ```
/// use offline_kit::fetch::{Fetcher, ScriptedFetcher};
/// use offline_kit::http::{Request, Response};
///
/// # tokio_test_block(async {
/// let fetcher = ScriptedFetcher::new();
/// fetcher.respond("https://example.com/a", Response::ok("a"));
///
/// let request = Request::parse_get("https://example.com/a").unwrap();
/// assert_eq!(fetcher.fetch(&request).await.unwrap().body, b"a");
///
/// fetcher.set_offline(true);
/// assert!(fetcher.fetch(&request).await.is_err());
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    routes: Arc<DashMap<String, Scripted>>,
    offline: Arc<AtomicBool>,
    log: Arc<Mutex<Vec<Request>>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(url: &str) -> String {
        match url::Url::parse(url) {
            Ok(parsed) => strip_fragment(&parsed).to_string(),
            Err(_) => url.to_string(),
        }
    }

    /// Answer `url` with `response`.
    pub fn respond(&self, url: &str, response: Response) {
        self.routes
            .insert(Self::key(url), Scripted::Respond(response, None));
    }

    /// Answer `url` with `response` after `delay`.
    pub fn respond_after(&self, url: &str, response: Response, delay: Duration) {
        self.routes
            .insert(Self::key(url), Scripted::Respond(response, Some(delay)));
    }

    /// Make fetches of `url` fail with a network error.
    pub fn fail(&self, url: &str) {
        self.routes
            .insert(Self::key(url), Scripted::Fail(format!("connection refused: {}", url)));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of requests received for `url`.
    pub fn calls(&self, url: &str) -> usize {
        let key = Self::key(url);
        self.log
            .lock()
            .iter()
            .filter(|r| r.url_without_fragment() == key)
            .count()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.log.lock().push(request.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::FetchError(format!("offline: {}", request.url)));
        }

        let scripted = self
            .routes
            .get(&request.url_without_fragment())
            .map(|entry| entry.value().clone());

        match scripted {
            Some(Scripted::Respond(response, delay)) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(response.with_url(strip_fragment(&request.url)))
            }
            Some(Scripted::Fail(reason)) => Err(Error::FetchError(reason)),
            None => Ok(Response::new(404, "Not Found").with_url(strip_fragment(&request.url))),
        }
    }
}

#[cfg(feature = "http")]
pub use self::http_fetcher::HttpFetcher;

#[cfg(feature = "http")]
mod http_fetcher {
    use super::Fetcher;
    use crate::error::{Error, Result};
    use crate::http::{CacheMode, Headers, Request, Response, ResponseKind};
    use async_trait::async_trait;
    use reqwest::Client;
    use std::time::Duration;

    /// Fetcher backed by a `reqwest` client (rustls).
    #[derive(Clone)]
    pub struct HttpFetcher {
        http: Client,
    }

    impl HttpFetcher {
        /// Build a client with an optional overall request timeout.
        pub fn new(timeout: Option<Duration>) -> Result<Self> {
            let mut builder = Client::builder().use_rustls_tls();
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }
            let http = builder
                .build()
                .map_err(|e| Error::ConfigError(format!("failed to build HTTP client: {}", e)))?;
            Ok(HttpFetcher { http })
        }

        pub fn from_client(http: Client) -> Self {
            HttpFetcher { http }
        }
    }

    #[async_trait]
    impl Fetcher for HttpFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response> {
            let method = reqwest::Method::from_bytes(request.method.to_string().as_bytes())
                .map_err(|e| Error::FetchError(e.to_string()))?;

            let mut builder = self.http.request(method, request.url.clone());
            for (name, value) in request.headers.iter() {
                builder = builder.header(name, value);
            }
            if matches!(request.cache_mode, CacheMode::Reload | CacheMode::NoStore) {
                builder = builder.header("cache-control", "no-cache");
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await?;
            let status = response.status();
            let final_url = response.url().clone();
            let headers: Headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response.bytes().await?.to_vec();

            debug!(
                "✓ HTTP {} {} -> {} ({} bytes)",
                request.method,
                request.url,
                status.as_u16(),
                body.len()
            );

            Ok(Response {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers,
                body,
                redirected: final_url != request.url,
                url: Some(final_url),
                kind: ResponseKind::Basic,
            })
        }
    }
}
