//! Request and response model for intercepted traffic.
//!
//! These types are deliberately small: the engine only needs the method, URL,
//! headers and body of a request, and the status, headers and body of a
//! response. They are `Clone` so a response can be both returned to the
//! caller and written to cache storage.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// HTTP request method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    /// Whether requests with this method carry a body worth storing.
    pub fn has_body(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            other => Err(Error::Other(format!("Unsupported method: {}", other))),
        }
    }
}

/// Header map with case-insensitive names.
///
/// Names are stored lowercased; iteration order is sorted by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Headers(BTreeMap::new())
    }

    /// Get a header value by (case-insensitive) name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// Set a header, replacing any previous value.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Request mode, mirroring what the interception layer reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

/// How the fetch primitive should treat the HTTP cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    #[default]
    Default,
    /// Bypass any intermediate HTTP cache (used for revisioned precache entries).
    Reload,
    NoStore,
}

/// An intercepted request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub mode: RequestMode,
    /// Subresource integrity value (`sha256-<base64>`) the response body must match.
    pub integrity: Option<String>,
    pub cache_mode: CacheMode,
}

impl Request {
    /// Create a request for `url` with the given method.
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: Headers::new(),
            body: None,
            mode: RequestMode::default(),
            integrity: None,
            cache_mode: CacheMode::default(),
        }
    }

    /// Create a GET request for `url`.
    pub fn get(url: Url) -> Self {
        Request::new(Method::Get, url)
    }

    /// Parse `url` and create a GET request.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUrl` if `url` is not absolute.
    pub fn parse_get(url: &str) -> Result<Self> {
        Ok(Request::get(Url::parse(url)?))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    /// Copy of this request pointing at a different URL.
    pub fn with_url(&self, url: Url) -> Self {
        Request {
            url,
            ..self.clone()
        }
    }

    /// The URL as a string, without its fragment.
    pub fn url_without_fragment(&self) -> String {
        strip_fragment(&self.url).to_string()
    }
}

/// Response classification, as reported by the fetch primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    #[default]
    Basic,
    Cors,
    /// Cross-origin response whose status and body are hidden (status 0).
    Opaque,
    OpaqueRedirect,
    /// Network error response.
    Error,
}

/// A response, either fetched or read back from cache storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Final URL after redirects, if known.
    pub url: Option<Url>,
    pub kind: ResponseKind,
    pub redirected: bool,
}

impl Response {
    /// Create a basic response with the given status and body.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Response {
            status,
            status_text: String::new(),
            headers: Headers::new(),
            body: body.into(),
            url: None,
            kind: ResponseKind::Basic,
            redirected: false,
        }
    }

    /// Create a `200 OK` response.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let mut response = Response::new(200, body);
        response.status_text = "OK".to_string();
        response
    }

    /// Create an opaque response (status 0, empty body).
    pub fn opaque() -> Self {
        let mut response = Response::new(0, Vec::new());
        response.kind = ResponseKind::Opaque;
        response
    }

    /// Create a network error response.
    pub fn error() -> Self {
        let mut response = Response::new(0, Vec::new());
        response.kind = ResponseKind::Error;
        response
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Status in the 200-299 range.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.kind, ResponseKind::Opaque | ResponseKind::OpaqueRedirect)
    }
}

/// Copy of `url` with its fragment removed.
pub fn strip_fragment(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

/// Copy of `url` without the search parameters `drop` selects.
///
/// The query is removed entirely when no parameter is left.
pub fn strip_search_params<F>(url: &Url, drop: F) -> Url
where
    F: Fn(&str) -> bool,
{
    let mut url = url.clone();
    if url.query().is_none() {
        return url;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !drop(name))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url
}
