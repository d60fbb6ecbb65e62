//! Error types for the offline engine.

use std::fmt;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the offline engine.
///
/// Every variant carries enough context to be logged on its own. Variants are
/// grouped by where they surface:
///
/// - **Configuration** (fatal at construction): `DuplicateQueueName`,
///   `ExpirationConfigInvalid`, `CacheableConfigInvalid`, `ConfigError`
/// - **Precaching**: `ConflictingPrecacheEntry`, `ConflictingIntegrity`,
///   `BadPrecachingResponse`, `NonPrecachedUrl`, `MissingPrecacheEntry`
/// - **Per request** (recoverable by router catch handlers): `NoResponse`,
///   `FetchError`, `Timeout`, `IntegrityMismatch`
/// - **Storage**: `StorageError`, `QuotaExceeded`, the serialization variants
#[derive(Debug, Clone)]
pub enum Error {
    /// The same URL was registered for precaching with two different cache keys.
    ///
    /// Raised by `PrecacheController::add_entries` when a manifest lists one URL
    /// twice with different revisions.
    ConflictingPrecacheEntry {
        /// Cache key registered first
        first_entry: String,
        /// Cache key that conflicts with it
        second_entry: String,
    },

    /// The same cache key was registered with two different integrity values.
    ConflictingIntegrity {
        /// The conflicting URL
        url: String,
    },

    /// A precache fetch failed or returned an unusable response during install.
    ///
    /// **Recovery:** the whole install is aborted; fix the manifest or the
    /// server and install again.
    BadPrecachingResponse {
        /// URL being precached
        url: String,
        /// Status of the response, if one was received
        status: Option<u16>,
    },

    /// A handler was requested for a URL that is not in the precache manifest.
    NonPrecachedUrl(String),

    /// No usable response could be produced by a strategy.
    ///
    /// This is the terminal failure of every strategy. The underlying cause
    /// (typically a fetch error) is kept for logging.
    NoResponse {
        /// Request URL
        url: String,
        /// Description of the underlying failure, if any
        cause: Option<String>,
    },

    /// A precached response was missing and falling back to the network was disabled.
    MissingPrecacheEntry {
        /// Precache bucket name
        cache_name: String,
        /// Request URL
        url: String,
    },

    /// A retry queue with this name already exists in the registry.
    DuplicateQueueName(String),

    /// Replaying the queue stopped because a request failed.
    ///
    /// **Recovery:** the failed entry was put back at the head of the queue;
    /// the next sync trigger will retry it.
    ReplayFailed {
        /// Queue name
        queue: String,
    },

    /// Cache storage refused a write because its quota is exhausted.
    ///
    /// Triggers the registered quota callbacks; never surfaced by `cache_put`.
    QuotaExceeded {
        /// Bucket the write was aimed at
        bucket: String,
    },

    /// Expiration was configured with neither `max_entries` nor `max_age`.
    ExpirationConfigInvalid,

    /// Cacheability was configured with neither statuses nor headers.
    CacheableConfigInvalid,

    /// The fetch primitive failed (network error, connection refused, ...).
    FetchError(String),

    /// An operation exceeded its configured timeout.
    Timeout(String),

    /// A response body did not match the subresource integrity value of its request.
    IntegrityMismatch {
        /// Request URL
        url: String,
    },

    /// A URL could not be parsed or resolved.
    InvalidUrl(String),

    /// Cache storage or durable store error.
    StorageError(String),

    /// Serialization failed when writing the durable store.
    SerializationError(String),

    /// Deserialization failed when reading the durable store.
    DeserializationError(String),

    /// Invalid stored envelope: bad magic.
    InvalidCacheEntry(String),

    /// Schema version mismatch between code and persisted data.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from the persisted file)
        found: u32,
    },

    /// Invalid configuration.
    ConfigError(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Build a `NoResponse` error for `url`, keeping the cause for logging.
    pub fn no_response(url: impl Into<String>, cause: Option<&Error>) -> Self {
        Error::NoResponse {
            url: url.into(),
            cause: cause.map(|e| e.to_string()),
        }
    }

    /// Whether this error is a storage quota signal.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConflictingPrecacheEntry {
                first_entry,
                second_entry,
            } => write!(
                f,
                "Conflicting precache entries: {} and {} share a URL but differ in revision",
                first_entry, second_entry
            ),
            Error::ConflictingIntegrity { url } => {
                write!(f, "Conflicting integrity values for {}", url)
            }
            Error::BadPrecachingResponse { url, status } => match status {
                Some(status) => write!(
                    f,
                    "Bad precaching response for {}: status {}",
                    url, status
                ),
                None => write!(f, "Bad precaching response for {}: fetch failed", url),
            },
            Error::NonPrecachedUrl(url) => write!(f, "URL is not precached: {}", url),
            Error::NoResponse { url, cause } => match cause {
                Some(cause) => write!(f, "No response for {}: {}", url, cause),
                None => write!(f, "No response for {}", url),
            },
            Error::MissingPrecacheEntry { cache_name, url } => write!(
                f,
                "Missing precache entry for {} in {}",
                url, cache_name
            ),
            Error::DuplicateQueueName(name) => {
                write!(f, "Duplicate queue name: {}", name)
            }
            Error::ReplayFailed { queue } => {
                write!(f, "Replay failed for queue: {}", queue)
            }
            Error::QuotaExceeded { bucket } => {
                write!(f, "Storage quota exceeded writing to {}", bucket)
            }
            Error::ExpirationConfigInvalid => {
                write!(f, "Expiration requires max_entries or max_age")
            }
            Error::CacheableConfigInvalid => {
                write!(f, "Cacheable response requires statuses or headers")
            }
            Error::FetchError(msg) => write!(f, "Fetch error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::IntegrityMismatch { url } => {
                write!(f, "Integrity mismatch for {}", url)
            }
            Error::InvalidUrl(msg) => write!(f, "Invalid URL: {}", msg),
            Error::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => write!(
                f,
                "Store version mismatch: expected {}, found {}",
                expected, found
            ),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::StorageError(e.to_string())
        } else if e.is_syntax() || e.is_data() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StorageError(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidUrl(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::FetchError(e.to_string())
        }
    }
}
