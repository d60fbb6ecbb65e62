//! Postcard-based persistence format with versioned envelopes.
//!
//! The durable entry store writes its tables to disk in this format:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (varint) │POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "OFKS"              u32                postcard::to_allocvec(T)
//! ```
//!
//! A file with the wrong magic or an older schema version is rejected, and the
//! store starts over with empty tables instead of misreading old data.
//!
//! # Example
//!
//! ```rust
//! use offline_kit::serialization::{serialize_for_store, deserialize_from_store};
//!
//! # fn main() -> offline_kit::Result<()> {
//! let timestamps = vec![("runtime|https://example.com/".to_string(), 1_700_000_000_000i64)];
//! let bytes = serialize_for_store(&timestamps)?;
//! let back: Vec<(String, i64)> = deserialize_from_store(&bytes)?;
//! assert_eq!(back, timestamps);
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Magic header for store files: b"OFKS"
pub const STORE_MAGIC: [u8; 4] = *b"OFKS";

/// Current schema version of the persisted tables.
///
/// Increment when `QueueEntry`, `ExpirationRecord` or the table layout changes.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope around persisted data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreEnvelope<T> {
    /// Magic header: must be b"OFKS"
    pub magic: [u8; 4],
    /// Schema version: must match CURRENT_SCHEMA_VERSION
    pub version: u32,
    pub payload: T,
}

impl<T> StoreEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            magic: STORE_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// Serialize a value inside an envelope.
///
/// # Errors
///
/// Returns `Error::SerializationError` if Postcard serialization fails.
pub fn serialize_for_store<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let envelope = StoreEnvelope::new(value);
    postcard::to_allocvec(&envelope).map_err(|e| {
        error!("Store serialization failed: {}", e);
        Error::SerializationError(e.to_string())
    })
}

/// Deserialize a value and validate its envelope.
///
/// # Errors
///
/// - `Error::DeserializationError`: corrupted Postcard payload
/// - `Error::InvalidCacheEntry`: invalid magic header
/// - `Error::VersionMismatch`: schema version mismatch
pub fn deserialize_from_store<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    let envelope: StoreEnvelope<T> = postcard::from_bytes(bytes).map_err(|e| {
        error!("Store deserialization failed: {}", e);
        Error::DeserializationError(e.to_string())
    })?;

    if envelope.magic != STORE_MAGIC {
        warn!(
            "Invalid store file: expected magic {:?}, got {:?}",
            STORE_MAGIC, envelope.magic
        );
        return Err(Error::InvalidCacheEntry(format!(
            "Invalid magic: expected {:?}, got {:?}",
            STORE_MAGIC, envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        warn!(
            "Store version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION, envelope.version
        );
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}
