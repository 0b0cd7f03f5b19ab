//! Raw byte-array cache surface over [`MemStash`].
//!
//! Values go through the same protection pipeline as typed entries; the
//! bytes travel as a base64 string so every serializer can carry them.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{expiry_after, EntryOptions};
use crate::error::StashResult;
use crate::orchestrator::MemStash;

/// Lifetimes for a byte entry.
///
/// When both absolute forms are set, the relative one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteEntryOptions {
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub absolute_expiration_relative_to_now: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
}

impl ByteEntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_absolute_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    pub fn with_absolute_expiration_relative_to_now(mut self, ttl: Duration) -> Self {
        self.absolute_expiration_relative_to_now = Some(ttl);
        self
    }

    pub fn with_sliding_expiration(mut self, ttl: Duration) -> Self {
        self.sliding_expiration = Some(ttl);
        self
    }

    fn to_entry_options(&self) -> EntryOptions {
        EntryOptions {
            absolute_expiration: self
                .absolute_expiration_relative_to_now
                .map(expiry_after)
                .or(self.absolute_expiration),
            sliding_expiration: self.sliding_expiration,
            ..EntryOptions::default()
        }
    }
}

/// Get/set/refresh/remove of opaque byte values, for callers that manage
/// their own encoding.
#[derive(Debug, Clone)]
pub struct ByteCache {
    cache: MemStash,
}

impl ByteCache {
    pub fn new(cache: MemStash) -> Self {
        Self { cache }
    }

    pub fn inner(&self) -> &MemStash {
        &self.cache
    }

    /// Bytes under `key`; any failure reads as a miss.
    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Option<Vec<u8>> {
        let encoded: String = self.cache.try_get(key, cancel).await?;
        match BASE64.decode(encoded) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(key, error = %e, "byte entry is not valid base64, treating as miss");
                None
            }
        }
    }

    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &ByteEntryOptions,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        let encoded = BASE64.encode(value);
        self.cache
            .set(key, &encoded, Some(&options.to_entry_options()), cancel)
            .await
    }

    /// Restart the sliding lifetime of `key`. Returns whether it was live.
    pub async fn refresh(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool> {
        self.cache.refresh(key, cancel).await
    }

    pub async fn remove(&self, key: &str, cancel: &CancellationToken) -> StashResult<()> {
        self.cache.remove(key, cancel).await
    }
}

impl From<MemStash> for ByteCache {
    fn from(cache: MemStash) -> Self {
        Self::new(cache)
    }
}
