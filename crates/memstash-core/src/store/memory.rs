//! In-process reference collaborators.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use moka::sync::Cache;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::EntryOptions;
use crate::error::{ensure_live, StashResult};

use super::{CacheStore, SecretStore};

struct MemoryEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    sliding: Option<Duration>,
    last_touch: Mutex<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        if matches!(self.expires_at, Some(at) if now >= at) {
            return true;
        }
        match self.sliding {
            Some(window) => {
                let last = *self.last_touch.lock().unwrap_or_else(|e| e.into_inner());
                now.duration_since(last) >= window
            }
            None => false,
        }
    }

    fn touch(&self, now: Instant) {
        if self.sliding.is_some() {
            *self.last_touch.lock().unwrap_or_else(|e| e.into_inner()) = now;
        }
    }
}

/// Bounded in-memory backend (moka) honouring absolute and sliding lifetimes.
#[derive(Clone)]
pub struct MemoryStore {
    cache: Cache<String, Arc<MemoryEntry>>,
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` blobs.
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: Cache::new(max_entries),
        }
    }

    fn live_entry(&self, key: &str) -> Option<Arc<MemoryEntry>> {
        let entry = self.cache.get(key)?;
        let now = Instant::now();
        if entry.is_expired(now) {
            self.cache.invalidate(key);
            debug!(key, "expired entry dropped");
            return None;
        }
        Some(entry)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StashResult<Option<Vec<u8>>> {
        ensure_live(cancel, "memory.get")?;
        Ok(self.live_entry(key).map(|entry| {
            entry.touch(Instant::now());
            entry.data.clone()
        }))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        ensure_live(cancel, "memory.set")?;
        let now = Instant::now();
        let expires_at = options
            .absolute_expiration
            .and_then(|at| now.checked_add((at - Utc::now()).to_std().unwrap_or(Duration::ZERO)));

        self.cache.insert(
            key.to_string(),
            Arc::new(MemoryEntry {
                data: value,
                expires_at,
                sliding: options.sliding_expiration,
                last_touch: Mutex::new(now),
            }),
        );
        Ok(())
    }

    async fn remove(&self, key: &str, cancel: &CancellationToken) -> StashResult<()> {
        ensure_live(cancel, "memory.remove")?;
        self.cache.invalidate(key);
        Ok(())
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool> {
        ensure_live(cancel, "memory.exists")?;
        Ok(self.live_entry(key).is_some())
    }

    fn provider_name(&self) -> &str {
        "memory"
    }
}

/// In-memory secret store, for tests and single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct MemorySecretStore {
    secrets: Arc<DashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> StashResult<Option<String>> {
        ensure_live(cancel, "secrets.get")?;
        Ok(self.secrets.get(name).map(|v| v.value().clone()))
    }

    async fn set_secret(
        &self,
        name: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        ensure_live(cancel, "secrets.set")?;
        self.secrets.insert(name.to_string(), value.to_string());
        Ok(())
    }
}
