//! Backend store and secret store seams.
//!
//! The orchestrator only ever sees opaque byte blobs; what a backend does with
//! them (Redis, disk, memory) is its own business. Every call carries the
//! caller's cancellation token unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::EntryOptions;
use crate::error::StashResult;

mod memory;

pub use memory::{MemorySecretStore, MemoryStore};

/// Key/value backend holding protected blobs.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the blob stored under `key`, if any.
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StashResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous blob in one write.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> StashResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str, cancel: &CancellationToken) -> StashResult<()>;

    /// Whether a live blob exists under `key`.
    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool>;

    /// Provider identifier used in logs and errors.
    fn provider_name(&self) -> &str;
}

/// Vault holding persisted master-key material.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str, cancel: &CancellationToken)
        -> StashResult<Option<String>>;

    async fn set_secret(&self, name: &str, value: &str, cancel: &CancellationToken)
        -> StashResult<()>;
}

#[async_trait]
impl<S: CacheStore + ?Sized> CacheStore for Arc<S> {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StashResult<Option<Vec<u8>>> {
        (**self).get(key, cancel).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        (**self).set(key, value, options, cancel).await
    }

    async fn remove(&self, key: &str, cancel: &CancellationToken) -> StashResult<()> {
        (**self).remove(key, cancel).await
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool> {
        (**self).exists(key, cancel).await
    }

    fn provider_name(&self) -> &str {
        (**self).provider_name()
    }
}
