//! Cache orchestrator.
//!
//! `MemStash` is the facade; the read and write paths live in their own
//! modules and share the blob pipeline in `pipeline`.
//!
//! # Write path
//!
//! ```text
//! value -> serializer -> [compress] -> [encrypt under fresh derived key] -> frame -> store
//! ```
//!
//! The read path reverses exactly the transforms recorded in the frame.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{Compressor, GzipCompressor, JsonSerializer, Serializer};
use crate::config::{EntryOptions, MemStashConfig};
use crate::dedup::SingleFlight;
use crate::error::{ensure_live, StashResult};
use crate::eviction::{policy_for, EvictionPolicy};
use crate::keys::{CryptoProvider, KeyManagementService, RsaCryptoProvider};
use crate::secure_stash::SecureStash;
use crate::stash::Stash;
use crate::store::{CacheStore, MemorySecretStore, MemoryStore, SecretStore};

mod pipeline;
mod read;
mod write;


pub(crate) struct Inner {
    pub(crate) config: MemStashConfig,
    pub(crate) store: Arc<dyn CacheStore>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) compressor: Arc<dyn Compressor>,
    pub(crate) keys: Arc<KeyManagementService>,
    pub(crate) eviction: Arc<dyn EvictionPolicy>,
    pub(crate) flights: SingleFlight<String, serde_json::Value>,
}

/// Distributed cache client.
///
/// Cheap to clone; clones share collaborators, key registries, eviction
/// bookkeeping and in-flight computations.
#[derive(Clone)]
pub struct MemStash {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemStash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStash")
            .field("provider", &self.inner.store.provider_name())
            .field("serializer", &self.inner.serializer.name())
            .field("compressor", &self.inner.compressor.name())
            .field("eviction", &self.inner.eviction.name())
            .finish()
    }
}

impl MemStash {
    /// Client with in-memory collaborators built from `config`.
    pub fn new(config: MemStashConfig) -> StashResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: MemStashConfig) -> MemStashBuilder {
        MemStashBuilder::new(config)
    }

    pub fn config(&self) -> &MemStashConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &Arc<KeyManagementService> {
        &self.inner.keys
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    pub fn eviction_policy(&self) -> &Arc<dyn EvictionPolicy> {
        &self.inner.eviction
    }

    /// Fetch and decode `key`. `Ok(None)` when nothing is stored.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> StashResult<Option<T>> {
        read::get_impl(&self.inner, key, cancel).await
    }

    /// Like [`Self::get`], but every failure is logged and reported as a miss.
    pub async fn try_get<T: DeserializeOwned>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Option<T> {
        read::try_get_impl(&self.inner, key, cancel).await
    }

    pub async fn get_or_default<T: DeserializeOwned + Default>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> T {
        self.try_get(key, cancel).await.unwrap_or_default()
    }

    /// Serialize, protect and store `value`.
    ///
    /// Compression applies when enabled globally or requested by `options`;
    /// encryption likewise, always under a freshly derived key.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: Option<&EntryOptions>,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        write::set_impl(&self.inner, key, value, options, cancel).await
    }

    /// Remove `key` and forget its eviction bookkeeping.
    pub async fn remove(&self, key: &str, cancel: &CancellationToken) -> StashResult<()> {
        write::remove_impl(&self.inner, key, cancel).await
    }

    pub async fn exists(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool> {
        ensure_live(cancel, "exists")?;
        let found = self.inner.store.exists(key, cancel).await?;
        debug!(key, found, "exists");
        Ok(found)
    }

    pub async fn get_stash<T: DeserializeOwned + Serialize>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> StashResult<Option<Stash<T>>> {
        read::get_stash_impl(&self.inner, key, cancel).await
    }

    pub async fn try_get_stash<T: DeserializeOwned + Serialize>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Option<Stash<T>> {
        read::try_get_stash_impl(&self.inner, key, cancel).await
    }

    /// Store a stash under `stash.key`, transformed as its plan says.
    pub async fn set_stash<T: Serialize>(
        &self,
        stash: &Stash<T>,
        options: Option<&EntryOptions>,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        write::set_stash_impl(&self.inner, stash, options, cancel).await
    }

    /// Fetch a secure stash and decrypt its value.
    pub async fn get_secure_stash<T>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> StashResult<Option<SecureStash<T>>>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        read::get_secure_stash_impl(&self.inner, key, cancel).await
    }

    pub async fn try_get_secure_stash<T>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Option<SecureStash<T>>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        read::try_get_secure_stash_impl(&self.inner, key, cancel).await
    }

    /// Encrypt `stash` (unless it already is) and store it under `stash.key`.
    pub async fn set_secure_stash<T>(
        &self,
        stash: SecureStash<T>,
        options: Option<&EntryOptions>,
        cancel: &CancellationToken,
    ) -> StashResult<()>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        write::set_secure_stash_impl(&self.inner, stash, options, cancel).await
    }

    /// Restart the sliding lifetime of `key` without reading its value.
    /// Returns whether a live entry was found.
    pub async fn refresh(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool> {
        read::refresh_impl(&self.inner, key, cancel).await
    }

    /// Cache-aside fill. On a miss, `factory` runs once per key no matter how
    /// many callers ask concurrently; its value is stored and shared.
    ///
    /// `cancel` only bounds this caller's wait. The shared computation is not
    /// cancelled by any one caller, so the others still receive its value.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        options: Option<&EntryOptions>,
        cancel: &CancellationToken,
        factory: F,
    ) -> StashResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StashResult<T>> + Send + 'static,
    {
        write::get_or_compute_impl(&self.inner, key, options, cancel, factory).await
    }

    /// The eviction policy's current victim. Advisory; nothing is removed.
    pub fn eviction_candidate(&self) -> Option<String> {
        self.inner.eviction.select_victim()
    }
}

/// Assembles a [`MemStash`]; anything not supplied falls back to the
/// in-memory reference collaborators.
pub struct MemStashBuilder {
    config: MemStashConfig,
    store: Option<Arc<dyn CacheStore>>,
    serializer: Option<Arc<dyn Serializer>>,
    compressor: Option<Arc<dyn Compressor>>,
    secrets: Option<Arc<dyn SecretStore>>,
    crypto: Option<Arc<dyn CryptoProvider>>,
    keys: Option<Arc<KeyManagementService>>,
    eviction: Option<Arc<dyn EvictionPolicy>>,
}

impl MemStashBuilder {
    pub fn new(config: MemStashConfig) -> Self {
        Self {
            config,
            store: None,
            serializer: None,
            compressor: None,
            secrets: None,
            crypto: None,
            keys: None,
            eviction: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Share an existing key service; overrides `secret_store` and `crypto`.
    pub fn key_service(mut self, keys: Arc<KeyManagementService>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Required when the configured policy kind is `Custom`.
    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction = Some(policy);
        self
    }

    pub fn build(self) -> StashResult<MemStash> {
        let config = self.config;

        let eviction = match self.eviction {
            Some(policy) => policy,
            None => policy_for(config.global_eviction_policy)?,
        };
        debug!(
            configured = ?config.global_eviction_policy,
            policy = eviction.name(),
            "eviction policy selected"
        );

        let keys = match self.keys {
            Some(keys) => keys,
            None => {
                let crypto = self
                    .crypto
                    .unwrap_or_else(|| Arc::new(RsaCryptoProvider::with_bits(config.key_bits)));
                let secrets = self
                    .secrets
                    .unwrap_or_else(|| Arc::new(MemorySecretStore::new()));
                Arc::new(KeyManagementService::new(crypto, secrets))
            }
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(config.max_entries)));
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonSerializer));
        let compressor = self
            .compressor
            .unwrap_or_else(|| {
                Arc::new(GzipCompressor::new().with_max_output(config.max_decompressed_bytes))
            });

        Ok(MemStash {
            inner: Arc::new(Inner {
                config,
                store,
                serializer,
                compressor,
                keys,
                eviction,
                flights: SingleFlight::new(),
            }),
        })
    }
}
