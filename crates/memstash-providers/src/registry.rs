//! Name-based selection of stores, codecs and secret stores.

use std::collections::HashMap;
use std::sync::Arc;

use memstash_core::{
    CacheStore, Compressor, GzipCompressor, JsonSerializer, MemStash, MemStashBuilder,
    MemStashConfig, MemorySecretStore, MemoryStore, NoopCompressor, ResilientStore, SecretStore,
    Serializer, StashError, StashResult, YamlSerializer,
};
use tracing::info;

use crate::file_secrets::FileSecretStore;
use crate::filesystem::FilesystemStore;

pub type StoreFactory =
    Arc<dyn Fn(&MemStashConfig) -> StashResult<Arc<dyn CacheStore>> + Send + Sync>;
pub type SecretStoreFactory =
    Arc<dyn Fn(&MemStashConfig) -> StashResult<Arc<dyn SecretStore>> + Send + Sync>;
pub type SerializerFactory = Arc<dyn Fn() -> Arc<dyn Serializer> + Send + Sync>;
pub type CompressorFactory = Arc<dyn Fn(&MemStashConfig) -> Arc<dyn Compressor> + Send + Sync>;

/// Maps the provider names in [`MemStashConfig`] to constructors.
///
/// [`ProviderRegistry::new`] knows the stock providers:
///
/// | Kind | Names |
/// |------|-------|
/// | store | `memory`, `filesystem` |
/// | serializer | `json`, `yaml` |
/// | compressor | `gzip`, `none` |
/// | secret store | `memory`, `file` |
///
/// Names are matched case-insensitively. Registering an existing name
/// replaces it.
#[derive(Clone)]
pub struct ProviderRegistry {
    stores: HashMap<String, StoreFactory>,
    serializers: HashMap<String, SerializerFactory>,
    compressors: HashMap<String, CompressorFactory>,
    secret_stores: HashMap<String, SecretStoreFactory>,
}

impl ProviderRegistry {
    /// Registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            stores: HashMap::new(),
            serializers: HashMap::new(),
            compressors: HashMap::new(),
            secret_stores: HashMap::new(),
        }
    }

    /// Registry with the stock providers.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry
            .register_store("memory", |config| {
                Ok(Arc::new(MemoryStore::new(config.max_entries)) as Arc<dyn CacheStore>)
            })
            .register_store("filesystem", |config| {
                let store = match &config.store_path {
                    Some(path) => FilesystemStore::new(path),
                    None => FilesystemStore::with_default_dir()?,
                };
                Ok(Arc::new(store) as Arc<dyn CacheStore>)
            })
            .register_serializer("json", || Arc::new(JsonSerializer) as Arc<dyn Serializer>)
            .register_serializer("yaml", || Arc::new(YamlSerializer) as Arc<dyn Serializer>)
            .register_compressor("gzip", |config| {
                Arc::new(GzipCompressor::new().with_max_output(config.max_decompressed_bytes))
                    as Arc<dyn Compressor>
            })
            .register_compressor("none", |_| Arc::new(NoopCompressor) as Arc<dyn Compressor>)
            .register_secret_store("memory", |_| {
                Ok(Arc::new(MemorySecretStore::new()) as Arc<dyn SecretStore>)
            })
            .register_secret_store("file", |config| {
                let store = match &config.secrets_path {
                    Some(path) => FileSecretStore::new(path),
                    None => FileSecretStore::with_default_dir()?,
                };
                Ok(Arc::new(store) as Arc<dyn SecretStore>)
            });
        registry
    }

    pub fn register_store<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&MemStashConfig) -> StashResult<Arc<dyn CacheStore>> + Send + Sync + 'static,
    {
        self.stores.insert(normalize(name), Arc::new(factory));
        self
    }

    pub fn register_serializer<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Serializer> + Send + Sync + 'static,
    {
        self.serializers.insert(normalize(name), Arc::new(factory));
        self
    }

    pub fn register_compressor<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&MemStashConfig) -> Arc<dyn Compressor> + Send + Sync + 'static,
    {
        self.compressors.insert(normalize(name), Arc::new(factory));
        self
    }

    pub fn register_secret_store<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&MemStashConfig) -> StashResult<Arc<dyn SecretStore>> + Send + Sync + 'static,
    {
        self.secret_stores.insert(normalize(name), Arc::new(factory));
        self
    }

    /// The configured backend store, behind a [`ResilientStore`] when
    /// `config.retry` is set.
    pub fn store(&self, config: &MemStashConfig) -> StashResult<Arc<dyn CacheStore>> {
        let factory = lookup(&self.stores, "store", &config.distributed_cache_provider)?;
        let store = factory(config)?;
        Ok(match &config.retry {
            Some(retry) => Arc::new(ResilientStore::from_settings(store, retry)) as Arc<dyn CacheStore>,
            None => store,
        })
    }

    pub fn serializer(&self, name: &str) -> StashResult<Arc<dyn Serializer>> {
        let factory = lookup(&self.serializers, "serializer", name)?;
        Ok(factory())
    }

    /// The configured compressor, bounded by `config.max_decompressed_bytes`
    /// where the codec supports a bound.
    pub fn compressor(&self, config: &MemStashConfig) -> StashResult<Arc<dyn Compressor>> {
        let factory = lookup(&self.compressors, "compressor", &config.compressor)?;
        Ok(factory(config))
    }

    pub fn secret_store(&self, config: &MemStashConfig) -> StashResult<Arc<dyn SecretStore>> {
        let factory = lookup(
            &self.secret_stores,
            "key management",
            &config.key_management_provider,
        )?;
        factory(config)
    }

    /// Builder with every named provider resolved; add a custom eviction
    /// policy or crypto provider before building.
    pub fn builder(&self, config: MemStashConfig) -> StashResult<MemStashBuilder> {
        let store = self.store(&config)?;
        let serializer = self.serializer(&config.serializer)?;
        let compressor = self.compressor(&config)?;
        let secrets = self.secret_store(&config)?;

        info!(
            store = store.provider_name(),
            serializer = serializer.name(),
            compressor = compressor.name(),
            key_management = %config.key_management_provider,
            retry = config.retry.is_some(),
            "memstash providers resolved"
        );

        Ok(MemStash::builder(config)
            .store(store)
            .serializer(serializer)
            .compressor(compressor)
            .secret_store(secrets))
    }

    pub fn build(&self, config: MemStashConfig) -> StashResult<MemStash> {
        self.builder(config)?.build()
    }

    pub fn store_names(&self) -> Vec<&str> {
        sorted_names(&self.stores)
    }

    pub fn serializer_names(&self) -> Vec<&str> {
        sorted_names(&self.serializers)
    }

    pub fn compressor_names(&self) -> Vec<&str> {
        sorted_names(&self.compressors)
    }

    pub fn secret_store_names(&self) -> Vec<&str> {
        sorted_names(&self.secret_stores)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("stores", &self.store_names())
            .field("serializers", &self.serializer_names())
            .field("compressors", &self.compressor_names())
            .field("secret_stores", &self.secret_store_names())
            .finish()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn sorted_names<V>(map: &HashMap<String, V>) -> Vec<&str> {
    let mut names: Vec<&str> = map.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}

fn lookup<'a, V>(map: &'a HashMap<String, V>, kind: &str, name: &str) -> StashResult<&'a V> {
    map.get(&normalize(name)).ok_or_else(|| StashError::Config {
        message: format!(
            "unknown {} provider '{}' (known: {})",
            kind,
            name,
            sorted_names(map).join(", ")
        ),
    })
}
