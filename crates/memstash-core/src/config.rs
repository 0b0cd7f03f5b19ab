//! Orchestrator configuration and per-entry options.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StashError, StashResult};

/// Which eviction policy the orchestrator consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyKind {
    #[default]
    Default,
    Lru,
    Lfu,
    TimeBased,
    /// Caller supplies the policy through the builder.
    Custom,
}

impl FromStr for EvictionPolicyKind {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "" | "default" => Ok(Self::Default),
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "timebased" | "ttl" => Ok(Self::TimeBased),
            "custom" => Ok(Self::Custom),
            other => Err(StashError::Config {
                message: format!("unknown eviction policy: {}", other),
            }),
        }
    }
}

/// Retry and circuit-breaker settings for backend calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls, in seconds.
    #[serde(default = "default_break_secs")]
    pub break_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_break_secs() -> u64 {
    30
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            failure_threshold: default_failure_threshold(),
            break_secs: default_break_secs(),
        }
    }
}

/// Global orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemStashConfig {
    /// Backend store name resolved by the provider registry.
    #[serde(default = "default_provider")]
    pub distributed_cache_provider: String,

    /// Serializer name.
    #[serde(default = "default_serializer")]
    pub serializer: String,

    /// Compressor name.
    #[serde(default = "default_compressor")]
    pub compressor: String,

    /// Secret store name backing master keys.
    #[serde(default = "default_key_management")]
    pub key_management_provider: String,

    /// Compress every entry written through the non-stash API.
    #[serde(default = "default_true")]
    pub enable_compression: bool,

    /// Encrypt every entry written through the non-stash API.
    #[serde(default = "default_true")]
    pub enable_encryption: bool,

    /// Eviction policy consulted on every touch.
    #[serde(default)]
    pub global_eviction_policy: EvictionPolicyKind,

    /// Default absolute lifetime for entries, in seconds.
    #[serde(default)]
    pub default_absolute_expiration_secs: Option<u64>,

    /// Default sliding lifetime for entries, in seconds.
    #[serde(default)]
    pub default_sliding_expiration_secs: Option<u64>,

    /// RSA modulus size for generated keys.
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,

    /// Maximum entries held by the in-memory store.
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,

    /// Largest payload a compressor may inflate one blob to.
    #[serde(default = "default_max_decompressed_bytes")]
    pub max_decompressed_bytes: u64,

    /// Directory for the filesystem store.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// Directory for the file secret store.
    #[serde(default)]
    pub secrets_path: Option<PathBuf>,

    /// Backend retry settings. `None` disables the resilience wrapper.
    #[serde(default)]
    pub retry: Option<RetrySettings>,
}

fn default_provider() -> String {
    "memory".to_string()
}

fn default_serializer() -> String {
    "json".to_string()
}

fn default_compressor() -> String {
    "gzip".to_string()
}

fn default_key_management() -> String {
    "memory".to_string()
}

fn default_true() -> bool {
    true
}

fn default_key_bits() -> usize {
    2048
}

fn default_max_entries() -> u64 {
    100_000
}

fn default_max_decompressed_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for MemStashConfig {
    fn default() -> Self {
        Self {
            distributed_cache_provider: default_provider(),
            serializer: default_serializer(),
            compressor: default_compressor(),
            key_management_provider: default_key_management(),
            enable_compression: true,
            enable_encryption: true,
            global_eviction_policy: EvictionPolicyKind::Default,
            default_absolute_expiration_secs: None,
            default_sliding_expiration_secs: None,
            key_bits: default_key_bits(),
            max_entries: default_max_entries(),
            max_decompressed_bytes: default_max_decompressed_bytes(),
            store_path: None,
            secrets_path: None,
            retry: None,
        }
    }
}

impl MemStashConfig {
    /// Create config from environment variables, falling back to defaults.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `MEMSTASH_PROVIDER` | Backend store name |
    /// | `MEMSTASH_SERIALIZER` | Serializer name |
    /// | `MEMSTASH_COMPRESSOR` | Compressor name |
    /// | `MEMSTASH_KEY_MANAGEMENT` | Secret store name |
    /// | `MEMSTASH_COMPRESSION` | Enable compression (`1`/`true`) |
    /// | `MEMSTASH_ENCRYPTION` | Enable encryption (`1`/`true`) |
    /// | `MEMSTASH_EVICTION_POLICY` | `lru`, `lfu`, `time_based`, `custom` |
    /// | `MEMSTASH_DEFAULT_ABSOLUTE_EXPIRATION_SECS` | Default absolute TTL |
    /// | `MEMSTASH_DEFAULT_SLIDING_EXPIRATION_SECS` | Default sliding TTL |
    /// | `MEMSTASH_KEY_BITS` | RSA modulus size |
    /// | `MEMSTASH_MAX_DECOMPRESSED_BYTES` | Inflated size limit per blob |
    /// | `MEMSTASH_STORE_PATH` | Filesystem store directory |
    /// | `MEMSTASH_SECRETS_PATH` | File secret store directory |
    /// | `MEMSTASH_MAX_RETRIES` | Enables retries with this limit |
    pub fn from_env() -> StashResult<Self> {
        let defaults = Self::default();
        let retry = env_parse::<u32>("MEMSTASH_MAX_RETRIES").map(|max_retries| RetrySettings {
            max_retries,
            ..RetrySettings::default()
        });

        Ok(Self {
            distributed_cache_provider: std::env::var("MEMSTASH_PROVIDER")
                .unwrap_or(defaults.distributed_cache_provider),
            serializer: std::env::var("MEMSTASH_SERIALIZER").unwrap_or(defaults.serializer),
            compressor: std::env::var("MEMSTASH_COMPRESSOR").unwrap_or(defaults.compressor),
            key_management_provider: std::env::var("MEMSTASH_KEY_MANAGEMENT")
                .unwrap_or(defaults.key_management_provider),
            enable_compression: env_flag("MEMSTASH_COMPRESSION")
                .unwrap_or(defaults.enable_compression),
            enable_encryption: env_flag("MEMSTASH_ENCRYPTION")
                .unwrap_or(defaults.enable_encryption),
            global_eviction_policy: match std::env::var("MEMSTASH_EVICTION_POLICY") {
                Ok(v) => v.parse()?,
                Err(_) => defaults.global_eviction_policy,
            },
            default_absolute_expiration_secs: env_parse("MEMSTASH_DEFAULT_ABSOLUTE_EXPIRATION_SECS"),
            default_sliding_expiration_secs: env_parse("MEMSTASH_DEFAULT_SLIDING_EXPIRATION_SECS"),
            key_bits: env_parse("MEMSTASH_KEY_BITS").unwrap_or(defaults.key_bits),
            max_entries: defaults.max_entries,
            max_decompressed_bytes: env_parse("MEMSTASH_MAX_DECOMPRESSED_BYTES")
                .unwrap_or(defaults.max_decompressed_bytes),
            store_path: std::env::var("MEMSTASH_STORE_PATH").ok().map(PathBuf::from),
            secrets_path: std::env::var("MEMSTASH_SECRETS_PATH").ok().map(PathBuf::from),
            retry,
        })
    }

    /// Parse a YAML document; absent fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> StashResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| StashError::Config {
            message: format!("invalid memstash config: {}", e),
        })
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.distributed_cache_provider = provider.into();
        self
    }

    pub fn with_serializer(mut self, serializer: impl Into<String>) -> Self {
        self.serializer = serializer.into();
        self
    }

    pub fn with_compressor(mut self, compressor: impl Into<String>) -> Self {
        self.compressor = compressor.into();
        self
    }

    pub fn with_max_decompressed_bytes(mut self, limit: u64) -> Self {
        self.max_decompressed_bytes = limit;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.enable_encryption = enabled;
        self
    }

    pub fn with_eviction_policy(mut self, kind: EvictionPolicyKind) -> Self {
        self.global_eviction_policy = kind;
        self
    }

    pub fn with_key_bits(mut self, bits: usize) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_secrets_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.secrets_path = Some(path.into());
        self
    }

    pub fn with_default_absolute_expiration(mut self, ttl: Duration) -> Self {
        self.default_absolute_expiration_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_default_sliding_expiration(mut self, ttl: Duration) -> Self {
        self.default_sliding_expiration_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = Some(retry);
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// `now + ttl`, saturating at the far future.
pub(crate) fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-call entry options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryOptions {
    /// Point in time after which the entry is gone.
    pub absolute_expiration: Option<DateTime<Utc>>,

    /// Idle lifetime, renewed on every read.
    pub sliding_expiration: Option<Duration>,

    /// Compress even when global compression is off.
    pub compress: bool,

    /// Encrypt even when global encryption is off.
    pub encrypt: bool,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_absolute_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    pub fn with_absolute_expiration_in(self, ttl: Duration) -> Self {
        self.with_absolute_expiration(expiry_after(ttl))
    }

    pub fn with_sliding_expiration(mut self, ttl: Duration) -> Self {
        self.sliding_expiration = Some(ttl);
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Fill unset lifetimes from the configured defaults.
    pub(crate) fn resolve(&self, config: &MemStashConfig) -> Self {
        let mut resolved = self.clone();
        if resolved.absolute_expiration.is_none() {
            resolved.absolute_expiration = config
                .default_absolute_expiration_secs
                .map(|secs| expiry_after(Duration::from_secs(secs)));
        }
        if resolved.sliding_expiration.is_none() {
            resolved.sliding_expiration = config
                .default_sliding_expiration_secs
                .map(Duration::from_secs);
        }
        resolved
    }

    /// Remaining lifetime for stores that take a TTL, if any.
    pub fn time_to_live(&self) -> Option<Duration> {
        match (self.absolute_expiration, self.sliding_expiration) {
            (Some(at), _) => Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO)),
            (None, Some(sliding)) => Some(sliding),
            (None, None) => None,
        }
    }
}
