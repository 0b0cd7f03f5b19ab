//! Distributed cache client with per-entry encryption.
//!
//! Values are serialized, optionally compressed and optionally encrypted under
//! a freshly derived keypair before they reach a pluggable backend store. The
//! crate provides:
//!
//! - The `MemStash` orchestrator with typed, stash and secure-stash operations
//! - A two-level key hierarchy (master keys in a secret store, derived keys per value)
//! - Advisory eviction policies (LRU, LFU, time-based)
//! - Single-flight deduplication of concurrent cache fills
//! - Retry and circuit breaking around backends, and startup warm-up
//! - A raw byte-array surface (`ByteCache`) with refresh
//!
//! # Quick Start
//!
//! ```no_run
//! use memstash_core::{MemStash, MemStashConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = MemStash::new(MemStashConfig::from_env()?)?;
//! let cancel = CancellationToken::new();
//!
//! cache.set("user:42", &"Ada", None, &cancel).await?;
//! let name: Option<String> = cache.get("user:42", &cancel).await?;
//! assert_eq!(name.as_deref(), Some("Ada"));
//! # Ok(())
//! # }
//! ```
//!
//! Backends other than memory, and name-based provider selection, live in
//! `memstash-providers`.

pub mod adapter;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod eviction;
mod frame;
pub mod keys;
mod orchestrator;
pub mod resilience;
pub mod secure_stash;
pub mod stash;
pub mod store;
pub mod warmup;

pub use adapter::{ByteCache, ByteEntryOptions};
pub use codec::{Compressor, GzipCompressor, JsonSerializer, NoopCompressor, Serializer, YamlSerializer};
pub use config::{EntryOptions, EvictionPolicyKind, MemStashConfig, RetrySettings};
pub use dedup::SingleFlight;
pub use error::{ensure_live, KeyKind, StashError, StashResult};
pub use eviction::{policy_for, EvictionPolicy, LfuPolicy, LruPolicy, TimeBasedPolicy};
pub use keys::{
    CryptoProvider, DerivedKey, DerivedKeyState, KeyManagementService, KeyPair, MasterKey,
    RsaCryptoProvider,
};
pub use orchestrator::{MemStash, MemStashBuilder};
pub use resilience::{CircuitBreaker, ResilientStore, RetryPolicy};
pub use secure_stash::SecureStash;
pub use stash::{content_hash, Stash, StashPlan};
pub use store::{CacheStore, MemorySecretStore, MemoryStore, SecretStore};
pub use warmup::{CacheSeeder, CacheWarmer, WarmupReport};

// Async-trait re-export so downstream stores and seeders need no extra dependency.
pub use async_trait::async_trait;
