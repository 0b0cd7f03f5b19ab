//! Disk-backed providers and name-based provider selection for memstash.
//!
//! - [`FilesystemStore`]: cache entries as files with a JSON lifetime sidecar
//! - [`FileSecretStore`]: master-key material as owner-only files
//! - [`ProviderRegistry`]: resolves the provider names in
//!   [`MemStashConfig`](memstash_core::MemStashConfig) into a ready
//!   [`MemStash`](memstash_core::MemStash)
//!
//! ```no_run
//! use memstash_core::MemStashConfig;
//! use memstash_providers::ProviderRegistry;
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = MemStashConfig::default()
//!     .with_provider("filesystem")
//!     .with_store_path("/var/cache/myapp");
//! let cache = ProviderRegistry::new().build(config)?;
//! # let _ = cache;
//! # Ok(())
//! # }
//! ```

pub mod file_secrets;
pub mod filesystem;
mod io;
pub mod registry;

pub use file_secrets::{default_secrets_dir, FileSecretStore};
pub use filesystem::{default_store_dir, FilesystemStore};
pub use registry::{
    CompressorFactory, ProviderRegistry, SecretStoreFactory, SerializerFactory, StoreFactory,
};
