//! End-to-end: caches assembled by name over the disk-backed providers.

use std::path::Path;
use std::sync::Arc;

use memstash_core::{
    EvictionPolicyKind, KeyKind, LfuPolicy, MemStash, MemStashConfig, Stash, StashError,
    StashPlan,
};
use memstash_providers::ProviderRegistry;
use serde::{Deserialize, Serialize};
use serial_test::serial;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    lines: Vec<String>,
}

fn order() -> Order {
    Order {
        id: 7,
        lines: vec!["espresso".into(), "croissant".into()],
    }
}

fn disk_config(dir: &Path) -> MemStashConfig {
    MemStashConfig::default()
        .with_provider("filesystem")
        .with_store_path(dir.join("store"))
        .with_secrets_path(dir.join("secrets"))
        .with_key_bits(1024)
}

fn disk_config_with_file_secrets(dir: &Path) -> MemStashConfig {
    let mut config = disk_config(dir);
    config.key_management_provider = "file".to_string();
    config
}

fn build(config: MemStashConfig) -> MemStash {
    ProviderRegistry::new().build(config).unwrap()
}

#[tokio::test]
async fn test_encrypted_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = build(disk_config_with_file_secrets(dir.path()));
    let cancel = CancellationToken::new();

    cache.set("order:7", &order(), None, &cancel).await.unwrap();
    let back: Option<Order> = cache.get("order:7", &cancel).await.unwrap();
    assert_eq!(back, Some(order()));
    assert_eq!(cache.store().provider_name(), "filesystem");

    // nothing on disk carries the plaintext
    for entry in walk(&dir.path().join("store")) {
        let bytes = std::fs::read(&entry).unwrap();
        assert!(
            !bytes.windows(8).any(|w| w == b"espresso"),
            "plaintext in {}",
            entry.display()
        );
    }
}

#[tokio::test]
async fn test_plain_entries_readable_by_another_instance() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(dir.path())
        .with_encryption(false)
        .with_compression(true);
    let cancel = CancellationToken::new();

    build(config.clone())
        .set("order:7", &order(), None, &cancel)
        .await
        .unwrap();

    let reader = build(config);
    let back: Option<Order> = reader.get("order:7", &cancel).await.unwrap();
    assert_eq!(back, Some(order()));
}

#[tokio::test]
async fn test_encrypted_entries_need_the_writers_derived_key() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config_with_file_secrets(dir.path());
    let cancel = CancellationToken::new();

    build(config.clone())
        .set("order:7", &order(), None, &cancel)
        .await
        .unwrap();

    // derived keys live in the writer's process only
    let err = build(config)
        .get::<Order>("order:7", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StashError::KeyNotFound {
            kind: KeyKind::Derived,
            ..
        }
    ));
}

#[tokio::test]
async fn test_master_keys_persist_through_file_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config_with_file_secrets(dir.path());
    let cancel = CancellationToken::new();

    let master = build(config.clone())
        .keys()
        .generate_master_key(&cancel)
        .await
        .unwrap();

    let reloaded = build(config)
        .keys()
        .get_master_key(&master.id, &cancel)
        .await
        .unwrap()
        .expect("master key reloaded from disk");
    assert_eq!(reloaded.public_key, master.public_key);
}

#[tokio::test]
async fn test_stash_with_expiration_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = build(disk_config(dir.path()));
    let cancel = CancellationToken::new();

    let stash = Stash::new("report", order())
        .with_plan(StashPlan::Compress)
        .with_expiration(chrono::Utc::now() - chrono::Duration::seconds(1));
    cache.set_stash(&stash, None, &cancel).await.unwrap();

    let back = cache.get_stash::<Order>("report", &cancel).await.unwrap();
    assert!(back.is_none(), "expired stash must read as a miss");
    assert!(!cache.exists("report", &cancel).await.unwrap());
}

#[tokio::test]
async fn test_yaml_without_compression() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(dir.path())
        .with_serializer("yaml")
        .with_encryption(false);
    let mut config = config;
    config.compressor = "none".to_string();
    let cancel = CancellationToken::new();

    let cache = build(config);
    cache.set("order:7", &order(), None, &cancel).await.unwrap();
    let back: Option<Order> = cache.get("order:7", &cancel).await.unwrap();
    assert_eq!(back, Some(order()));
}

#[tokio::test]
async fn test_custom_eviction_policy_through_builder() {
    let config = MemStashConfig::default().with_eviction_policy(EvictionPolicyKind::Custom);
    let registry = ProviderRegistry::new();

    assert!(matches!(
        registry.build(config.clone()),
        Err(StashError::Config { .. })
    ));

    let cache = registry
        .builder(config)
        .unwrap()
        .eviction_policy(Arc::new(LfuPolicy::new()))
        .build()
        .unwrap();
    assert_eq!(cache.eviction_policy().name(), "lfu");
}

#[tokio::test]
async fn test_unknown_secret_store_is_config_error() {
    let mut config = MemStashConfig::default();
    config.key_management_provider = "vault".to_string();
    let err = ProviderRegistry::new().build(config).err().unwrap();
    assert!(matches!(err, StashError::Config { .. }));
}

#[tokio::test]
#[serial]
async fn test_env_selects_filesystem_store() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("MEMSTASH_PROVIDER", "filesystem");
    std::env::set_var("MEMSTASH_STORE_PATH", dir.path());
    std::env::set_var("MEMSTASH_ENCRYPTION", "false");

    let config = MemStashConfig::from_env();

    std::env::remove_var("MEMSTASH_PROVIDER");
    std::env::remove_var("MEMSTASH_STORE_PATH");
    std::env::remove_var("MEMSTASH_ENCRYPTION");

    let cache = build(config.unwrap());
    let cancel = CancellationToken::new();
    cache.set("k", &"v", None, &cancel).await.unwrap();

    assert_eq!(cache.store().provider_name(), "filesystem");
    assert!(!walk(dir.path()).is_empty());
}

fn walk(root: &Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found
}
