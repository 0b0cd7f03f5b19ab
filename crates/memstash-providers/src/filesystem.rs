//! Disk-backed cache store.
//!
//! Every entry is a blob file plus a `.meta` JSON sidecar, both named after the
//! SHA-256 of the cache key and sharded by its first two hex digits. The
//! sidecar names the blob it describes, so replacing an entry is: write a new
//! blob, then atomically swap the sidecar. The sidecar rename is the commit
//! point; the previous blob is removed afterwards.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memstash_core::{CacheStore, EntryOptions, StashError, StashResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::io::{cancellable, is_transient, remove_if_present, unique_suffix, user_dir, write_atomic};

const PROVIDER: &str = "filesystem";

/// Default store directory: `<cache dir>/memstash/store`.
pub fn default_store_dir() -> StashResult<PathBuf> {
    user_dir(dirs::cache_dir().or_else(dirs::home_dir), "store")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    blob: String,
    size: usize,
    stored_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sliding_ms: Option<u64>,
}

impl EntryMeta {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if matches!(self.expires_at, Some(at) if now >= at) {
            return true;
        }
        match self.sliding_ms {
            Some(window) => {
                let idle = now.signed_duration_since(self.last_access).num_milliseconds();
                idle >= i64::try_from(window).unwrap_or(i64::MAX)
            }
            None => false,
        }
    }
}

struct EntryPaths {
    dir: PathBuf,
    stem: String,
    meta: PathBuf,
}

impl EntryPaths {
    /// Blob path named by a sidecar; `None` if the name would leave the shard.
    fn blob(&self, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && name.starts_with(&self.stem);
        plain.then(|| self.dir.join(name))
    }
}

/// Cache store keeping entries as files under a root directory.
///
/// Absolute and sliding lifetimes are recorded in the sidecar; expired entries
/// are deleted when a read or existence check finds them.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at [`default_store_dir`].
    pub fn with_default_dir() -> StashResult<Self> {
        Ok(Self::new(default_store_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, key: &str) -> EntryPaths {
        let stem = hex::encode(Sha256::digest(key.as_bytes()));
        let dir = self.root.join(&stem[..2]);
        let meta = dir.join(format!("{}.meta", stem));
        EntryPaths { dir, stem, meta }
    }

    async fn read_meta(&self, paths: &EntryPaths) -> StashResult<Option<EntryMeta>> {
        let raw = match fs::read(&paths.meta).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read metadata", e)),
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(path = %paths.meta.display(), error = %e, "unreadable entry metadata, discarding");
                self.discard(paths, None).await;
                Ok(None)
            }
        }
    }

    /// Metadata of a live entry for `key`; expired entries are deleted.
    async fn live_meta(&self, key: &str, paths: &EntryPaths) -> StashResult<Option<EntryMeta>> {
        let Some(meta) = self.read_meta(paths).await? else {
            return Ok(None);
        };
        if meta.key != key {
            warn!(key, stored = %meta.key, "key hash collision, treating as miss");
            return Ok(None);
        }
        if meta.is_expired(Utc::now()) {
            debug!(key, "expired entry removed");
            self.discard(paths, Some(&meta)).await;
            return Ok(None);
        }
        Ok(Some(meta))
    }

    /// Best-effort delete of an entry's files.
    async fn discard(&self, paths: &EntryPaths, meta: Option<&EntryMeta>) {
        if let Err(e) = remove_if_present(&paths.meta).await {
            warn!(path = %paths.meta.display(), error = %e, "failed to remove entry metadata");
        }
        if let Some(blob) = meta.and_then(|m| paths.blob(&m.blob)) {
            if let Err(e) = remove_if_present(&blob).await {
                warn!(path = %blob.display(), error = %e, "failed to remove entry blob");
            }
        }
    }

    async fn load(&self, key: &str) -> StashResult<Option<Vec<u8>>> {
        let paths = self.paths(key);
        let Some(mut meta) = self.live_meta(key, &paths).await? else {
            return Ok(None);
        };
        let Some(blob) = paths.blob(&meta.blob) else {
            warn!(key, blob = %meta.blob, "metadata names a foreign blob, treating as miss");
            return Ok(None);
        };

        let data = match fs::read(&blob).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // replaced or removed concurrently
                debug!(key, "blob vanished under its metadata");
                return Ok(None);
            }
            Err(e) => return Err(io_error("read blob", e)),
        };

        if meta.sliding_ms.is_some() {
            meta.last_access = Utc::now();
            write_atomic(&paths.meta, &serde_json::to_vec(&meta)?, None)
                .await
                .map_err(|e| io_error("renew metadata", e))?;
        }
        Ok(Some(data))
    }

    async fn save(&self, key: &str, value: Vec<u8>, options: &EntryOptions) -> StashResult<()> {
        let paths = self.paths(key);
        fs::create_dir_all(&paths.dir)
            .await
            .map_err(|e| io_error("create directory", e))?;
        let previous = self.read_meta(&paths).await?;

        let now = Utc::now();
        let meta = EntryMeta {
            key: key.to_string(),
            blob: format!("{}-{}.blob", paths.stem, unique_suffix()),
            size: value.len(),
            stored_at: now,
            last_access: now,
            expires_at: options.absolute_expiration,
            sliding_ms: options
                .sliding_expiration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        };

        write_atomic(&paths.dir.join(&meta.blob), &value, None)
            .await
            .map_err(|e| io_error("write blob", e))?;
        write_atomic(&paths.meta, &serde_json::to_vec(&meta)?, None)
            .await
            .map_err(|e| io_error("write metadata", e))?;

        if let Some(old) = previous.and_then(|p| paths.blob(&p.blob)) {
            if let Err(e) = remove_if_present(&old).await {
                warn!(path = %old.display(), error = %e, "failed to remove replaced blob");
            }
        }
        debug!(key, size = meta.size, "entry written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StashResult<()> {
        let paths = self.paths(key);
        let meta = self.read_meta(&paths).await?;
        remove_if_present(&paths.meta)
            .await
            .map_err(|e| io_error("remove metadata", e))?;
        if let Some(blob) = meta.as_ref().and_then(|m| paths.blob(&m.blob)) {
            remove_if_present(&blob)
                .await
                .map_err(|e| io_error("remove blob", e))?;
        }
        Ok(())
    }

    async fn contains(&self, key: &str) -> StashResult<bool> {
        let paths = self.paths(key);
        let Some(meta) = self.live_meta(key, &paths).await? else {
            return Ok(false);
        };
        match paths.blob(&meta.blob) {
            Some(blob) => fs::try_exists(&blob)
                .await
                .map_err(|e| io_error("stat blob", e)),
            None => Ok(false),
        }
    }
}

fn io_error(operation: &str, err: std::io::Error) -> StashError {
    StashError::Backend {
        provider: PROVIDER.to_string(),
        message: format!("{}: {}", operation, err),
        retryable: is_transient(&err),
    }
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StashResult<Option<Vec<u8>>> {
        cancellable(cancel, "filesystem.get", self.load(key)).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        cancellable(cancel, "filesystem.set", self.save(key, value, options)).await
    }

    async fn remove(&self, key: &str, cancel: &CancellationToken) -> StashResult<()> {
        cancellable(cancel, "filesystem.remove", self.delete(key)).await
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StashResult<bool> {
        cancellable(cancel, "filesystem.exists", self.contains(key)).await
    }

    fn provider_name(&self) -> &str {
        PROVIDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store() -> (TempDir, FilesystemStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().join("cache"));
        (dir, store)
    }

    fn files_under(root: &Path) -> Vec<PathBuf> {
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

    #[tokio::test]
    async fn test_set_get_and_overwrite() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        let none = EntryOptions::default();

        store.set("user:1", b"v1".to_vec(), &none, &cancel).await.unwrap();
        store.set("user:1", b"v2".to_vec(), &none, &cancel).await.unwrap();

        let got = store.get("user:1", &cancel).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"v2"[..]));
        // one blob and one sidecar; the replaced blob is gone
        assert_eq!(files_under(store.root()).len(), 2);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        assert!(store.get("nope", &cancel).await.unwrap().is_none());
        assert!(!store.exists("nope", &cancel).await.unwrap());
        store.remove("nope", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_never_escape_root() {
        let (dir, store) = store();
        let cancel = CancellationToken::new();
        store
            .set("../../etc/passwd", b"x".to_vec(), &EntryOptions::default(), &cancel)
            .await
            .unwrap();

        for path in files_under(dir.path()) {
            assert!(path.starts_with(store.root()), "{} escaped", path.display());
        }
        assert!(store.exists("../../etc/passwd", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_absolute_expiry_deletes_files() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        let past = EntryOptions::default()
            .with_absolute_expiration(Utc::now() - chrono::Duration::seconds(1));

        store.set("gone", b"x".to_vec(), &past, &cancel).await.unwrap();
        assert!(store.get("gone", &cancel).await.unwrap().is_none());
        assert!(files_under(store.root()).is_empty());
    }

    #[tokio::test]
    async fn test_sliding_expiry_renews_on_read() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        let sliding = EntryOptions::default().with_sliding_expiration(Duration::from_millis(600));

        store.set("session", b"s".to_vec(), &sliding, &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(store.get("session", &cancel).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(350)).await;
        // 700ms since write, but only 350ms since the last read
        assert!(store.get("session", &cancel).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(!store.exists("session", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        store
            .set("persisted", b"p".to_vec(), &EntryOptions::default(), &cancel)
            .await
            .unwrap();

        let reopened = FilesystemStore::new(store.root());
        let got = reopened.get("persisted", &cancel).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"p"[..]));
    }

    #[tokio::test]
    async fn test_remove_deletes_both_files() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        store
            .set("k", b"v".to_vec(), &EntryOptions::default(), &cancel)
            .await
            .unwrap();
        store.remove("k", &cancel).await.unwrap();

        assert!(!store.exists("k", &cancel).await.unwrap());
        assert!(files_under(store.root()).is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_a_miss() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        store
            .set("k", b"v".to_vec(), &EntryOptions::default(), &cancel)
            .await
            .unwrap();

        let paths = store.paths("k");
        std::fs::write(&paths.meta, b"{not json").unwrap();
        assert!(store.get("k", &cancel).await.unwrap().is_none());
        assert!(!paths.meta.exists());
    }

    #[tokio::test]
    async fn test_metadata_pointing_outside_shard_is_a_miss() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        store
            .set("k", b"v".to_vec(), &EntryOptions::default(), &cancel)
            .await
            .unwrap();

        let paths = store.paths("k");
        let mut meta: EntryMeta =
            serde_json::from_slice(&std::fs::read(&paths.meta).unwrap()).unwrap();
        meta.blob = "../../outside.blob".to_string();
        std::fs::write(&paths.meta, serde_json::to_vec(&meta).unwrap()).unwrap();

        assert!(store.get("k", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_io() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store
            .set("k", b"v".to_vec(), &EntryOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::Cancelled { .. }));
        assert!(files_under(store.root()).is_empty());
    }

    #[test]
    fn test_sliding_window_boundaries() {
        let now = Utc::now();
        let meta = EntryMeta {
            key: "k".into(),
            blob: "b".into(),
            size: 0,
            stored_at: now,
            last_access: now - chrono::Duration::milliseconds(500),
            expires_at: None,
            sliding_ms: Some(1_000),
        };
        assert!(!meta.is_expired(now));
        assert!(meta.is_expired(now + chrono::Duration::milliseconds(500)));
        assert!(!EntryMeta {
            sliding_ms: None,
            ..meta
        }
        .is_expired(now + chrono::Duration::days(365)));
    }
}
