//! Read path: fetch, unprotect, decode, verify.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{ensure_live, StashError, StashResult};
use crate::secure_stash::SecureStash;
use crate::stash::{content_hash, Stash};

use super::pipeline::unprotect_impl;
use super::Inner;

/// Raw payload for `key` with every recorded transform reversed.
async fn fetch(inner: &Inner, key: &str, cancel: &CancellationToken) -> StashResult<Option<Vec<u8>>> {
    ensure_live(cancel, "get")?;
    let Some(blob) = inner.store.get(key, cancel).await? else {
        debug!(key, "cache miss");
        return Ok(None);
    };

    inner.eviction.record_access(key);
    unprotect_impl(inner, &blob, cancel).map(Some)
}

async fn read_value<T: DeserializeOwned>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> StashResult<Option<T>> {
    match fetch(inner, key, cancel).await? {
        Some(bytes) => Ok(Some(codec::from_bytes(inner.serializer.as_ref(), &bytes)?)),
        None => Ok(None),
    }
}

pub(crate) async fn get_impl<T: DeserializeOwned>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> StashResult<Option<T>> {
    let result = read_value(inner, key, cancel).await;
    if let Err(e) = &result {
        warn!(key, error = %e, "cache read failed");
    }
    result
}

pub(crate) async fn try_get_impl<T: DeserializeOwned>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> Option<T> {
    match read_value(inner, key, cancel).await {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "cache read failed, treating as miss");
            None
        }
    }
}

/// Reads `key` without decoding it, which restarts a sliding lifetime.
pub(crate) async fn refresh_impl(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> StashResult<bool> {
    ensure_live(cancel, "refresh")?;
    let live = match inner.store.get(key, cancel).await {
        Ok(blob) => blob.is_some(),
        Err(e) => {
            warn!(key, error = %e, "cache refresh failed");
            return Err(e);
        }
    };
    if live {
        inner.eviction.record_access(key);
    }
    debug!(key, live, "refreshed entry");
    Ok(live)
}

/// `std::any::type_name` is not stable across compiler releases, so a
/// mismatch is reported but not fatal.
fn check_stored_type(key: &str, stored: &str, requested: &str) {
    if stored != requested {
        warn!(key, stored, requested, "stored type differs from requested type");
    }
}

async fn read_stash<T: DeserializeOwned + Serialize>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> StashResult<Option<Stash<T>>> {
    let Some(bytes) = fetch(inner, key, cancel).await? else {
        return Ok(None);
    };
    let stash: Stash<T> = codec::from_bytes(inner.serializer.as_ref(), &bytes)?;
    check_stored_type(key, stash.stored_type(), std::any::type_name::<T>());

    if let Some(expected) = stash.hash.as_deref() {
        let actual = content_hash(&codec::to_bytes(inner.serializer.as_ref(), &stash.value)?);
        if actual != expected {
            warn!(key, expected, actual = %actual, "stash integrity check failed");
            return Err(StashError::serialization(format!(
                "stash {} failed integrity check",
                key
            )));
        }
    }
    Ok(Some(stash))
}

pub(crate) async fn get_stash_impl<T: DeserializeOwned + Serialize>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> StashResult<Option<Stash<T>>> {
    let result = read_stash(inner, key, cancel).await;
    if let Err(e) = &result {
        warn!(key, error = %e, "stash read failed");
    }
    result
}

pub(crate) async fn try_get_stash_impl<T: DeserializeOwned + Serialize>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> Option<Stash<T>> {
    match read_stash(inner, key, cancel).await {
        Ok(stash) => stash,
        Err(e) => {
            warn!(key, error = %e, "stash read failed, treating as miss");
            None
        }
    }
}

async fn read_secure_stash<T>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> StashResult<Option<SecureStash<T>>>
where
    T: Serialize + DeserializeOwned + Default,
{
    let Some(bytes) = fetch(inner, key, cancel).await? else {
        return Ok(None);
    };
    let mut stash: SecureStash<T> = codec::from_bytes(inner.serializer.as_ref(), &bytes)?;
    check_stored_type(key, stash.stored_type(), std::any::type_name::<T>());

    if !stash.metadata_intact() {
        return Err(StashError::serialization(format!(
            "secure stash {} failed integrity check",
            key
        )));
    }
    if stash.is_encrypted() {
        stash.decrypt(&inner.keys, cancel).await?;
    }
    Ok(Some(stash))
}

pub(crate) async fn get_secure_stash_impl<T>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> StashResult<Option<SecureStash<T>>>
where
    T: Serialize + DeserializeOwned + Default,
{
    let result = read_secure_stash(inner, key, cancel).await;
    if let Err(e) = &result {
        warn!(key, error = %e, "secure stash read failed");
    }
    result
}

pub(crate) async fn try_get_secure_stash_impl<T>(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> Option<SecureStash<T>>
where
    T: Serialize + DeserializeOwned + Default,
{
    match read_secure_stash(inner, key, cancel).await {
        Ok(stash) => stash,
        Err(e) => {
            warn!(key, error = %e, "secure stash read failed, treating as miss");
            None
        }
    }
}
