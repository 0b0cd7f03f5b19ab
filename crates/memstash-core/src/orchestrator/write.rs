//! Write path: encode, protect, store, record.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec;
use crate::config::EntryOptions;
use crate::error::{ensure_live, StashError, StashResult};
use crate::secure_stash::SecureStash;
use crate::stash::Stash;

use super::pipeline::protect_impl;
use super::read::try_get_impl;
use super::Inner;

async fn write_blob(
    inner: &Inner,
    key: &str,
    payload: Vec<u8>,
    compress: bool,
    encrypt: bool,
    options: &EntryOptions,
    cancel: &CancellationToken,
) -> StashResult<()> {
    ensure_live(cancel, "set")?;
    let blob = protect_impl(inner, payload, compress, encrypt, cancel).await?;
    let size = blob.len();
    inner.store.set(key, blob, options, cancel).await?;

    inner.eviction.record_access(key);
    if let Some(at) = options.absolute_expiration {
        inner.eviction.set_expiration(key, at);
    }
    debug!(key, compress, encrypt, size, "stored value");
    Ok(())
}

pub(crate) async fn set_impl<T: Serialize + ?Sized>(
    inner: &Inner,
    key: &str,
    value: &T,
    options: Option<&EntryOptions>,
    cancel: &CancellationToken,
) -> StashResult<()> {
    let options = options.cloned().unwrap_or_default().resolve(&inner.config);
    let compress = inner.config.enable_compression || options.compress;
    let encrypt = inner.config.enable_encryption || options.encrypt;

    let result = async {
        let payload = codec::to_bytes(inner.serializer.as_ref(), value)?;
        write_blob(inner, key, payload, compress, encrypt, &options, cancel).await
    }
    .await;
    if let Err(e) = &result {
        warn!(key, error = %e, "cache write failed");
    }
    result
}

/// Stash writes take their transforms from the plan; `options` only
/// supplies lifetimes, and the stash's own expiration fills an unset one.
pub(crate) async fn set_stash_impl<T: Serialize>(
    inner: &Inner,
    stash: &Stash<T>,
    options: Option<&EntryOptions>,
    cancel: &CancellationToken,
) -> StashResult<()> {
    let mut options = options.cloned().unwrap_or_default();
    if options.absolute_expiration.is_none() {
        options.absolute_expiration = stash.expiration_date;
    }
    let options = options.resolve(&inner.config);
    let (compress, encrypt) = stash.plan.requests();

    let result = async {
        let value_bytes = codec::to_bytes(inner.serializer.as_ref(), &stash.value)?;
        let mut sealed = stash.borrowed();
        sealed.seal_metadata(&value_bytes);
        let payload = codec::to_bytes(inner.serializer.as_ref(), &sealed)?;
        write_blob(inner, &stash.key, payload, compress, encrypt, &options, cancel).await
    }
    .await;
    if let Err(e) = &result {
        warn!(key = %stash.key, error = %e, "stash write failed");
    }
    result
}

pub(crate) async fn set_secure_stash_impl<T>(
    inner: &Inner,
    mut stash: SecureStash<T>,
    options: Option<&EntryOptions>,
    cancel: &CancellationToken,
) -> StashResult<()>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut options = options.cloned().unwrap_or_default();
    if options.absolute_expiration.is_none() {
        options.absolute_expiration = stash.expiration_date;
    }
    let options = options.resolve(&inner.config);
    let (compress, encrypt) = stash.plan.requests();

    let result = async {
        if !stash.is_encrypted() {
            stash.encrypt(&inner.keys, cancel).await?;
        }
        stash.seal_metadata();
        let payload = codec::to_bytes(inner.serializer.as_ref(), &stash)?;
        write_blob(inner, &stash.key, payload, compress, encrypt, &options, cancel).await
    }
    .await;
    if let Err(e) = &result {
        warn!(key = %stash.key, error = %e, "secure stash write failed");
    }
    result
}

pub(crate) async fn remove_impl(
    inner: &Inner,
    key: &str,
    cancel: &CancellationToken,
) -> StashResult<()> {
    ensure_live(cancel, "remove")?;
    if let Err(e) = inner.store.remove(key, cancel).await {
        warn!(key, error = %e, "cache remove failed");
        return Err(e);
    }
    inner.eviction.forget(key);
    debug!(key, "removed value");
    Ok(())
}

/// The flight runs under its own token: a caller whose token fires stops
/// waiting with `Cancelled`, while the computation keeps going for the rest.
/// An abandoned flight stays registered and the next caller resumes it.
pub(crate) async fn get_or_compute_impl<T, F, Fut>(
    inner: &Arc<Inner>,
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
    if let Some(hit) = try_get_impl::<T>(inner, key, cancel).await {
        return Ok(hit);
    }
    ensure_live(cancel, "get_or_compute")?;

    let owner = Arc::clone(inner);
    let flight_key = key.to_string();
    let options = options.cloned();

    let flight = inner.flights.get_or_add(key.to_string(), move || async move {
        let flight_cancel = CancellationToken::new();
        // a flight that finished after our miss may already have filled the key
        if let Some(tree) =
            try_get_impl::<serde_json::Value>(&owner, &flight_key, &flight_cancel).await
        {
            debug!(key = %flight_key, "filled while waiting for the flight");
            return Ok(tree);
        }
        let value = factory().await?;
        let tree = serde_json::to_value(&value)?;
        set_impl(&owner, &flight_key, &tree, options.as_ref(), &flight_cancel).await?;
        debug!(key = %flight_key, "computed and cached value");
        Ok(tree)
    });

    let tree = tokio::select! {
        outcome = flight => outcome?,
        _ = cancel.cancelled() => {
            debug!(key, "caller stopped waiting for flight");
            return Err(StashError::cancelled("get_or_compute"));
        }
    };

    Ok(serde_json::from_value(tree)?)
}
