//! Blob protection shared by the read and write paths.

use tokio_util::sync::CancellationToken;

use crate::error::{ensure_live, StashResult};
use crate::frame;

use super::Inner;

/// Compress and/or encrypt a serialized payload, then frame it.
pub(crate) async fn protect_impl(
    inner: &Inner,
    payload: Vec<u8>,
    compress: bool,
    encrypt: bool,
    cancel: &CancellationToken,
) -> StashResult<Vec<u8>> {
    let body = if compress {
        inner.compressor.compress(&payload)?
    } else {
        payload
    };

    if !encrypt {
        return frame::encode(compress, None, &body);
    }

    let derived = inner.keys.generate_derived_key(None, cancel).await?;
    ensure_live(cancel, "encrypt")?;
    let sealed = inner.keys.encrypt_for(&derived, &body)?;
    frame::encode(compress, Some(&derived.id), &sealed)
}

/// Undo whatever the frame says the writer applied.
pub(crate) fn unprotect_impl(
    inner: &Inner,
    blob: &[u8],
    cancel: &CancellationToken,
) -> StashResult<Vec<u8>> {
    let frame = frame::decode(blob)?;

    let body = match frame.key_id.as_deref() {
        Some(key_id) => {
            ensure_live(cancel, "decrypt")?;
            inner.keys.decrypt_with(key_id, frame.body)?
        }
        None => frame.body.to_vec(),
    };

    if frame.compressed {
        inner.compressor.decompress(&body)
    } else {
        Ok(body)
    }
}
