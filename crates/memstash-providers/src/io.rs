//! Shared file plumbing for the disk-backed providers.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memstash_core::{ensure_live, StashError, StashResult};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Suffix unique within this machine for the life of the process.
pub(crate) fn unique_suffix() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Resolve a directory under the user's cache (or home) directory.
pub(crate) fn user_dir(base: Option<PathBuf>, leaf: &str) -> StashResult<PathBuf> {
    let base = base.ok_or_else(|| StashError::Config {
        message: format!("could not determine a directory for {}", leaf),
    })?;
    Ok(base.join("memstash").join(leaf))
}

/// Write `bytes` to a sibling temp file, sync it, then rename over `path`.
///
/// Readers see either the old content or the new content, never a mix. On
/// unix, `mode` sets the permission bits of the new file.
pub(crate) async fn write_atomic(
    path: &Path,
    bytes: &[u8],
    mode: Option<u32>,
) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, unique_suffix()));

    let written = async {
        write_synced(&temp_path, bytes, mode).await?;
        fs::rename(&temp_path, path).await
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

async fn write_synced(path: &Path, bytes: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        if let Some(mode) = mode {
            options.mode(mode);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Remove a file, ignoring a file that is already gone.
pub(crate) async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub(crate) fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
    )
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: &str,
    fut: impl Future<Output = StashResult<T>>,
) -> StashResult<T> {
    ensure_live(cancel, operation)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StashError::Cancelled {
            operation: operation.to_string(),
        }),
        result = fut => result,
    }
}
