//! Secret store keeping one file per secret.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use memstash_core::{SecretStore, StashError, StashResult};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::io::{cancellable, user_dir, write_atomic};

/// Owner read/write only.
const SECRET_MODE: u32 = 0o600;

/// Default secrets directory: `<data dir>/memstash/secrets`.
pub fn default_secrets_dir() -> StashResult<PathBuf> {
    user_dir(dirs::data_dir().or_else(dirs::home_dir), "secrets")
}

/// File-per-secret vault for master-key material.
///
/// Files are written atomically and, on unix, readable by the owner only.
/// Names are restricted to `[A-Za-z0-9._-]` and may not start with a dot.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn with_default_dir() -> StashResult<Self> {
        Ok(Self::new(default_secrets_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn secret_path(&self, name: &str) -> StashResult<PathBuf> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(secret_error(format!("invalid secret name: {:?}", name)));
        }
        Ok(self.root.join(format!("{}.secret", name)))
    }

    async fn read(&self, name: &str) -> StashResult<Option<String>> {
        let path = self.secret_path(name)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(secret_error(format!("reading {}: {}", name, e))),
        }
    }

    async fn write(&self, name: &str, value: &str) -> StashResult<()> {
        let path = self.secret_path(name)?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| secret_error(format!("creating {}: {}", self.root.display(), e)))?;
        write_atomic(&path, value.as_bytes(), Some(SECRET_MODE))
            .await
            .map_err(|e| secret_error(format!("writing {}: {}", name, e)))?;
        debug!(name, "secret stored");
        Ok(())
    }
}

fn secret_error(message: String) -> StashError {
    StashError::SecretStore { message }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> StashResult<Option<String>> {
        cancellable(cancel, "secrets.get", self.read(name)).await
    }

    async fn set_secret(
        &self,
        name: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        cancellable(cancel, "secrets.set", self.write(name, value)).await
    }
}
