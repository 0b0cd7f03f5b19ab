//! Two-level key hierarchy: master keys persisted in a secret store, derived
//! keys minted per encrypted value and kept in memory.
//!
//! Rotation retires a master key and relabels its derived keys onto the
//! replacement. Derived key material is untouched, so every blob encrypted
//! before the rotation still decrypts afterwards.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ensure_live, KeyKind, StashError, StashResult};
use crate::store::SecretStore;

mod crypto;

pub use crypto::{CryptoProvider, KeyPair, RsaCryptoProvider};

/// Root key; its private half lives in the secret store.
#[derive(Clone)]
pub struct MasterKey {
    pub id: String,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("id", &self.id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedKeyState {
    Created,
    /// Parent master was rotated; material unchanged.
    Relabeled,
}

/// Per-value keypair, parented to a master key.
#[derive(Clone)]
pub struct DerivedKey {
    pub id: String,
    pub master_key_id: String,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
    pub state: DerivedKeyState,
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("id", &self.id)
            .field("master_key_id", &self.master_key_id)
            .field("state", &self.state)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Secret-store entry name for a master key.
pub fn master_secret_name(master_key_id: &str) -> String {
    format!("master-key-{}", master_key_id)
}

/// Key service. Safe to share behind an `Arc`; every map is concurrent.
pub struct KeyManagementService {
    crypto: Arc<dyn CryptoProvider>,
    secrets: Arc<dyn SecretStore>,
    master_keys: DashMap<String, MasterKey>,
    derived_keys: DashMap<String, DerivedKey>,
    /// Lazily created on first use; held across creation so concurrent first
    /// callers agree on a single master.
    default_master: Mutex<Option<String>>,
}

impl std::fmt::Debug for KeyManagementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManagementService")
            .field("algorithm", &self.crypto.algorithm())
            .field("master_keys", &self.master_keys.len())
            .field("derived_keys", &self.derived_keys.len())
            .finish()
    }
}

impl KeyManagementService {
    pub fn new(crypto: Arc<dyn CryptoProvider>, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            crypto,
            secrets,
            master_keys: DashMap::new(),
            derived_keys: DashMap::new(),
            default_master: Mutex::new(None),
        }
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    /// Create a master key and persist its private half.
    ///
    /// The first master created by this service becomes the default parent
    /// for derived keys requested without an explicit master.
    pub async fn generate_master_key(&self, cancel: &CancellationToken) -> StashResult<MasterKey> {
        let master = self.create_master_key(cancel).await?;
        let mut default = self.default_master.lock().await;
        if default.is_none() {
            *default = Some(master.id.clone());
        }
        Ok(master)
    }

    /// Mint a derived keypair under `master_key_id`, or under the default
    /// master (created on first use) when none is given.
    pub async fn generate_derived_key(
        &self,
        master_key_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> StashResult<DerivedKey> {
        ensure_live(cancel, "keys.generate_derived")?;

        let master_id = match master_key_id.filter(|id| !id.is_empty()) {
            Some(id) => self.resolve_master(id, cancel).await?.id,
            None => self.default_master_id(cancel).await?,
        };

        let pair = self.key_pair(cancel).await?;
        let derived = DerivedKey {
            id: uuid::Uuid::new_v4().to_string(),
            master_key_id: master_id,
            public_key: pair.public_key,
            private_key: pair.private_key,
            state: DerivedKeyState::Created,
        };
        self.derived_keys
            .insert(derived.id.clone(), derived.clone());

        debug!(
            derived_key_id = %derived.id,
            master_key_id = %derived.master_key_id,
            "generated derived key"
        );
        Ok(derived)
    }

    /// Master key by id, falling back to the secret store when it is not in
    /// memory. `None` when neither knows it.
    pub async fn get_master_key(
        &self,
        master_key_id: &str,
        cancel: &CancellationToken,
    ) -> StashResult<Option<MasterKey>> {
        match self.resolve_master(master_key_id, cancel).await {
            Ok(master) => Ok(Some(master)),
            Err(StashError::KeyNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Derived key by id. Derived keys are never persisted, so there is no
    /// fallback.
    pub fn get_derived_key(&self, derived_key_id: &str) -> Option<DerivedKey> {
        self.derived_keys
            .get(derived_key_id)
            .map(|entry| entry.value().clone())
    }

    /// Replace `old_master_key_id` with a fresh master and reparent its
    /// derived keys. Returns the new master.
    pub async fn rotate_master_key(
        &self,
        old_master_key_id: &str,
        cancel: &CancellationToken,
    ) -> StashResult<MasterKey> {
        ensure_live(cancel, "keys.rotate_master")?;
        if !self.master_keys.contains_key(old_master_key_id) {
            return Err(StashError::KeyNotFound {
                kind: KeyKind::Master,
                key_id: old_master_key_id.to_string(),
            });
        }

        let replacement = self.create_master_key(cancel).await?;
        self.master_keys.remove(old_master_key_id);

        let mut relabeled = 0usize;
        for mut entry in self.derived_keys.iter_mut() {
            if entry.master_key_id == old_master_key_id {
                entry.master_key_id = replacement.id.clone();
                entry.state = DerivedKeyState::Relabeled;
                relabeled += 1;
            }
        }

        {
            let mut default = self.default_master.lock().await;
            if default.as_deref() == Some(old_master_key_id) {
                *default = Some(replacement.id.clone());
            }
        }

        info!(
            old_master_key_id,
            new_master_key_id = %replacement.id,
            relabeled,
            "rotated master key"
        );
        Ok(replacement)
    }

    /// Seal `data` for `derived_key`.
    pub fn encrypt_for(&self, derived_key: &DerivedKey, data: &[u8]) -> StashResult<Vec<u8>> {
        self.crypto.encrypt(&derived_key.public_key, data)
    }

    /// Open `data` sealed for the derived key `derived_key_id`.
    pub fn decrypt_with(&self, derived_key_id: &str, data: &[u8]) -> StashResult<Vec<u8>> {
        let derived = self.require_derived(derived_key_id)?;
        self.crypto.decrypt(&derived.private_key, data)
    }

    pub fn sign(&self, derived_key_id: &str, data: &[u8]) -> StashResult<Vec<u8>> {
        let derived = self.require_derived(derived_key_id)?;
        self.crypto.sign(&derived.private_key, data)
    }

    pub fn verify(&self, derived_key_id: &str, data: &[u8], signature: &[u8]) -> StashResult<bool> {
        let derived = self.require_derived(derived_key_id)?;
        self.crypto.verify(&derived.public_key, data, signature)
    }

    /// Derived keys currently parented to `master_key_id`.
    pub fn derived_keys_for(&self, master_key_id: &str) -> Vec<DerivedKey> {
        self.derived_keys
            .iter()
            .filter(|entry| entry.master_key_id == master_key_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn master_key_count(&self) -> usize {
        self.master_keys.len()
    }

    pub fn derived_key_count(&self) -> usize {
        self.derived_keys.len()
    }

    fn require_derived(&self, derived_key_id: &str) -> StashResult<DerivedKey> {
        self.get_derived_key(derived_key_id)
            .ok_or_else(|| StashError::KeyNotFound {
                kind: KeyKind::Derived,
                key_id: derived_key_id.to_string(),
            })
    }

    async fn default_master_id(&self, cancel: &CancellationToken) -> StashResult<String> {
        let mut default = self.default_master.lock().await;
        if let Some(id) = default.as_ref() {
            if self.master_keys.contains_key(id) {
                return Ok(id.clone());
            }
        }
        let master = self.create_master_key(cancel).await?;
        *default = Some(master.id.clone());
        Ok(master.id)
    }

    async fn create_master_key(&self, cancel: &CancellationToken) -> StashResult<MasterKey> {
        ensure_live(cancel, "keys.generate_master")?;
        let pair = self.key_pair(cancel).await?;
        let master = MasterKey {
            id: uuid::Uuid::new_v4().to_string(),
            public_key: pair.public_key,
            private_key: pair.private_key,
        };

        // persisted before it becomes visible
        self.secrets
            .set_secret(
                &master_secret_name(&master.id),
                &BASE64.encode(&master.private_key),
                cancel,
            )
            .await?;
        self.master_keys.insert(master.id.clone(), master.clone());

        info!(master_key_id = %master.id, "generated master key");
        Ok(master)
    }

    async fn resolve_master(
        &self,
        master_key_id: &str,
        cancel: &CancellationToken,
    ) -> StashResult<MasterKey> {
        if let Some(master) = self.master_keys.get(master_key_id) {
            return Ok(master.value().clone());
        }

        let not_found = || StashError::KeyNotFound {
            kind: KeyKind::Master,
            key_id: master_key_id.to_string(),
        };
        let encoded = self
            .secrets
            .get_secret(&master_secret_name(master_key_id), cancel)
            .await?
            .ok_or_else(not_found)?;
        let private_key = BASE64
            .decode(encoded.trim())
            .map_err(|e| StashError::SecretStore {
                message: format!("master key {} is not valid base64: {}", master_key_id, e),
            })?;
        let public_key = self.crypto.public_key_from_private(&private_key)?;

        let master = MasterKey {
            id: master_key_id.to_string(),
            public_key,
            private_key,
        };
        self.master_keys
            .insert(master.id.clone(), master.clone());
        debug!(master_key_id, "loaded master key from secret store");
        Ok(master)
    }

    /// Keygen is CPU bound; run it off the async workers and stop waiting if
    /// the caller cancels.
    async fn key_pair(&self, cancel: &CancellationToken) -> StashResult<KeyPair> {
        let crypto = Arc::clone(&self.crypto);
        let task = tokio::task::spawn_blocking(move || crypto.generate_key_pair());
        tokio::select! {
            _ = cancel.cancelled() => Err(StashError::cancelled("keys.generate_key_pair")),
            joined = task => joined.map_err(|e| StashError::crypto(format!("keygen task failed: {}", e)))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySecretStore;

    fn service() -> (KeyManagementService, Arc<MemorySecretStore>) {
        let secrets = Arc::new(MemorySecretStore::new());
        let kms = KeyManagementService::new(
            Arc::new(RsaCryptoProvider::with_bits(1024)),
            secrets.clone(),
        );
        (kms, secrets)
    }

    #[tokio::test]
    async fn test_master_key_persisted_under_prefixed_name() {
        let (kms, secrets) = service();
        let cancel = CancellationToken::new();
        let master = kms.generate_master_key(&cancel).await.unwrap();

        let stored = secrets
            .get_secret(&master_secret_name(&master.id), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(BASE64.decode(stored).unwrap(), master.private_key);
    }

    #[tokio::test]
    async fn test_default_master_created_once() {
        let (kms, _) = service();
        let cancel = CancellationToken::new();

        let a = kms.generate_derived_key(None, &cancel).await.unwrap();
        let b = kms.generate_derived_key(Some(""), &cancel).await.unwrap();
        assert_eq!(a.master_key_id, b.master_key_id);
        assert_eq!(kms.master_key_count(), 1);
        assert_eq!(a.state, DerivedKeyState::Created);
    }

    #[tokio::test]
    async fn test_unknown_master_is_key_not_found() {
        let (kms, _) = service();
        let cancel = CancellationToken::new();

        let err = kms
            .generate_derived_key(Some("missing"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StashError::KeyNotFound {
                kind: KeyKind::Master,
                ..
            }
        ));
        assert!(kms.get_master_key("missing", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_master_reloaded_from_secret_store() {
        let secrets = Arc::new(MemorySecretStore::new());
        let crypto: Arc<dyn CryptoProvider> = Arc::new(RsaCryptoProvider::with_bits(1024));
        let cancel = CancellationToken::new();

        let first = KeyManagementService::new(crypto.clone(), secrets.clone());
        let master = first.generate_master_key(&cancel).await.unwrap();

        // fresh process, same vault
        let second = KeyManagementService::new(crypto, secrets);
        let loaded = second
            .get_master_key(&master.id, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.private_key, master.private_key);
        assert_eq!(loaded.public_key, master.public_key);
    }

    #[tokio::test]
    async fn test_rotation_relabels_and_keeps_material() {
        let (kms, _) = service();
        let cancel = CancellationToken::new();
        let m1 = kms.generate_master_key(&cancel).await.unwrap();
        let d1 = kms.generate_derived_key(Some(&m1.id), &cancel).await.unwrap();
        let sealed = kms.encrypt_for(&d1, b"before rotation").unwrap();

        let m2 = kms.rotate_master_key(&m1.id, &cancel).await.unwrap();
        assert_ne!(m1.id, m2.id);

        let after = kms.get_derived_key(&d1.id).unwrap();
        assert_eq!(after.master_key_id, m2.id);
        assert_eq!(after.state, DerivedKeyState::Relabeled);
        assert_eq!(after.private_key, d1.private_key);
        assert!(kms.derived_keys_for(&m1.id).is_empty());
        assert_eq!(kms.decrypt_with(&d1.id, &sealed).unwrap(), b"before rotation");

        // new derived keys without an explicit master land on the replacement
        let d2 = kms.generate_derived_key(None, &cancel).await.unwrap();
        assert_eq!(d2.master_key_id, m2.id);
    }

    #[tokio::test]
    async fn test_rotate_unknown_master_fails() {
        let (kms, _) = service();
        let err = kms
            .rotate_master_key("nope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn test_sign_verify_with_derived_key() {
        let (kms, _) = service();
        let cancel = CancellationToken::new();
        let d = kms.generate_derived_key(None, &cancel).await.unwrap();

        let sig = kms.sign(&d.id, b"payload").unwrap();
        assert!(kms.verify(&d.id, b"payload", &sig).unwrap());
        assert!(!kms.verify(&d.id, b"tampered", &sig).unwrap());
        assert!(matches!(
            kms.sign("unknown", b"payload").unwrap_err(),
            StashError::KeyNotFound {
                kind: KeyKind::Derived,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_keygen() {
        let (kms, _) = service();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = kms.generate_master_key(&cancel).await.unwrap_err();
        assert!(matches!(err, StashError::Cancelled { .. }));
        assert_eq!(kms.master_key_count(), 0);
    }
}
