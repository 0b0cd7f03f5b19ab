//! Stash whose value is sealed under its own derived key.
//!
//! While encrypted, `value` holds `T::default()` and the plaintext exists only
//! inside `encrypted_data`. Decrypting restores the value and clears both the
//! ciphertext and the key id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ensure_live, StashError, StashResult};
use crate::keys::KeyManagementService;
use crate::stash::{content_hash, StashPlan};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureStash<T> {
    pub key: String,
    pub value: T,
    stored_type: String,
    #[serde(default)]
    pub plan: StashPlan,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    encryption_key_id: Option<String>,
    #[serde(default, with = "base64_bytes")]
    encrypted_data: Option<Vec<u8>>,
}

impl<T> SecureStash<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
            stored_type: std::any::type_name::<T>().to_string(),
            plan: StashPlan::Default,
            expiration_date: None,
            size: 0,
            hash: None,
            encryption_key_id: None,
            encrypted_data: None,
        }
    }

    pub fn with_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_date = Some(at);
        self
    }

    /// Outer plan used when the sealed stash is written to the cache.
    pub fn with_plan(mut self, plan: StashPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn stored_type(&self) -> &str {
        &self.stored_type
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted_data.is_some()
    }

    /// Derived key the value is currently sealed under.
    pub fn encryption_key_id(&self) -> Option<&str> {
        self.encryption_key_id.as_deref()
    }

    pub fn encrypted_data(&self) -> Option<&[u8]> {
        self.encrypted_data.as_deref()
    }

    /// Record size and hash of the ciphertext.
    pub(crate) fn seal_metadata(&mut self) {
        if let Some(data) = &self.encrypted_data {
            self.size = data.len();
            self.hash = Some(content_hash(data));
        }
    }

    /// Whether the recorded hash matches the ciphertext. Stashes without a
    /// recorded hash pass.
    pub(crate) fn metadata_intact(&self) -> bool {
        match (self.hash.as_deref(), self.encrypted_data.as_deref()) {
            (None, _) => true,
            (Some(hash), Some(data)) => hash == content_hash(data),
            (Some(_), None) => false,
        }
    }
}

impl<T> SecureStash<T>
where
    T: Serialize + serde::de::DeserializeOwned + Default,
{
    /// Seal `value` under a freshly derived key and blank it out.
    pub async fn encrypt(
        &mut self,
        keys: &KeyManagementService,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        if self.is_encrypted() {
            return Err(StashError::InvalidState {
                message: format!("secure stash {} is already encrypted", self.key),
            });
        }

        let plaintext = serde_json::to_vec(&self.value)?;
        let derived = keys.generate_derived_key(None, cancel).await?;
        ensure_live(cancel, "secure_stash.encrypt")?;
        let sealed = keys.encrypt_for(&derived, &plaintext)?;

        self.encryption_key_id = Some(derived.id);
        self.encrypted_data = Some(sealed);
        self.value = T::default();
        Ok(())
    }

    /// Restore `value` from the sealed payload.
    pub async fn decrypt(
        &mut self,
        keys: &KeyManagementService,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        ensure_live(cancel, "secure_stash.decrypt")?;
        let (Some(key_id), Some(sealed)) =
            (self.encryption_key_id.as_deref(), self.encrypted_data.as_deref())
        else {
            return Err(StashError::InvalidState {
                message: format!("secure stash {} holds no encrypted data", self.key),
            });
        };

        let plaintext = keys.decrypt_with(key_id, sealed)?;
        self.value = serde_json::from_slice(&plaintext)?;
        self.encryption_key_id = None;
        self.encrypted_data = None;
        Ok(())
    }

    /// Re-seal under a new derived key.
    pub async fn rotate_key(
        &mut self,
        keys: &KeyManagementService,
        cancel: &CancellationToken,
    ) -> StashResult<()> {
        let previous = self.encryption_key_id.clone();
        self.decrypt(keys, cancel).await?;
        self.encrypt(keys, cancel).await?;
        debug!(
            key = %self.key,
            previous_key_id = previous.as_deref().unwrap_or_default(),
            key_id = self.encryption_key_id().unwrap_or_default(),
            "rotated secure stash key"
        );
        Ok(())
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => ser.serialize_some(&BASE64.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(de)?
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
