//! Typed envelope around a cached value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which transforms the orchestrator applies when storing a [`Stash`].
///
/// Stash writes follow the plan alone; the global compression and encryption
/// switches only govern plain `set`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StashPlan {
    #[default]
    Default,
    SerializeOnly,
    Compress,
    Encrypt,
    CompressAndEncrypt,
}

impl StashPlan {
    /// `(compress, encrypt)` for this plan.
    pub fn requests(self) -> (bool, bool) {
        match self {
            Self::Default | Self::SerializeOnly => (false, false),
            Self::Compress => (true, false),
            Self::Encrypt => (false, true),
            Self::CompressAndEncrypt => (true, true),
        }
    }
}

/// A value plus the metadata the cache keeps about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stash<T> {
    pub key: String,
    pub value: T,
    stored_type: String,
    #[serde(default)]
    pub plan: StashPlan,
    /// `None` means the entry never expires.
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub hash: Option<String>,
}

impl<T> Stash<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
            stored_type: std::any::type_name::<T>().to_string(),
            plan: StashPlan::Default,
            expiration_date: None,
            size: 0,
            hash: None,
        }
    }

    pub fn with_plan(mut self, plan: StashPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_date = Some(at);
        self
    }

    /// Type name recorded when the stash was built.
    pub fn stored_type(&self) -> &str {
        &self.stored_type
    }

    pub fn is_expired(&self) -> bool {
        self.expiration_date.is_some_and(|at| at <= Utc::now())
    }

    /// Record size and content hash of the serialized value.
    pub(crate) fn seal_metadata(&mut self, serialized_value: &[u8]) {
        self.size = serialized_value.len();
        self.hash = Some(content_hash(serialized_value));
    }

    /// Same envelope over a borrowed value; serializes identically.
    pub(crate) fn borrowed(&self) -> Stash<&T> {
        Stash {
            key: self.key.clone(),
            value: &self.value,
            stored_type: self.stored_type.clone(),
            plan: self.plan,
            expiration_date: self.expiration_date,
            size: self.size,
            hash: self.hash.clone(),
        }
    }
}

/// Hex SHA-256 of a serialized value.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_records_type_and_never_expires() {
        let stash = Stash::new("user:1", 42u32);
        assert_eq!(stash.stored_type(), "u32");
        assert_eq!(stash.plan, StashPlan::Default);
        assert!(!stash.is_expired());
    }

    #[test]
    fn test_expiration_in_the_past() {
        let stash = Stash::new("k", "v".to_string())
            .with_expiration(Utc::now() - chrono::Duration::seconds(1));
        assert!(stash.is_expired());
    }

    #[test]
    fn test_plan_requests() {
        assert_eq!(StashPlan::SerializeOnly.requests(), (false, false));
        assert_eq!(StashPlan::Compress.requests(), (true, false));
        assert_eq!(StashPlan::Encrypt.requests(), (false, true));
        assert_eq!(StashPlan::CompressAndEncrypt.requests(), (true, true));
    }

    #[test]
    fn test_seal_metadata_hashes_bytes() {
        let mut stash = Stash::new("k", 1u8);
        stash.seal_metadata(b"abc");
        assert_eq!(stash.size, 3);
        assert_eq!(
            stash.hash.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }
}
