//! Error types for the cache orchestrator and its collaborators.

use std::sync::Arc;

/// Cache errors.
#[derive(Debug, thiserror::Error)]
pub enum StashError {
    /// Backend store unreachable, timed out or rejected the request.
    #[error("backend error ({provider}): {message}")]
    Backend {
        provider: String,
        message: String,
        retryable: bool,
    },

    /// Encryption, decryption, signing or key encoding failed.
    #[error("cryptographic failure: {reason}")]
    Crypto { reason: String },

    /// Payload malformed, truncated or of the wrong type.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Compression or decompression failed.
    #[error("compression error: {message}")]
    Compression { message: String },

    /// Referenced master or derived key does not exist.
    #[error("{kind} key not found: {key_id}")]
    KeyNotFound { kind: KeyKind, key_id: String },

    /// The single-flight leader failed; every waiter sees the same error.
    #[error("single-flight leader for {key} failed: {source}")]
    DedupLeader {
        key: String,
        #[source]
        source: Arc<StashError>,
    },

    /// Secret store unreachable or returned unusable material.
    #[error("secret store error: {message}")]
    SecretStore { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Operation not valid for the current state of a value.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// The caller's cancellation token fired.
    #[error("operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Circuit breaker is open; the backend is not being called.
    #[error("circuit open for {provider}")]
    CircuitOpen { provider: String },
}

/// Which half of the key hierarchy a lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Master,
    Derived,
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Derived => f.write_str("derived"),
        }
    }
}

impl StashError {
    /// Whether a retry against the same backend might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                retryable: true,
                ..
            }
        )
    }

    /// Whether this is a cryptographic failure, looking through single-flight wrapping.
    pub fn is_crypto(&self) -> bool {
        match self {
            Self::Crypto { .. } => true,
            Self::DedupLeader { source, .. } => source.is_crypto(),
            _ => false,
        }
    }

    pub(crate) fn backend(provider: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            provider: provider.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    pub(crate) fn crypto(reason: impl Into<String>) -> Self {
        Self::Crypto {
            reason: reason.into(),
        }
    }

    pub(crate) fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub(crate) fn cancelled(operation: &str) -> Self {
        Self::Cancelled {
            operation: operation.to_string(),
        }
    }
}

impl From<serde_json::Error> for StashError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for StashError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StashError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend {
            provider: "io".to_string(),
            message: err.to_string(),
            retryable: matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
        }
    }
}

impl From<rsa::Error> for StashError {
    fn from(err: rsa::Error) -> Self {
        Self::Crypto {
            reason: err.to_string(),
        }
    }
}

/// Result type for cache operations.
pub type StashResult<T> = Result<T, StashError>;

/// Fail fast when the caller's token has already fired.
pub fn ensure_live(
    cancel: &tokio_util::sync::CancellationToken,
    operation: &str,
) -> StashResult<()> {
    if cancel.is_cancelled() {
        return Err(StashError::cancelled(operation));
    }
    Ok(())
}
