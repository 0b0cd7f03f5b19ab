//! Asymmetric crypto primitives.
//!
//! `RsaCryptoProvider` seals payloads hybrid-style: a random AES-256-GCM
//! content key encrypts the data and RSA-OAEP(SHA-256) wraps the content key.
//!
//! ```text
//! wrapped_len: u16 BE | wrapped content key | nonce (12) | ciphertext + tag
//! ```

use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::sha2::{Digest, Sha256};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

use crate::error::{StashError, StashResult};

const CONTENT_KEY_LEN: usize = 32;

/// DER-encoded keypair: SPKI public key, PKCS#8 private key.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key_len", &self.public_key.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Asymmetric encrypt/decrypt and sign/verify.
///
/// Decrypting with a private key that does not match the sealing public key
/// must fail with [`StashError::Crypto`]; it never yields bytes.
pub trait CryptoProvider: Send + Sync {
    fn generate_key_pair(&self) -> StashResult<KeyPair>;

    /// Rebuild the public half from persisted private material.
    fn public_key_from_private(&self, private_key: &[u8]) -> StashResult<Vec<u8>>;

    fn encrypt(&self, public_key: &[u8], data: &[u8]) -> StashResult<Vec<u8>>;

    fn decrypt(&self, private_key: &[u8], data: &[u8]) -> StashResult<Vec<u8>>;

    fn sign(&self, private_key: &[u8], data: &[u8]) -> StashResult<Vec<u8>>;

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> StashResult<bool>;

    fn algorithm(&self) -> &str;
}

/// RSA provider; 2048-bit keys unless configured otherwise.
#[derive(Debug, Clone, Copy)]
pub struct RsaCryptoProvider {
    bits: usize,
}

impl RsaCryptoProvider {
    pub fn new() -> Self {
        Self { bits: 2048 }
    }

    /// Modulus size in bits. OAEP(SHA-256) needs room for the 32-byte
    /// content key, so anything under 768 bits is rejected at keygen.
    pub fn with_bits(bits: usize) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }
}

impl Default for RsaCryptoProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn load_private(der: &[u8]) -> StashResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(der)
        .map_err(|e| StashError::crypto(format!("invalid private key: {}", e)))
}

fn load_public(der: &[u8]) -> StashResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|e| StashError::crypto(format!("invalid public key: {}", e)))
}

fn encode_public(key: &RsaPublicKey) -> StashResult<Vec<u8>> {
    key.to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| StashError::crypto(format!("failed to encode public key: {}", e)))
}

fn content_cipher(content_key: &[u8]) -> StashResult<LessSafeKey> {
    UnboundKey::new(&AES_256_GCM, content_key)
        .map(LessSafeKey::new)
        .map_err(|_| StashError::crypto("invalid content key"))
}

impl CryptoProvider for RsaCryptoProvider {
    fn generate_key_pair(&self) -> StashResult<KeyPair> {
        if self.bits < 768 {
            return Err(StashError::Config {
                message: format!("RSA modulus of {} bits is too small", self.bits),
            });
        }
        let private = RsaPrivateKey::new(&mut OsRng, self.bits)?;
        let public = RsaPublicKey::from(&private);

        let private_key = private
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| StashError::crypto(format!("failed to encode private key: {}", e)))?;

        Ok(KeyPair {
            public_key: encode_public(&public)?,
            private_key,
        })
    }

    fn public_key_from_private(&self, private_key: &[u8]) -> StashResult<Vec<u8>> {
        encode_public(&RsaPublicKey::from(&load_private(private_key)?))
    }

    fn encrypt(&self, public_key: &[u8], data: &[u8]) -> StashResult<Vec<u8>> {
        let public = load_public(public_key)?;

        let mut content_key = [0u8; CONTENT_KEY_LEN];
        OsRng.fill_bytes(&mut content_key);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let wrapped = public.encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key)?;
        let wrapped_len = u16::try_from(wrapped.len())
            .map_err(|_| StashError::crypto("wrapped content key too large"))?;

        let mut sealed = data.to_vec();
        content_cipher(&content_key)?
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
            .map_err(|_| StashError::crypto("payload encryption failed"))?;

        let mut out = Vec::with_capacity(2 + wrapped.len() + NONCE_LEN + sealed.len());
        out.extend_from_slice(&wrapped_len.to_be_bytes());
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, private_key: &[u8], data: &[u8]) -> StashResult<Vec<u8>> {
        let private = load_private(private_key)?;

        if data.len() < 2 {
            return Err(StashError::crypto("ciphertext truncated"));
        }
        let wrapped_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let rest = &data[2..];
        if rest.len() < wrapped_len + NONCE_LEN {
            return Err(StashError::crypto("ciphertext truncated"));
        }
        let (wrapped, rest) = rest.split_at(wrapped_len);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let content_key = private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| StashError::crypto(format!("content key unwrap failed: {}", e)))?;

        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| StashError::crypto("invalid nonce"))?;
        let mut buf = sealed.to_vec();
        let plain = content_cipher(&content_key)?
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| StashError::crypto("payload authentication failed"))?;
        Ok(plain.to_vec())
    }

    fn sign(&self, private_key: &[u8], data: &[u8]) -> StashResult<Vec<u8>> {
        let private = load_private(private_key)?;
        let digest = Sha256::digest(data);
        Ok(private.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> StashResult<bool> {
        let public = load_public(public_key)?;
        let digest = Sha256::digest(data);
        Ok(public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok())
    }

    fn algorithm(&self) -> &str {
        "RSA-OAEP-SHA256+AES-256-GCM"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> RsaCryptoProvider {
        RsaCryptoProvider::with_bits(1024)
    }

    #[test]
    fn test_seal_open_large_payload() {
        let crypto = provider();
        let pair = crypto.generate_key_pair().unwrap();
        // far larger than a single OAEP block
        let data = vec![7u8; 64 * 1024];

        let sealed = crypto.encrypt(&pair.public_key, &data).unwrap();
        assert_ne!(&sealed[sealed.len() - 32..], &data[..32]);
        assert_eq!(crypto.decrypt(&pair.private_key, &sealed).unwrap(), data);
    }

    #[test]
    fn test_wrong_key_is_crypto_failure() {
        let crypto = provider();
        let a = crypto.generate_key_pair().unwrap();
        let b = crypto.generate_key_pair().unwrap();

        let sealed = crypto.encrypt(&a.public_key, b"secret").unwrap();
        let err = crypto.decrypt(&b.private_key, &sealed).unwrap_err();
        assert!(err.is_crypto(), "unexpected error: {err}");
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let crypto = provider();
        let pair = crypto.generate_key_pair().unwrap();
        let mut sealed = crypto.encrypt(&pair.public_key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert!(crypto.decrypt(&pair.private_key, &sealed).unwrap_err().is_crypto());
        assert!(crypto.decrypt(&pair.private_key, &sealed[..1]).unwrap_err().is_crypto());
    }

    #[test]
    fn test_sign_verify() {
        let crypto = provider();
        let pair = crypto.generate_key_pair().unwrap();
        let other = crypto.generate_key_pair().unwrap();

        let sig = crypto.sign(&pair.private_key, b"payload").unwrap();
        assert!(crypto.verify(&pair.public_key, b"payload", &sig).unwrap());
        assert!(!crypto.verify(&pair.public_key, b"payload!", &sig).unwrap());
        assert!(!crypto.verify(&other.public_key, b"payload", &sig).unwrap());
    }

    #[test]
    fn test_public_key_rebuilt_from_private() {
        let crypto = provider();
        let pair = crypto.generate_key_pair().unwrap();
        assert_eq!(
            crypto.public_key_from_private(&pair.private_key).unwrap(),
            pair.public_key
        );
    }

    #[test]
    fn test_tiny_modulus_rejected() {
        let err = RsaCryptoProvider::with_bits(512).generate_key_pair().unwrap_err();
        assert!(matches!(err, StashError::Config { .. }));
    }
}
