//! Envelope encryption for state payloads.
//!
//! Every version is sealed under a fresh 256-bit data key. The data key is
//! wrapped by a named master key from a [`KeyProvider`] and stored inside the
//! envelope, so rotating the active master key never breaks old reads as long
//! as retired keys stay in the provider.
//!
//! ## Envelope Layout
//!
//! ```text
//! magic "SWE1" | u16 BE wrapped-key length | wrapped key | 12-byte nonce | ciphertext+tag
//! ```
//!
//! The object key `{state_key}/{version_id}` is bound as associated data, so an
//! envelope copied to another key or version fails to open.

mod keyring;

pub use keyring::LocalKeyring;

use std::sync::Arc;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

const ENVELOPE_MAGIC: &[u8; 4] = b"SWE1";
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = ENVELOPE_MAGIC.len() + 2;

/// Errors that can occur during encryption and decryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unknown encryption key: {0}")]
    UnknownKey(String),

    #[error("Invalid key material for {key_id}: {reason}")]
    InvalidKeyMaterial { key_id: String, reason: String },

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed under key {key_id}")]
    Decrypt { key_id: String },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// A freshly generated data key, in plaintext and wrapped form.
pub struct DataKey {
    pub key_id: String,
    pub plaintext: [u8; 32],
    pub wrapped: Vec<u8>,
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("key_id", &self.key_id)
            .field("wrapped_len", &self.wrapped.len())
            .finish_non_exhaustive()
    }
}

/// Master key service: generates and unwraps data keys.
///
/// Implementations:
/// - `LocalKeyring`: named master keys held in process memory
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Key id new versions are sealed under.
    fn active_key_id(&self) -> &str;

    /// Generate a data key wrapped by the active master key.
    async fn generate_data_key(&self) -> Result<DataKey>;

    /// Unwrap a data key previously wrapped by `key_id`.
    async fn unwrap_data_key(&self, key_id: &str, wrapped: &[u8]) -> Result<[u8; 32]>;
}

/// Compute the hex SHA-256 content hash of stored bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Seals and opens payload envelopes using a [`KeyProvider`].
#[derive(Clone)]
pub struct EnvelopeCipher {
    provider: Arc<dyn KeyProvider>,
}

impl EnvelopeCipher {
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self { provider }
    }

    pub fn active_key_id(&self) -> &str {
        self.provider.active_key_id()
    }

    /// Encrypt `plaintext` bound to `aad`.
    ///
    /// Returns the id of the wrapping master key and the envelope bytes.
    pub async fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<(String, Vec<u8>)> {
        let data_key = self.provider.generate_data_key().await?;
        let wrapped_len = u16::try_from(data_key.wrapped.len())
            .map_err(|_| CryptoError::MalformedEnvelope("wrapped key too long".to_string()))?;

        let cipher = Aes256Gcm::new(key_ref(&data_key.plaintext));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        let mut envelope =
            Vec::with_capacity(HEADER_LEN + data_key.wrapped.len() + NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(ENVELOPE_MAGIC);
        envelope.extend_from_slice(&wrapped_len.to_be_bytes());
        envelope.extend_from_slice(&data_key.wrapped);
        envelope.extend_from_slice(nonce.as_slice());
        envelope.extend_from_slice(&ciphertext);

        Ok((data_key.key_id, envelope))
    }

    /// Decrypt an envelope sealed under `key_id` with the same `aad`.
    pub async fn open(&self, key_id: &str, aad: &[u8], envelope: &[u8]) -> Result<Vec<u8>> {
        let parts = EnvelopeParts::parse(envelope)?;
        let data_key = self.provider.unwrap_data_key(key_id, parts.wrapped).await?;

        let cipher = Aes256Gcm::new(key_ref(&data_key));
        cipher
            .decrypt(
                nonce_ref(parts.nonce),
                Payload {
                    msg: parts.ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Decrypt {
                key_id: key_id.to_string(),
            })
    }
}

#[allow(deprecated)]
pub(crate) fn key_ref(bytes: &[u8; 32]) -> &Key<Aes256Gcm> {
    Key::<Aes256Gcm>::from_slice(bytes)
}

#[allow(deprecated)]
pub(crate) fn nonce_ref(bytes: &[u8]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::NonceSize> {
    GenericArray::from_slice(bytes)
}

struct EnvelopeParts<'a> {
    wrapped: &'a [u8],
    nonce: &'a [u8],
    ciphertext: &'a [u8],
}

impl<'a> EnvelopeParts<'a> {
    fn parse(envelope: &'a [u8]) -> Result<Self> {
        if envelope.len() < HEADER_LEN || &envelope[..ENVELOPE_MAGIC.len()] != ENVELOPE_MAGIC {
            return Err(CryptoError::MalformedEnvelope("bad header".to_string()));
        }
        let wrapped_len =
            u16::from_be_bytes([envelope[ENVELOPE_MAGIC.len()], envelope[ENVELOPE_MAGIC.len() + 1]])
                as usize;
        let body = &envelope[HEADER_LEN..];
        if body.len() < wrapped_len + NONCE_LEN {
            return Err(CryptoError::MalformedEnvelope("truncated".to_string()));
        }
        let (wrapped, rest) = body.split_at(wrapped_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        Ok(Self {
            wrapped,
            nonce,
            ciphertext,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(Arc::new(LocalKeyring::generate("primary")))
    }

    #[test]
    fn test_content_hash_is_hex_sha256() {
        let hash = content_hash(b"state");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash(b"state"));
        assert_ne!(hash, content_hash(b"other"));
    }

    #[tokio::test]
    async fn test_seal_and_open() {
        let cipher = cipher();
        let (key_id, envelope) = cipher.seal(b"dev/db/1", b"terraform state").await.unwrap();
        assert_eq!(key_id, "primary");
        assert!(!envelope
            .windows(b"terraform state".len())
            .any(|w| w == b"terraform state"));

        let plaintext = cipher.open(&key_id, b"dev/db/1", &envelope).await.unwrap();
        assert_eq!(plaintext, b"terraform state");
    }

    #[tokio::test]
    async fn test_seal_empty_payload() {
        let cipher = cipher();
        let (key_id, envelope) = cipher.seal(b"aad", b"").await.unwrap();
        assert!(cipher.open(&key_id, b"aad", &envelope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_wrong_aad() {
        let cipher = cipher();
        let (key_id, envelope) = cipher.seal(b"dev/db/1", b"payload").await.unwrap();
        let result = cipher.open(&key_id, b"dev/db/2", &envelope).await;
        assert!(matches!(result, Err(CryptoError::Decrypt { .. })));
    }

    #[tokio::test]
    async fn test_open_rejects_tampered_ciphertext() {
        let cipher = cipher();
        let (key_id, mut envelope) = cipher.seal(b"aad", b"payload").await.unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        assert!(cipher.open(&key_id, b"aad", &envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_malformed_envelope() {
        let cipher = cipher();
        let result = cipher.open("primary", b"aad", b"nope").await;
        assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))));

        let result = cipher.open("primary", b"aad", b"SWE1\x00\xff").await;
        assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))));
    }

    #[tokio::test]
    async fn test_open_survives_key_rotation() {
        let mut keyring = LocalKeyring::generate("2025-q1");
        let old = EnvelopeCipher::new(Arc::new(keyring.clone()));
        let (old_key, envelope) = old.seal(b"aad", b"old payload").await.unwrap();

        keyring.rotate_generated("2025-q2");
        let rotated = EnvelopeCipher::new(Arc::new(keyring));
        assert_eq!(rotated.active_key_id(), "2025-q2");

        let plaintext = rotated.open(&old_key, b"aad", &envelope).await.unwrap();
        assert_eq!(plaintext, b"old payload");

        let (new_key, _) = rotated.seal(b"aad", b"new payload").await.unwrap();
        assert_eq!(new_key, "2025-q2");
    }
}
