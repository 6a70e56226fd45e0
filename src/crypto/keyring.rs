//! In-process master keyring.
//!
//! Holds named 256-bit master keys. Data keys are wrapped as
//! `nonce | AES-256-GCM(master, data_key)` with the key id as associated data.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::Aes256Gcm;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{key_ref, nonce_ref, CryptoError, DataKey, KeyProvider, Result, NONCE_LEN};

/// Master keys held in memory, one of which is active for new writes.
#[derive(Clone)]
pub struct LocalKeyring {
    keys: HashMap<String, [u8; 32]>,
    active: String,
}

impl LocalKeyring {
    /// Keyring with a single randomly generated master key.
    pub fn generate(key_id: impl Into<String>) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), random_key());
        Self {
            keys,
            active: key_id,
        }
    }

    /// Build a keyring from raw key material.
    pub fn from_keys(
        active: impl Into<String>,
        keys: impl IntoIterator<Item = (String, [u8; 32])>,
    ) -> Result<Self> {
        let active = active.into();
        let keys: HashMap<_, _> = keys.into_iter().collect();
        if !keys.contains_key(&active) {
            return Err(CryptoError::UnknownKey(active));
        }
        Ok(Self { keys, active })
    }

    /// Build a keyring from base64-encoded key material (as found in config).
    pub fn from_encoded<'a>(
        active: &str,
        keys: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self> {
        let decoded = keys
            .into_iter()
            .map(|(id, material)| Ok((id.to_string(), decode_key(id, material)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::from_keys(active, decoded)
    }

    /// Add a freshly generated master key and make it active.
    ///
    /// Previous keys stay available for reads.
    pub fn rotate_generated(&mut self, key_id: impl Into<String>) {
        let key_id = key_id.into();
        self.keys.insert(key_id.clone(), random_key());
        self.active = key_id;
    }

    fn master(&self, key_id: &str) -> Result<Aes256Gcm> {
        self.keys
            .get(key_id)
            .map(|key| Aes256Gcm::new(key_ref(key)))
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))
    }
}

impl std::fmt::Debug for LocalKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("LocalKeyring")
            .field("active", &self.active)
            .field("keys", &ids)
            .finish()
    }
}

#[async_trait]
impl KeyProvider for LocalKeyring {
    fn active_key_id(&self) -> &str {
        &self.active
    }

    async fn generate_data_key(&self) -> Result<DataKey> {
        let master = self.master(&self.active)?;
        let plaintext = random_key();
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = master
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: self.active.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + sealed.len());
        wrapped.extend_from_slice(nonce.as_slice());
        wrapped.extend_from_slice(&sealed);

        Ok(DataKey {
            key_id: self.active.clone(),
            plaintext,
            wrapped,
        })
    }

    async fn unwrap_data_key(&self, key_id: &str, wrapped: &[u8]) -> Result<[u8; 32]> {
        let master = self.master(key_id)?;
        if wrapped.len() <= NONCE_LEN {
            return Err(CryptoError::MalformedEnvelope("wrapped key truncated".to_string()));
        }
        let (nonce, sealed) = wrapped.split_at(NONCE_LEN);
        let plaintext = master
            .decrypt(
                nonce_ref(nonce),
                Payload {
                    msg: sealed,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Decrypt {
                key_id: key_id.to_string(),
            })?;

        plaintext
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::MalformedEnvelope("data key has wrong length".to_string()))
    }
}

fn random_key() -> [u8; 32] {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(key.as_slice());
    bytes
}

fn decode_key(key_id: &str, material: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(material.trim())
        .map_err(|e| CryptoError::InvalidKeyMaterial {
            key_id: key_id.to_string(),
            reason: e.to_string(),
        })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyMaterial {
            key_id: key_id.to_string(),
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })
}
