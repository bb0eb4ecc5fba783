use std::collections::HashMap;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use uuid::Uuid;

use super::VaultError;
use crate::models::ExitLevels;

const BLOB_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 2 + NONCE_LEN;
const KEY_LEN: usize = 32;

/// AES-256-GCM keyring for owner-only exit levels.
///
/// Blob layout (base64 of): `version | key_id | nonce[12] | ciphertext+tag`.
/// The signal id is bound as associated data, so a blob only opens for the
/// signal it was sealed for.
pub struct ExitCipher {
    active_id: u8,
    keys: HashMap<u8, Aes256Gcm>,
}

impl ExitCipher {
    pub fn new(active_id: u8, key: &[u8]) -> Result<Self, VaultError> {
        let mut keys = HashMap::new();
        keys.insert(active_id, build_key(key)?);
        Ok(Self { active_id, keys })
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(active_id: u8, key_b64: &str) -> Result<Self, VaultError> {
        let key = decode_key(key_b64)?;
        Self::new(active_id, &key)
    }

    /// Register a retired key that can still open old blobs but never seals.
    pub fn with_retired_key(mut self, key_id: u8, key_b64: &str) -> Result<Self, VaultError> {
        if key_id == self.active_id {
            return Err(VaultError::InvalidKey(format!(
                "retired key id {key_id} collides with the active key"
            )));
        }
        let key = decode_key(key_b64)?;
        self.keys.insert(key_id, build_key(&key)?);
        Ok(self)
    }

    pub fn active_key_id(&self) -> u8 {
        self.active_id
    }

    pub fn seal(&self, signal_id: Uuid, levels: &ExitLevels) -> Result<String, VaultError> {
        let cipher = self
            .keys
            .get(&self.active_id)
            .ok_or_else(|| VaultError::InvalidKey("active key missing from keyring".into()))?;

        let plaintext =
            serde_json::to_vec(levels).map_err(|e| VaultError::Encryption(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: signal_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Encryption("AES-GCM seal failed".into()))?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.push(self.active_id);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    pub fn open(&self, signal_id: Uuid, blob: &str) -> Result<ExitLevels, VaultError> {
        let fail = |detail: &str| VaultError::Decryption {
            signal_id,
            detail: detail.to_string(),
        };

        let raw = BASE64.decode(blob.trim()).map_err(|_| fail("blob is not base64"))?;
        if raw.len() <= HEADER_LEN {
            return Err(fail("blob truncated"));
        }
        if raw[0] != BLOB_VERSION {
            return Err(fail("unsupported blob version"));
        }

        let cipher = self.keys.get(&raw[1]).ok_or_else(|| fail("unknown key id"))?;
        let nonce = Nonce::from_slice(&raw[2..HEADER_LEN]);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &raw[HEADER_LEN..],
                    aad: signal_id.as_bytes(),
                },
            )
            .map_err(|_| fail("authentication failed"))?;

        serde_json::from_slice(&plaintext).map_err(|_| fail("plaintext is not exit levels"))
    }

    /// Key id a blob was sealed with, if the header is readable.
    pub fn key_id_of(&self, blob: &str) -> Option<u8> {
        let raw = BASE64.decode(blob.trim()).ok()?;
        (raw.len() > HEADER_LEN && raw[0] == BLOB_VERSION).then(|| raw[1])
    }

    pub fn is_current(&self, blob: &str) -> bool {
        self.key_id_of(blob) == Some(self.active_id)
    }
}

fn decode_key(key_b64: &str) -> Result<Vec<u8>, VaultError> {
    BASE64
        .decode(key_b64.trim())
        .map_err(|e| VaultError::InvalidKey(format!("key is not base64: {e}")))
}

fn build_key(key: &[u8]) -> Result<Aes256Gcm, VaultError> {
    if key.len() != KEY_LEN {
        return Err(VaultError::InvalidKey(format!(
            "expected {KEY_LEN}-byte key, got {}",
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| VaultError::InvalidKey(e.to_string()))
}
