//! Field-level AES-256-GCM encryption for sensitive database columns.
//!
//! Every ciphertext is bound to its storage location through associated data
//! (`table|column|row-key|enc-version`), so a blob copied into another row
//! fails authentication on read. Blobs are self-describing:
//! `version(1) | kid_len(1) | kid(var) | nonce(12) | ciphertext+tag`, which
//! allows several master keys to coexist during rotation.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info};

const BLOB_VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Smallest structurally valid blob: header + one-byte kid + nonce.
const MIN_BLOB_LEN: usize = 2 + 1 + NONCE_SIZE;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key '{0}' not found")]
    KeyMissing(String),

    #[error("invalid encrypted payload: {0}")]
    InvalidPayload(String),

    #[error("decryption failed (wrong key, corrupted blob, or AAD mismatch)")]
    DecryptFailed,

    #[error("encryption failed")]
    EncryptFailed,
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// AES-256-GCM field cipher holding one or more master keys addressed by kid.
pub struct FieldCipher {
    keys: HashMap<String, Aes256Gcm>,
    default_kid: String,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    /// Load the master key for `key_id` from the OS secret vault.
    ///
    /// The vault entry is addressed as `(service, DB_MASTER_KEY_<KID>)` and
    /// must hold a hex-encoded 256-bit key.
    pub fn from_vault(service: &str, key_id: &str) -> CryptoResult<Self> {
        let account = format!("DB_MASTER_KEY_{}", key_id.to_uppercase());
        let entry = keyring::Entry::new(service, &account)
            .map_err(|_| CryptoError::KeyMissing(key_id.to_string()))?;
        let hex_key = entry
            .get_password()
            .map_err(|_| CryptoError::KeyMissing(key_id.to_string()))?;

        let key_bytes =
            hex::decode(hex_key.trim()).map_err(|_| CryptoError::KeyMissing(key_id.to_string()))?;

        let cipher = Self::from_keys([(key_id.to_string(), key_bytes)], key_id)?;
        info!(kid = key_id, "loaded field encryption key from vault");
        Ok(cipher)
    }

    /// Build a cipher from raw key material. Used for tests and for carrying
    /// retired keys alongside the active one during rotation.
    pub fn from_keys<I>(keys: I, default_kid: &str) -> CryptoResult<Self>
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let mut map = HashMap::new();
        for (kid, material) in keys {
            if material.len() != KEY_SIZE {
                return Err(CryptoError::KeyMissing(format!(
                    "{kid} has invalid size: {} bytes (expected {KEY_SIZE})",
                    material.len()
                )));
            }
            let cipher = Aes256Gcm::new_from_slice(&material)
                .map_err(|_| CryptoError::KeyMissing(kid.clone()))?;
            map.insert(kid, cipher);
        }

        if !map.contains_key(default_kid) {
            return Err(CryptoError::KeyMissing(default_kid.to_string()));
        }

        Ok(Self {
            keys: map,
            default_kid: default_kid.to_string(),
        })
    }

    /// Encrypt `plaintext` under the default key, bound to `aad`.
    pub fn encrypt(&self, plaintext: &str, aad: &str) -> CryptoResult<Vec<u8>> {
        self.encrypt_with_kid(plaintext, aad, &self.default_kid)
    }

    /// Encrypt under a specific key id.
    pub fn encrypt_with_kid(&self, plaintext: &str, aad: &str, kid: &str) -> CryptoResult<Vec<u8>> {
        let cipher = self
            .keys
            .get(kid)
            .ok_or_else(|| CryptoError::KeyMissing(kid.to_string()))?;

        let kid_bytes = kid.as_bytes();
        if kid_bytes.len() > u8::MAX as usize {
            return Err(CryptoError::InvalidPayload("key id too long".to_string()));
        }

        // Nonce reuse breaks GCM entirely, so every call draws fresh bytes.
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut blob = Vec::with_capacity(2 + kid_bytes.len() + NONCE_SIZE + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.push(kid_bytes.len() as u8);
        blob.extend_from_slice(kid_bytes);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        debug!(kid, aad, size = blob.len(), "encrypted field");
        Ok(blob)
    }

    /// Decrypt a blob, verifying its AAD binding.
    pub fn decrypt(&self, blob: &[u8], aad: &str) -> CryptoResult<String> {
        if blob.is_empty() {
            return Err(CryptoError::InvalidPayload("empty blob".to_string()));
        }
        if blob.len() < MIN_BLOB_LEN {
            return Err(CryptoError::InvalidPayload(format!(
                "blob too short: {} bytes",
                blob.len()
            )));
        }

        let version = blob[0];
        if version != BLOB_VERSION {
            return Err(CryptoError::InvalidPayload(format!(
                "unknown version: {version} (expected {BLOB_VERSION})"
            )));
        }

        let kid_len = blob[1] as usize;
        let kid_end = 2 + kid_len;
        if blob.len() < kid_end + NONCE_SIZE + 1 {
            return Err(CryptoError::InvalidPayload(
                "blob truncated (missing nonce or ciphertext)".to_string(),
            ));
        }

        let kid = std::str::from_utf8(&blob[2..kid_end])
            .map_err(|_| CryptoError::InvalidPayload("invalid key id encoding".to_string()))?;

        let cipher = self
            .keys
            .get(kid)
            .ok_or_else(|| CryptoError::KeyMissing(kid.to_string()))?;

        let nonce_end = kid_end + NONCE_SIZE;
        let nonce = Nonce::from_slice(&blob[kid_end..nonce_end]);
        let ciphertext = &blob[nonce_end..];

        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)?;

        let plaintext =
            String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptFailed)?;

        debug!(kid, aad, "decrypted field");
        Ok(plaintext)
    }

    /// Key id new ciphertexts are written under.
    pub fn default_kid(&self) -> &str {
        &self.default_kid
    }
}

/// Build the AAD context string binding a ciphertext to its storage location.
pub fn field_aad(table: &str, column: &str, row_key: &str, enc_version: i64) -> String {
    format!("{table}|{column}|{row_key}|{enc_version}")
}
