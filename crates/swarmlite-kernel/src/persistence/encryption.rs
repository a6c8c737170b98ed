//! AES-256-GCM encryption for sensitive fields at rest.
//!
//! Sealed values are self-describing strings (`enc:<base64(nonce || ct)>`)
//! so a store can tell encrypted from plaintext columns without extra
//! schema. The key is derived from `DB_ENCRYPTION_KEY` (SHA-256 of the raw
//! value), which must be at least 32 bytes.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;
const MIN_KEY_BYTES: usize = 32;
const SEALED_PREFIX: &str = "enc:";

/// Field encryption errors
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("encryption key must be at least {MIN_KEY_BYTES} bytes, got {0}")]
    KeyTooShort(usize),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed (data may be corrupted): {0}")]
    Decrypt(String),

    #[error("sealed value is malformed: {0}")]
    Malformed(String),
}

/// Symmetric cipher over individual row fields
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    /// Derive a cipher from raw key material (≥ 32 bytes)
    pub fn new(key_material: &[u8]) -> Result<Self, EncryptionError> {
        if key_material.len() < MIN_KEY_BYTES {
            return Err(EncryptionError::KeyTooShort(key_material.len()));
        }
        let key = Sha256::digest(key_material);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EncryptionError::Encrypt(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Whether a stored string is a sealed value
    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }

    /// Encrypt plaintext into a self-describing sealed string
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| EncryptionError::Encrypt(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{SEALED_PREFIX}{}", BASE64.encode(combined)))
    }

    /// Decrypt a sealed string back to plaintext
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, EncryptionError> {
        let encoded = sealed
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| EncryptionError::Malformed("missing enc: prefix".into()))?;

        let combined = BASE64
            .decode(encoded)
            .map_err(|e| EncryptionError::Malformed(e.to_string()))?;

        if combined.len() <= NONCE_SIZE {
            return Err(EncryptionError::Malformed("sealed value too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EncryptionError::Decrypt(e.to_string()))
    }

    /// Seal a UTF-8 string field
    pub fn seal_str(&self, plaintext: &str) -> Result<String, EncryptionError> {
        self.seal(plaintext.as_bytes())
    }

    /// Open a sealed field back into a string
    pub fn open_str(&self, sealed: &str) -> Result<String, EncryptionError> {
        let plaintext = self.open(sealed)?;
        String::from_utf8(plaintext)
            .map_err(|_| EncryptionError::Decrypt("not valid UTF-8".into()))
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}
