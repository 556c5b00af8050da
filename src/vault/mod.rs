//! AES-256-GCM sealing of credential tokens.
//!
//! Every token is sealed with a fresh random nonce; the nonce is prepended to
//! the ciphertext and the whole blob is base64-encoded, so a sealed token is a
//! single opaque string. The master key must be 32 bytes (256 bits) and is
//! provided from an environment variable at startup.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Vault failures.
///
/// `Decryption` is deliberately distinct from "no ciphertext stored": callers
/// use it to tell "token never existed" apart from "token is corrupt and the
/// connection needs re-authorization."
#[derive(Debug, Error)]
pub enum VaultError {
    /// Key is not valid base64 or not 32 bytes after decoding
    #[error("encryption key must be {KEY_SIZE} bytes of base64, got {0}")]
    InvalidKey(String),

    /// Sealing failed (should not happen for any valid token string)
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Ciphertext is malformed, truncated, tampered with, or was sealed
    /// under a different key
    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Process-wide token vault.
///
/// The key is read-only after construction and never logged or persisted.
pub struct TokenVault {
    key: Vec<u8>,
}

impl TokenVault {
    /// Creates a vault from a base64-encoded 32-byte master key.
    pub fn new(key_base64: &str) -> Result<Self, VaultError> {
        let key = BASE64
            .decode(key_base64)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;

        if key.len() != KEY_SIZE {
            return Err(VaultError::InvalidKey(format!(
                "decoded to {} bytes",
                key.len()
            )));
        }

        Ok(Self { key })
    }

    /// Seals a token string, returning base64(nonce || ciphertext).
    ///
    /// # Security
    /// - Cryptographically secure random nonce per call (never reused)
    /// - Authenticated encryption: tampering is detected on `open`
    pub fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&blob))
    }

    /// Opens a sealed token, returning the original plaintext.
    ///
    /// Fails with `VaultError::Decryption` if the blob is malformed,
    /// truncated, tampered with, or was sealed under a different key. Never
    /// returns partial plaintext.
    pub fn open(&self, sealed: &str) -> Result<String, VaultError> {
        let blob = BASE64
            .decode(sealed)
            .map_err(|e| VaultError::Decryption(format!("invalid base64: {e}")))?;

        if blob.len() <= NONCE_SIZE {
            return Err(VaultError::Decryption(format!(
                "blob too short: {} bytes",
                blob.len()
            )));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Decryption("wrong key or corrupted data".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Decryption("plaintext is not valid UTF-8".into()))
    }
}
