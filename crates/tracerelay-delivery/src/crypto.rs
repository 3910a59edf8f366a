//! Decryption of destination configuration stored at rest.
//!
//! Sealed values have the form `v1:<base64(nonce || ciphertext)>` where the
//! ciphertext is ChaCha20-Poly1305 over the JSON configuration. Values
//! without the prefix are plain JSON.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::Rng;
use serde_json::Value;

use crate::error::{DeliveryError, Result};

const SEALED_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;

/// Length in bytes of a config encryption key.
pub const KEY_LEN: usize = 32;

/// Turns a stored destination config into the JSON handed to adapters.
pub trait ConfigDecryptor: Send + Sync + fmt::Debug {
    /// Decrypts and parses a stored config.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the value cannot be
    /// decrypted or is not valid JSON.
    fn decrypt(&self, stored: &str) -> Result<Value>;
}

/// Returns true if a stored config is sealed.
pub fn is_sealed(stored: &str) -> bool {
    stored.starts_with(SEALED_PREFIX)
}

fn parse_json(plaintext: &[u8]) -> Result<Value> {
    serde_json::from_slice(plaintext)
        .map_err(|e| DeliveryError::configuration(format!("config is not valid JSON: {e}")))
}

/// Decryptor for deployments without a config key.
///
/// Parses stored JSON as-is and rejects sealed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextConfig;

impl ConfigDecryptor for PlaintextConfig {
    fn decrypt(&self, stored: &str) -> Result<Value> {
        if is_sealed(stored) {
            return Err(DeliveryError::configuration(
                "config is encrypted but no decryption key is configured",
            ));
        }
        parse_json(stored.as_bytes())
    }
}

/// ChaCha20-Poly1305 decryptor holding the deployment key.
#[derive(Clone)]
pub struct ChaChaConfigDecryptor {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for ChaChaConfigDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaConfigDecryptor").field("key", &"<redacted>").finish()
    }
}

impl ChaChaConfigDecryptor {
    /// Creates a decryptor from raw key bytes.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Creates a decryptor from a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the key is not valid base64
    /// or has the wrong length.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| DeliveryError::configuration(format!("invalid config key: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            DeliveryError::configuration(format!(
                "config key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| DeliveryError::configuration(format!("invalid config key: {e}")))
    }

    /// Seals a JSON config for storage.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if encryption fails.
    pub fn seal(&self, config: &Value) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let plaintext = config.to_string();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| DeliveryError::configuration(format!("failed to seal config: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(sealed)))
    }
}

impl ConfigDecryptor for ChaChaConfigDecryptor {
    fn decrypt(&self, stored: &str) -> Result<Value> {
        let Some(encoded) = stored.strip_prefix(SEALED_PREFIX) else {
            return parse_json(stored.as_bytes());
        };

        let sealed = STANDARD.decode(encoded).map_err(|e| {
            DeliveryError::configuration(format!("sealed config is not base64: {e}"))
        })?;
        if sealed.len() <= NONCE_LEN {
            return Err(DeliveryError::configuration("sealed config is truncated"));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DeliveryError::configuration("config decryption failed"))?;

        parse_json(&plaintext)
    }
}
