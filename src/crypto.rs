//! Envelope encryption for secrets that transit through the session store.
//!
//! Uses:
//! - A fresh 128-bit key per approved session
//! - AES-128-GCM with a random 96-bit nonce per envelope
//! - Standard base64 of `nonce || ciphertext` as the at-rest form
//!
//! An empty secret always maps to an empty envelope and back, so optional
//! credentials never need a key.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Ephemeral key length in bytes.
pub const KEY_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Envelope too short ({0} bytes)")]
    Truncated(usize),

    #[error("Decryption failed - invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Entropy source unavailable: {0}")]
    Entropy(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Per-session symmetric key.
///
/// Held by the session store until the coordinator consumes it. The bytes
/// are wiped when the last copy is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKey([u8; KEY_LEN]);

impl EphemeralKey {
    /// Generate a new key from the OS random source.
    pub fn generate() -> CryptoResult<Self> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EphemeralKey(<redacted>)")
    }
}

/// Generate a fresh session key.
pub fn generate_key() -> CryptoResult<EphemeralKey> {
    EphemeralKey::generate()
}

/// Seal a secret into a base64 envelope.
pub fn seal(plaintext: &str, key: &EphemeralKey) -> CryptoResult<String> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(envelope))
}

/// Open a base64 envelope produced by [`seal`].
pub fn open(envelope: &str, key: &EphemeralKey) -> CryptoResult<String> {
    if envelope.is_empty() {
        return Ok(String::new());
    }

    let data = BASE64.decode(envelope)?;
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Truncated(data.len()));
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let mut plaintext = key
        .cipher()
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    match String::from_utf8(plaintext) {
        Ok(text) => Ok(text),
        Err(e) => {
            plaintext = e.into_bytes();
            plaintext.zeroize();
            Err(CryptoError::DecryptionFailed)
        }
    }
}
