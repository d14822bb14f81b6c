//! Sealing and opening of payloads exchanged with the backend.
//!
//! Uses ChaCha20-Poly1305 AEAD keyed from the shared secret. Key material is
//! zeroed from memory when dropped. Transports only see the [`Cipher`] trait;
//! [`SecretCipher`] is the implementation the daemon wires in.

use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::digest::{digest, SHA256};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
const KEY_LEN: usize = 32;

/// Size of nonce in bytes (96 bits)
const NONCE_LEN: usize = 12;

/// Size of authentication tag appended to ciphertext (128 bits)
const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to generate random bytes")]
    RandomGeneration,
    #[error("encryption failed")]
    Encryption,
    /// Wrong secret, tampered ciphertext, or truncated tag.
    #[error("decryption failed")]
    Decryption,
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

// ---------------------------------------------------------------------------
// Key Management
// ---------------------------------------------------------------------------

/// A cryptographic key that is automatically zeroed from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Derive a key from a shared secret string (SHA-256 of the secret).
    pub fn derive(secret: &str) -> Self {
        let hashed = digest(&SHA256, secret.as_bytes());
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(hashed.as_ref());
        Self { bytes }
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

// ---------------------------------------------------------------------------
// Nonce Management
// ---------------------------------------------------------------------------

/// A nonce sequence that yields exactly one nonce.
struct OneNonceSequence {
    nonce: Option<Nonce>,
}

impl NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.nonce.take().ok_or(Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Encryption/Decryption
// ---------------------------------------------------------------------------

/// Encrypt plaintext. Output layout: `nonce (12) || ciphertext || tag (16)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::RandomGeneration)?;

    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Encryption)?;
    let mut sealing_key = SealingKey::new(
        unbound_key,
        OneNonceSequence {
            nonce: Some(Nonce::assume_unique_for_key(nonce_bytes)),
        },
    );

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Encryption)?;

    let mut result = nonce_bytes.to_vec();
    result.extend_from_slice(&in_out);
    Ok(result)
}

/// Decrypt the output of [`encrypt`].
pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "ciphertext too short: expected at least {} bytes, got {}",
            NONCE_LEN + TAG_LEN,
            ciphertext.len()
        )));
    }

    let nonce_bytes: [u8; NONCE_LEN] = ciphertext[..NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("failed to extract nonce".into()))?;

    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Decryption)?;
    let mut opening_key = OpeningKey::new(
        unbound_key,
        OneNonceSequence {
            nonce: Some(Nonce::assume_unique_for_key(nonce_bytes)),
        },
    );

    let mut in_out = ciphertext[NONCE_LEN..].to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Decryption)?;

    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Cipher
// ---------------------------------------------------------------------------

/// Opaque seal/open collaborator used by every transport adapter.
pub trait Cipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Seal a JSON value and hex-encode it for embedding in a text frame.
    fn seal_json(&self, value: &serde_json::Value) -> Result<String, CryptoError> {
        let raw = serde_json::to_vec(value).map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
        Ok(hex::encode(self.seal(&raw)?))
    }

    /// Inverse of [`Cipher::seal_json`].
    fn open_json(&self, sealed_hex: &str) -> Result<serde_json::Value, CryptoError> {
        let sealed =
            hex::decode(sealed_hex).map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
        let raw = self.open(&sealed)?;
        serde_json::from_slice(&raw).map_err(|e| CryptoError::InvalidFormat(e.to_string()))
    }
}

/// [`Cipher`] keyed from the shared secret.
#[derive(Clone)]
pub struct SecretCipher {
    key: EncryptionKey,
}

impl SecretCipher {
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncryptionKey::derive(secret),
        }
    }
}

impl Cipher for SecretCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt(&self.key, plaintext)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt(&self.key, sealed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
