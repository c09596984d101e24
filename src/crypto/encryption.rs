//! Authenticated encryption using AES-256-GCM
//!
//! The repository format fixes AES-256-GCM with a 12-byte nonce and a
//! 16-byte tag. Every encryption draws a fresh random nonce; a nonce is
//! never reused with the same key.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use super::keys::MasterKey;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed - data may be corrupted or key incorrect")]
    DecryptionFailed,
    #[error("invalid ciphertext format")]
    InvalidFormat,
}

/// Encrypt data with AES-256-GCM
///
/// Output format: nonce (12 bytes) || ciphertext || tag (16 bytes)
pub fn encrypt(key: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    // Prepend nonce to ciphertext
    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt data with AES-256-GCM
pub fn decrypt(key: &MasterKey, stored: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if stored.len() < NONCE_LEN + TAG_LEN {
        return Err(EncryptionError::InvalidFormat);
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce = Nonce::from_slice(&stored[..NONCE_LEN]);
    let ciphertext = &stored[NONCE_LEN..];

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed)
}
