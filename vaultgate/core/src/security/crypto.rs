use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Failures of the symmetric cipher.
///
/// `AuthenticationFailure` is the only signal that a key is wrong; callers
/// rely on it to tell a bad password apart from every other fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Ciphertext failed authentication")]
    AuthenticationFailure,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Short, non-reversible identifier for key material (first 8 bytes of SHA-256).
pub fn fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(&hasher.finalize()[..8])
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_SIZE {
        return Err(CipherError::InvalidKey(format!(
            "key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CipherError::InvalidKey(e.to_string()))
}

/// Encrypt with AES-256-GCM.
///
/// Format: `[12-byte nonce][ciphertext with 16-byte auth tag]`
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = cipher_for(key)?;

    // Generate random nonce
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CipherError::Encryption(e.to_string()))?;

    // Prepend nonce to ciphertext
    let mut result = nonce_bytes.to_vec();
    result.extend(ciphertext);
    Ok(result)
}

/// Decrypt data produced by [`encrypt`].
///
/// A wrong key, a truncated blob and a tampered blob all fail with
/// [`CipherError::AuthenticationFailure`].
pub fn decrypt(encrypted: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = cipher_for(key)?;

    if encrypted.len() < NONCE_SIZE {
        return Err(CipherError::AuthenticationFailure);
    }

    // Extract nonce and ciphertext
    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CipherError::AuthenticationFailure)
}
