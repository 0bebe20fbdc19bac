//! Platform key material and the single-use operations built on it.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};
use crate::models::{InitializationVector, SealedBlob, IV_LEN};

/// Platform key size in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// A 256-bit platform key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PlatformKey {
    key: [u8; KEY_LEN],
}

impl PlatformKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Rebuild a key from stored bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_LEN {
            return Err(Error::Internal(format!(
                "Platform key must be {} bytes, got {}",
                KEY_LEN,
                slice.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(slice);
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("Invalid key: {}", e)))
    }

    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<SealedBlob> {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| Error::Internal(format!("Encryption failed: {}", e)))?;

        Ok(SealedBlob {
            ciphertext,
            iv: InitializationVector::from_bytes(iv),
        })
    }

    pub(crate) fn open(
        &self,
        iv: &InitializationVector,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.cipher()?
            .decrypt(Nonce::from_slice(iv.as_bytes()), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| Error::Unauthenticated)
    }
}

impl std::fmt::Debug for PlatformKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Decrypt function released by a successful assertion.
///
/// Consumed by [`DecryptOperation::decrypt`], so it runs at most once.
#[derive(Debug)]
pub struct DecryptOperation {
    key: PlatformKey,
    iv: InitializationVector,
}

impl DecryptOperation {
    pub fn new(key: PlatformKey, iv: InitializationVector) -> Self {
        Self { key, iv }
    }

    pub fn decrypt(self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.key.open(&self.iv, ciphertext)
    }
}

/// Encrypt function released by a successful enrollment assertion.
#[derive(Debug)]
pub struct EncryptOperation {
    key: PlatformKey,
}

impl EncryptOperation {
    pub fn new(key: PlatformKey) -> Self {
        Self { key }
    }

    pub fn encrypt(self, plaintext: &[u8]) -> Result<SealedBlob> {
        self.key.seal(plaintext)
    }
}
