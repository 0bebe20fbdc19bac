//! Password hashing for the unlock path.
//!
//! The master key is Argon2id over the password, salted with the SHA-256
//! of the account identity, using the parameters stored with the account.
//! The derivation is intentionally slow; callers run it on a blocking thread.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultgateError};

/// Output length of the derivation (256-bit key for AES-256).
pub const MASTER_KEY_LEN: usize = 32;

/// Argon2id parameters stored with the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argon2Params {
    /// Memory cost in KiB.
    pub memory: u32,
    pub iterations: u32,
    pub parallelism: u32,
    /// Argon2 version number: 16 (0x10) or 19 (0x13).
    pub version: u32,
}

impl Default for Argon2Params {
    /// 19 MiB, 2 passes, 1 lane, v1.3.
    fn default() -> Self {
        Self {
            memory: 19456,
            iterations: 2,
            parallelism: 1,
            version: 0x13,
        }
    }
}

impl Argon2Params {
    fn version(&self) -> Result<Version> {
        match self.version {
            0x10 => Ok(Version::V0x10),
            0x13 => Ok(Version::V0x13),
            other => Err(VaultgateError::KeyDerivation(format!(
                "Unsupported Argon2 version: {}",
                other
            ))),
        }
    }

    fn to_argon2(self) -> Result<Argon2<'static>> {
        let params = Params::new(
            self.memory,
            self.iterations,
            self.parallelism,
            Some(MASTER_KEY_LEN),
        )
        .map_err(|e| VaultgateError::KeyDerivation(format!("Invalid Argon2 params: {}", e)))?;

        Ok(Argon2::new(Algorithm::Argon2id, self.version()?, params))
    }
}

/// Key derived from the user's password. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the actual key material
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn identity_salt(identity: &str) -> [u8; 32] {
    let digest = Sha256::digest(identity.as_bytes());
    let mut salt = [0u8; 32];
    salt.copy_from_slice(&digest);
    salt
}

/// Derive the master key for `password` under `identity` and `params`.
///
/// Same inputs always produce the same key.
pub fn derive_password_hash(
    password: &str,
    identity: &str,
    params: &Argon2Params,
) -> Result<MasterKey> {
    let argon2 = params.to_argon2()?;
    let salt = identity_salt(identity);

    let mut key = [0u8; MASTER_KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut key)
        .map_err(|e| VaultgateError::KeyDerivation(format!("Key derivation failed: {}", e)))?;

    debug!(
        "Derived master key (m={}, t={}, p={})",
        params.memory, params.iterations, params.parallelism
    );
    Ok(MasterKey { key })
}

#[cfg(test)]
pub(crate) fn cheap_params() -> Argon2Params {
    Argon2Params {
        memory: 64,
        iterations: 1,
        parallelism: 1,
        version: 0x13,
    }
}
