//! Data types shared by all key custodians.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// AES-GCM initialization vector size (96 bits).
pub const IV_LEN: usize = 12;

/// Name under which a platform key is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyAlias(String);

impl KeyAlias {
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Initialization vector a sealed blob was produced with.
///
/// Stored next to the blob (it is not secret) and required to build
/// the matching decrypt operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitializationVector([u8; IV_LEN]);

impl InitializationVector {
    pub fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; IV_LEN] = slice.try_into().map_err(|_| Error::InvalidIv {
            expected: IV_LEN,
            actual: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

/// Ciphertext produced by a platform key together with its IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    pub ciphertext: Vec<u8>,
    pub iv: InitializationVector,
}

/// A decrypt operation bound to one key alias and one IV.
///
/// Building the handle validates that the key is still usable; the key
/// itself is only released after a successful presence assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    alias: KeyAlias,
    iv: InitializationVector,
}

impl OperationHandle {
    pub fn new(alias: KeyAlias, iv: InitializationVector) -> Self {
        Self { alias, iv }
    }

    pub fn alias(&self) -> &KeyAlias {
        &self.alias
    }

    pub fn iv(&self) -> &InitializationVector {
        &self.iv
    }
}

/// An encrypt operation bound to one key alias. A fresh IV is chosen
/// when the operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptHandle {
    alias: KeyAlias,
}

impl EncryptHandle {
    pub fn new(alias: KeyAlias) -> Self {
        Self { alias }
    }

    pub fn alias(&self) -> &KeyAlias {
        &self.alias
    }
}

/// Terminal result of a presence assertion.
#[derive(Debug)]
pub enum Assertion<T> {
    /// The user was verified; the bound operation may run once.
    Succeeded(T),
    /// The user was not verified (rejected or cancelled). Nothing was released.
    Failed,
}

impl<T> Assertion<T> {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Assertion::Succeeded(_))
    }
}

/// What a presence prompt is being shown for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPurpose {
    Unlock,
    Enroll,
}

/// Context handed to a [`crate::PresenceVerifier`] for a single prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub alias: KeyAlias,
    pub purpose: PromptPurpose,
}

/// Outcome reported by a presence verifier (biometric prompt, OS dialog).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceResult {
    Verified,
    Rejected,
    Cancelled,
    Unavailable(String),
}

/// The method used for platform key storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretStorageMethod {
    /// macOS Keychain.
    MacOSKeychain,
    /// Windows Credential Manager.
    WindowsCredentialManager,
    /// Linux Secret Service API (GNOME Keyring, KWallet, etc.)
    LinuxSecretService,
    /// Process-local software keys. Only suitable for tests.
    Software,
}

/// Status of platform key storage availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretStorageStatus {
    /// Whether secure storage is available and can be used.
    pub available: bool,
    /// The method that will be used (if available).
    pub method: Option<SecretStorageMethod>,
    /// Why secure storage is unavailable (if not available).
    pub unavailable_reason: Option<String>,
}

impl SecretStorageStatus {
    /// Create a status indicating secure storage is available.
    pub fn available(method: SecretStorageMethod) -> Self {
        Self {
            available: true,
            method: Some(method),
            unavailable_reason: None,
        }
    }

    /// Create a status indicating secure storage is unavailable.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            method: None,
            unavailable_reason: Some(reason.into()),
        }
    }
}
