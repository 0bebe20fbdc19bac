//! Errors surfaced at the Session Gate boundary.
//!
//! Every lower-level failure (cipher, storage, keystore) is mapped onto one
//! of these before it leaves the gate, so callers only ever decide between
//! "tell the user the password was wrong", "generic retry" and "say nothing".

use thiserror::Error;

use crate::error::VaultgateError;

#[derive(Error, Debug)]
pub enum VaultError {
    /// The password did not decrypt the stored key.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// No usable biometric path (no hardware, not enrolled, not enabled).
    #[error("Biometric unlock unavailable: {0}")]
    BiometricUnavailable(String),

    #[error("Biometric unlock failed: {0}")]
    BiometricFailed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The platform key was revoked; biometric unlock has been disabled.
    #[error("Biometric key invalidated")]
    KeyInvalidated,

    #[error("Vault not provisioned")]
    NotProvisioned,

    /// The attempt was abandoned before it could take effect.
    #[error("Unlock attempt cancelled")]
    Cancelled,
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;

/// What the presentation layer should do with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFeedback {
    /// Show the error's message.
    Message,
    /// Show a generic "something went wrong, try again".
    GenericRetry,
    /// Do nothing; the user already knows (e.g. they cancelled the prompt).
    Silent,
}

impl VaultError {
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::InvalidCredentials => "INVALID_CREDENTIALS",
            VaultError::BiometricUnavailable(_) => "BIOMETRIC_UNAVAILABLE",
            VaultError::BiometricFailed(_) => "BIOMETRIC_FAILED",
            VaultError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            VaultError::KeyInvalidated => "KEY_INVALIDATED",
            VaultError::NotProvisioned => "NOT_PROVISIONED",
            VaultError::Cancelled => "CANCELLED",
        }
    }

    pub fn user_feedback(&self) -> UserFeedback {
        match self {
            VaultError::InvalidCredentials => UserFeedback::Message,
            VaultError::StorageUnavailable(_)
            | VaultError::NotProvisioned
            | VaultError::Cancelled => UserFeedback::GenericRetry,
            VaultError::BiometricUnavailable(_)
            | VaultError::BiometricFailed(_)
            | VaultError::KeyInvalidated => UserFeedback::Silent,
        }
    }

    /// Keystore errors raised on the biometric path.
    pub(crate) fn from_keystore(err: vaultgate_keystore::Error) -> Self {
        use vaultgate_keystore::Error as Ks;
        match err {
            Ks::KeyInvalidated(_)
            | Ks::KeyNotFound(_)
            | Ks::Unauthenticated
            | Ks::InvalidIv { .. } => VaultError::KeyInvalidated,
            Ks::NotAvailable(reason) => VaultError::BiometricUnavailable(reason),
            Ks::Internal(msg) => VaultError::BiometricFailed(msg),
        }
    }
}

impl From<VaultgateError> for VaultError {
    fn from(err: VaultgateError) -> Self {
        VaultError::StorageUnavailable(err.to_string())
    }
}

impl serde::Serialize for VaultError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("VaultError", 2)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
