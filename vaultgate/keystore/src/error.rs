//! Error types for platform key custody.

use serde::{Deserialize, Serialize};

/// Result type alias for custodian operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running key operations.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    /// Secure key storage is not available on this platform/device.
    #[error("Secure storage not available: {0}")]
    NotAvailable(String),

    /// The platform key exists but can no longer be used
    /// (biometric enrollment changed, key permanently invalidated by the OS).
    /// Any blob sealed under it is unrecoverable.
    #[error("Platform key '{0}' has been invalidated")]
    KeyInvalidated(String),

    /// No key is stored under the alias.
    #[error("No key found for alias '{0}'")]
    KeyNotFound(String),

    /// The sealed blob failed authentication under the platform key.
    #[error("Sealed data could not be authenticated")]
    Unauthenticated,

    /// The initialization vector has the wrong length.
    #[error("Invalid initialization vector: expected {expected} bytes, got {actual}")]
    InvalidIv { expected: usize, actual: usize },

    /// Platform-specific internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_tagged() {
        let err = Error::KeyInvalidated("vault-key".into());
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"KeyInvalidated\""));
        assert!(json.contains("vault-key"));
    }
}
