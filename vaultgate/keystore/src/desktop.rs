//! Desktop key backend using the OS keyring.
//!
//! Platform keys are stored as base64 strings in the native keyring:
//! - **macOS**: Keychain Access
//! - **Windows**: Credential Manager
//! - **Linux**: Secret Service API (GNOME Keyring, KWallet)
//!
//! The desktop keyring has no biometric binding of its own, so user
//! presence is delegated to the [`PresenceVerifier`] given to the custodian.

use std::sync::Arc;

use keyring::Entry;
use tracing::{debug, error, info, warn};

use crate::custodian::{Custodian, KeyBackend};
use crate::error::Error;
use crate::key::PlatformKey;
use crate::models::*;
use crate::PresenceVerifier;

/// Default service name used for keyring entries.
pub const DEFAULT_SERVICE_NAME: &str = "dev.vaultgate.keystore";

/// Custodian backed by the OS keyring.
pub type KeyringCustodian = Custodian<KeyringBackend>;

impl KeyringCustodian {
    pub fn new(service: impl Into<String>, verifier: Arc<dyn PresenceVerifier>) -> Self {
        Custodian::with_backend(KeyringBackend::new(service), verifier)
    }
}

/// Keyring entries for one service name; each alias is an account.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, alias: &KeyAlias) -> crate::Result<Entry> {
        Entry::new(&self.service, alias.as_str()).map_err(|e| {
            error!("Failed to create keyring entry: {}", e);
            Self::map_keyring_error(alias, e)
        })
    }

    /// Get the appropriate storage method for the current platform.
    fn platform_method() -> SecretStorageMethod {
        #[cfg(target_os = "macos")]
        {
            SecretStorageMethod::MacOSKeychain
        }
        #[cfg(target_os = "windows")]
        {
            SecretStorageMethod::WindowsCredentialManager
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            SecretStorageMethod::LinuxSecretService
        }
    }

    /// Map keyring errors to our error type.
    fn map_keyring_error(alias: &KeyAlias, err: keyring::Error) -> Error {
        match err {
            keyring::Error::NoEntry => Error::KeyNotFound(alias.to_string()),
            keyring::Error::Ambiguous(_) => {
                Error::Internal("Multiple keyring entries found".into())
            }
            keyring::Error::NoStorageAccess(e) => {
                Error::NotAvailable(format!("Keyring access denied: {:?}", e))
            }
            keyring::Error::PlatformFailure(e) => {
                let msg = format!("{:?}", e);
                if msg.contains("Dbus") || msg.contains("dbus") || msg.contains("D-Bus") {
                    Error::NotAvailable(format!(
                        "System keyring not available (D-Bus error): {}",
                        msg
                    ))
                } else {
                    Error::Internal(format!("Keyring error: {:?}", e))
                }
            }
            // An entry we can no longer decode is as unusable as a revoked key.
            keyring::Error::BadEncoding(_) => Error::KeyInvalidated(alias.to_string()),
            _ => Error::Internal(format!("Keyring error: {}", err)),
        }
    }
}

impl KeyBackend for KeyringBackend {
    fn status(&self) -> SecretStorageStatus {
        debug!("Checking keyring availability for service: {}", self.service);

        let check = KeyAlias::new("availability-check");
        let entry = match Entry::new(&self.service, check.as_str()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Keyring not available: {}", e);
                return SecretStorageStatus::unavailable(format!(
                    "OS keyring not available: {}",
                    e
                ));
            }
        };
        let method = Self::platform_method();
        match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => SecretStorageStatus::available(method),
            Err(e) => {
                warn!("Keyring not accessible: {:?}", e);
                SecretStorageStatus::unavailable(format!("OS keyring not accessible: {}", e))
            }
        }
    }

    fn load(&self, alias: &KeyAlias) -> crate::Result<Option<PlatformKey>> {
        let entry = self.entry(alias)?;

        let encoded = match entry.get_password() {
            Ok(password) => password,
            Err(keyring::Error::NoEntry) => {
                debug!("No keyring entry for '{}'", alias);
                return Ok(None);
            }
            Err(e) => {
                error!("Failed to retrieve key from keyring: {:?}", e);
                return Err(Self::map_keyring_error(alias, e));
            }
        };

        let bytes = base64_decode(&encoded).map_err(|e| {
            warn!("Keyring entry '{}' is not valid base64: {}", alias, e);
            Error::KeyInvalidated(alias.to_string())
        })?;
        let key = PlatformKey::from_slice(&bytes)
            .map_err(|_| Error::KeyInvalidated(alias.to_string()))?;
        Ok(Some(key))
    }

    fn store(&self, alias: &KeyAlias, key: &PlatformKey) -> crate::Result<()> {
        let entry = self.entry(alias)?;
        let encoded = base64_encode(key.as_bytes());

        entry.set_password(&encoded).map_err(|e| {
            error!("Failed to store key in keyring: {:?}", e);
            Self::map_keyring_error(alias, e)
        })?;

        // Verify with a NEW Entry so we are not reading a cached value
        let readback = self.entry(alias)?.get_password().map_err(|e| {
            error!("Key verification failed - cannot read back: {:?}", e);
            Error::Internal(format!(
                "Keyring verification failed: set_password() succeeded but get_password() failed: {:?}",
                e
            ))
        })?;
        if readback != encoded {
            error!("Key verification failed - stored data doesn't match!");
            return Err(Error::Internal(
                "Keyring verification failed: data mismatch".into(),
            ));
        }

        info!("Key '{}' stored in OS keyring", alias);
        Ok(())
    }

    fn delete(&self, alias: &KeyAlias) -> crate::Result<()> {
        let entry = self.entry(alias)?;

        // delete_credential errors when the entry is missing; delete is idempotent
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => {
                debug!("No key to delete for '{}' (already gone)", alias);
                Ok(())
            }
            Err(e) => {
                error!("Failed to delete key from keyring: {:?}", e);
                Err(Self::map_keyring_error(alias, e))
            }
        }
    }
}

/// Base64 encode bytes to string.
fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Base64 decode string to bytes.
fn base64_decode(encoded: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip_of_key_bytes() {
        let key = PlatformKey::generate();
        let decoded = base64_decode(&base64_encode(key.as_bytes())).unwrap();
        assert_eq!(decoded.as_slice(), key.as_bytes());
    }

    #[test]
    fn test_no_entry_maps_to_key_not_found() {
        let alias = KeyAlias::new("vault-key");
        let err = KeyringBackend::map_keyring_error(&alias, keyring::Error::NoEntry);
        assert!(matches!(err, Error::KeyNotFound(a) if a == "vault-key"));
    }
}
