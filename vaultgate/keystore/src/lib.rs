//! Platform key custody for vaultgate.
//!
//! A [`KeyCustodian`] owns keys that never leave the platform boundary in
//! the clear except through a single-use operation released by a presence
//! assertion (biometric prompt, OS confirmation). Two custodians ship here:
//! - [`KeyringCustodian`]: OS keyring on desktop targets
//! - [`SoftwareCustodian`]: in-memory keys for tests and headless tooling

use async_trait::async_trait;

mod custodian;
#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
mod desktop;
mod error;
mod key;
mod memory;
mod models;

pub use custodian::{Custodian, KeyBackend};
#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
pub use desktop::{KeyringBackend, KeyringCustodian, DEFAULT_SERVICE_NAME};
pub use error::{Error, Result};
pub use key::{DecryptOperation, EncryptOperation, PlatformKey, KEY_LEN};
pub use memory::{ManualVerifier, MemoryBackend, PendingPrompt, ScriptedVerifier, SoftwareCustodian};
pub use models::*;

/// Capability interface over a hardware- or OS-backed key store.
#[async_trait]
pub trait KeyCustodian: Send + Sync {
    /// Check what secure storage capabilities are available.
    async fn check_availability(&self) -> Result<SecretStorageStatus>;

    /// Create (or replace) the key stored under `alias`.
    async fn create_key(&self, alias: &KeyAlias) -> Result<()>;

    /// Delete the key under `alias`. Deleting a missing key succeeds.
    async fn delete_key(&self, alias: &KeyAlias) -> Result<()>;

    /// Get or create a key used for at-rest encryption without a prompt.
    async fn storage_key(&self, alias: &KeyAlias) -> Result<PlatformKey>;

    /// Bind an encrypt operation to the key under `alias`.
    async fn build_encrypt_operation(&self, alias: &KeyAlias) -> Result<EncryptHandle>;

    /// Bind a decrypt operation to the key under `alias` and `iv`.
    async fn build_decrypt_operation(
        &self,
        alias: &KeyAlias,
        iv: &InitializationVector,
    ) -> Result<OperationHandle>;

    /// Prompt for presence; on success release the bound decrypt operation.
    async fn await_assertion(
        &self,
        handle: OperationHandle,
    ) -> Result<Assertion<DecryptOperation>>;

    /// Prompt for presence; on success release the bound encrypt operation.
    async fn await_encrypt_assertion(
        &self,
        handle: EncryptHandle,
    ) -> Result<Assertion<EncryptOperation>>;
}

/// The prompt half of the biometric boundary. Each call yields exactly one
/// terminal result.
#[async_trait]
pub trait PresenceVerifier: Send + Sync {
    async fn verify(&self, prompt: &Prompt) -> PresenceResult;
}
