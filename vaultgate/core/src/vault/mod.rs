//! Unlock and session custody.
//!
//! The [`SessionGate`] recovers the vault encryption key from a password
//! (Argon2id + AES-256-GCM) or from a platform key released by a presence
//! check, and the [`SecretStore`] holds the user's key pair for as long as
//! the unlock policy allows.

pub mod auth;
pub mod error;
pub mod gate;
pub mod secrets;

pub use auth::{AuthMethod, FailureReason, UnlockState, VaultStatus};
pub use error::{UserFeedback, VaultError, VaultResult};
pub use gate::{EncryptionKey, SessionGate, UnlockOutcome};
pub use secrets::{SecretStore, UserSecrets};
