//! Session and authentication state types.

use serde::{Deserialize, Serialize};

/// Status of the vault as a whole, as seen by the app shell.
///
/// - `NotSetup`: no credentials record exists
/// - `Locked`: credentials exist but no live session secrets are held
/// - `Unlocked`: a live, non-expired session is in memory
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum VaultStatus {
    #[default]
    NotSetup,
    Locked,
    Unlocked,
}

/// Why the last unlock attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidCredentials,
}

/// State of one Session Gate.
///
/// `Locked` → `Unlocking` → `Unlocked` | `Failed` | `Locked`.
/// `Failed` behaves like `Locked` but remembers why. `Unlocked` is terminal
/// for the gate instance.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum UnlockState {
    #[default]
    Locked,
    Unlocking,
    Unlocked,
    Failed(FailureReason),
}

impl UnlockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked | Self::Failed(_))
    }
}

/// Which path produced the vault encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Argon2id over the password, then decrypt of the stored key.
    Password,
    /// Platform key released after a presence assertion.
    Biometric,
}

impl std::fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSetup => write!(f, "NotSetup"),
            Self::Locked => write!(f, "Locked"),
            Self::Unlocked => write!(f, "Unlocked"),
        }
    }
}

impl std::fmt::Display for UnlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "locked"),
            Self::Unlocking => write!(f, "unlocking"),
            Self::Unlocked => write!(f, "unlocked"),
            Self::Failed(FailureReason::InvalidCredentials) => {
                write!(f, "failed (invalid credentials)")
            }
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password => write!(f, "password"),
            Self::Biometric => write!(f, "biometric"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_counts_as_locked() {
        assert!(UnlockState::Locked.is_locked());
        assert!(UnlockState::Failed(FailureReason::InvalidCredentials).is_locked());
        assert!(!UnlockState::Unlocking.is_locked());
        assert!(!UnlockState::Unlocked.is_locked());
    }

    #[test]
    fn test_state_serialization() {
        let json =
            serde_json::to_string(&UnlockState::Failed(FailureReason::InvalidCredentials)).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"invalid_credentials"}"#);
        assert_eq!(
            serde_json::to_string(&UnlockState::Locked).unwrap(),
            r#"{"state":"locked"}"#
        );
        assert_eq!(
            serde_json::to_string(&VaultStatus::NotSetup).unwrap(),
            r#""NotSetup""#
        );
    }
}
