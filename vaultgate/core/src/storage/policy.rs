//! Unlock policy persisted as a small key-value JSON file.
//!
//! Two keys are kept: `VaultTimeout` (integer seconds, with sentinel values
//! for "lock instantly" and "never lock") and `VaultExpiresAt` (epoch millis).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{read_optional, write_private, StorageLayout};
use crate::error::{Result, VaultgateError};

const POLICY_FILE: &str = "policy.json";

pub const VAULT_TIMEOUT_KEY: &str = "VaultTimeout";
pub const VAULT_EXPIRES_AT_KEY: &str = "VaultExpiresAt";

/// How long a session stays unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultTimeout {
    /// Secrets never outlive the process that recovered them.
    Instant,
    Never,
    Seconds(u64),
}

impl VaultTimeout {
    /// `Seconds(0)` means the same thing as `Instant`.
    pub fn seconds(seconds: u64) -> Self {
        if seconds == 0 {
            Self::Instant
        } else {
            Self::Seconds(seconds)
        }
    }

    /// Timeout length in milliseconds for timed policies.
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            Self::Seconds(s) => Some(
                i64::try_from(*s)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(1000),
            ),
            Self::Instant | Self::Never => None,
        }
    }
}

impl std::fmt::Display for VaultTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instant => write!(f, "instant"),
            Self::Never => write!(f, "never"),
            Self::Seconds(s) => write!(f, "{}s", s),
        }
    }
}

/// Integer values that stand for [`VaultTimeout::Instant`] and
/// [`VaultTimeout::Never`] in the persisted policy.
///
/// Both must be non-positive and distinct so they cannot collide with a
/// real number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSentinels {
    pub instant: i64,
    pub never: i64,
}

impl Default for TimeoutSentinels {
    fn default() -> Self {
        Self {
            instant: 0,
            never: -1,
        }
    }
}

impl TimeoutSentinels {
    pub fn validate(&self) -> Result<()> {
        if self.instant > 0 || self.never > 0 {
            return Err(VaultgateError::Config(
                "timeout sentinels must not be positive".into(),
            ));
        }
        if self.instant == self.never {
            return Err(VaultgateError::Config(
                "instant and never sentinels must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn encode(&self, timeout: VaultTimeout) -> i64 {
        match timeout {
            VaultTimeout::Instant => self.instant,
            VaultTimeout::Never => self.never,
            VaultTimeout::Seconds(s) => i64::try_from(s).unwrap_or(i64::MAX),
        }
    }

    /// Unknown non-positive values decode as `Instant` so a damaged policy
    /// locks rather than keeping secrets around.
    pub fn decode(&self, raw: i64) -> VaultTimeout {
        if raw == self.instant {
            VaultTimeout::Instant
        } else if raw == self.never {
            VaultTimeout::Never
        } else if raw > 0 {
            VaultTimeout::Seconds(raw as u64)
        } else {
            warn!("Unrecognized vault timeout {}, treating as instant", raw);
            VaultTimeout::Instant
        }
    }
}

/// Snapshot of the persisted policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockPolicy {
    pub timeout: VaultTimeout,
    /// Epoch millis after which the session is expired. 0 when never set.
    pub expires_at: i64,
}

/// Whether a session under `policy` has expired at `now` (epoch millis).
///
/// INSTANT is always expired, NEVER never is, otherwise expiry is strictly
/// after `expires_at`.
pub fn is_expired(policy: &UnlockPolicy, now: i64) -> bool {
    match policy.timeout {
        VaultTimeout::Instant => true,
        VaultTimeout::Never => false,
        VaultTimeout::Seconds(_) => now > policy.expires_at,
    }
}

/// Read/write access to `policy.json`.
pub struct PolicyStore {
    path: PathBuf,
    sentinels: TimeoutSentinels,
    default_timeout: VaultTimeout,
    // Serializes read-modify-write of the file
    write_lock: Mutex<()>,
}

impl PolicyStore {
    pub fn new(
        layout: &StorageLayout,
        sentinels: TimeoutSentinels,
        default_timeout: VaultTimeout,
    ) -> Self {
        Self {
            path: layout.file(POLICY_FILE),
            sentinels,
            default_timeout,
            write_lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, i64>> {
        match read_optional(&self.path).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn write_key(&self, key: &str, value: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value);
        let content = serde_json::to_vec_pretty(&entries)?;
        write_private(&self.path, &content).await?;
        debug!("Policy {} = {}", key, value);
        Ok(())
    }

    pub async fn read_policy(&self) -> Result<UnlockPolicy> {
        let entries = self.read_all().await?;
        let timeout = entries
            .get(VAULT_TIMEOUT_KEY)
            .map(|raw| self.sentinels.decode(*raw))
            .unwrap_or(self.default_timeout);
        let expires_at = entries.get(VAULT_EXPIRES_AT_KEY).copied().unwrap_or(0);
        Ok(UnlockPolicy {
            timeout,
            expires_at,
        })
    }

    pub async fn write_timeout(&self, timeout: VaultTimeout) -> Result<()> {
        self.write_key(VAULT_TIMEOUT_KEY, self.sentinels.encode(timeout))
            .await
    }

    pub async fn write_expires_at(&self, expires_at: i64) -> Result<()> {
        self.write_key(VAULT_EXPIRES_AT_KEY, expires_at).await
    }
}
