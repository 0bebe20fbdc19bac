//! Local vault unlock and ephemeral secret custody.
//!
//! - [`security`]: Argon2id password hashing and AES-256-GCM
//! - [`storage`]: durable JSON files under one data directory
//! - [`vault`]: the Session Gate and the Secret Store
//! - [`state`]: the per-process owner of all of the above

pub mod error;
pub mod security;
pub mod state;
pub mod storage;
pub mod vault;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use error::{Result, VaultgateError};
pub use state::AppState;
pub use vault::{
    AuthMethod, EncryptionKey, SecretStore, SessionGate, UnlockOutcome, UnlockState, UserSecrets,
    VaultError, VaultStatus,
};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Logs go to stderr.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultgate_core=debug,vaultgate_keystore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
