//! Durable storage under a single data directory.
//!
//! Every file is small JSON, written atomically (temp file, then rename)
//! with owner-only permissions on Unix.

mod clock;
mod config;
mod credentials;
mod datastore;
mod policy;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_settings, save_settings, GateSettings};
pub use credentials::{Credentials, CredentialsStore, ProtectedSecrets};
pub use datastore::EncryptedDataStore;
pub use policy::{is_expired, PolicyStore, TimeoutSentinels, UnlockPolicy, VaultTimeout};

/// Location of every durable file.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Use `root` as the data directory, creating it if needed.
    pub async fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).await?;
        }

        debug!("Data directory: {:?}", root);
        Ok(Self { root })
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Write `contents` to `path` atomically with restrictive permissions.
pub(crate) async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    // Write atomically (write to temp file, then rename)
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Read `path`, returning `None` if it does not exist.
pub(crate) async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete `path`. Deleting a missing file succeeds.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
