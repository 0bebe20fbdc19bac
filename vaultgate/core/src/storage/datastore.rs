//! Encrypted-at-rest field store backing the Secret Store.
//!
//! Each field is sealed separately (`nonce || ciphertext`, hex encoded)
//! under a platform storage key that does not depend on the password.
//! All fields live in one file, so a multi-field write is a single atomic
//! rename and readers never observe half of an update.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use vaultgate_keystore::PlatformKey;
use zeroize::Zeroizing;

use super::{read_optional, write_private, StorageLayout};
use crate::error::{Result, VaultgateError};
use crate::security::{decrypt, encrypt};

const DATASTORE_FILE: &str = "secrets.enc.json";

pub struct EncryptedDataStore {
    path: PathBuf,
    key: PlatformKey,
    write_lock: Mutex<()>,
}

impl EncryptedDataStore {
    pub fn new(layout: &StorageLayout, key: PlatformKey) -> Self {
        Self {
            path: layout.file(DATASTORE_FILE),
            key,
            write_lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match read_optional(&self.path).await? {
            Some(content) => Ok(serde_json::from_slice(&content)?),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let content = serde_json::to_vec_pretty(entries)?;
        write_private(&self.path, &content).await
    }

    /// Seal and persist every `(field, plaintext)` pair in one write.
    pub async fn write_encrypted(&self, fields: &[(&str, &[u8])]) -> Result<()> {
        let mut sealed = Vec::with_capacity(fields.len());
        for (field, plaintext) in fields {
            let ciphertext = encrypt(plaintext, self.key.as_bytes())
                .map_err(|e| VaultgateError::Encryption(e.to_string()))?;
            sealed.push((field.to_string(), hex::encode(ciphertext)));
        }

        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.extend(sealed);
        self.write_all(&entries).await?;
        debug!("Wrote {} encrypted field(s)", fields.len());
        Ok(())
    }

    /// Read and open one field. `None` if the field was never written.
    pub async fn read_encrypted(&self, field: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let entries = self.read_all().await?;
        let Some(encoded) = entries.get(field) else {
            return Ok(None);
        };

        let ciphertext = hex::decode(encoded)
            .map_err(|e| VaultgateError::Storage(format!("Corrupt field {}: {}", field, e)))?;
        let plaintext = decrypt(&ciphertext, self.key.as_bytes()).map_err(|e| {
            warn!("Field {} did not open under the storage key", field);
            VaultgateError::Encryption(e.to_string())
        })?;
        Ok(Some(Zeroizing::new(plaintext)))
    }

    /// Remove `fields` in one write. Missing fields are ignored.
    pub async fn delete_encrypted(&self, fields: &[&str]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        let before = entries.len();
        for field in fields {
            entries.remove(*field);
        }
        if entries.len() != before {
            self.write_all(&entries).await?;
        }
        Ok(())
    }
}
