//! The per-account credentials record.
//!
//! Holds everything needed to unlock without holding anything that unlocks
//! by itself: the KDF parameters, the password-encrypted vault key and
//! optionally a copy of the vault key sealed by a platform key.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vaultgate_keystore::InitializationVector;

use super::{read_optional, remove_if_exists, write_private, StorageLayout};
use crate::error::Result;
use crate::security::Argon2Params;

const CREDENTIALS_FILE: &str = "credentials.json";

/// Private/secret key pair sealed under the vault encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedSecrets {
    #[serde(with = "hex")]
    pub private_key: Vec<u8>,
    #[serde(with = "hex")]
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub identity: String,
    pub argon2: Argon2Params,
    #[serde(with = "hex")]
    pub encrypted_encryption_key: Vec<u8>,
    #[serde(default, with = "hex_option")]
    pub biometric_encryption_key: Option<Vec<u8>>,
    #[serde(default, with = "hex_option")]
    pub biometric_encryption_key_iv: Option<Vec<u8>>,
    #[serde(default)]
    pub biometric_enabled: bool,
    #[serde(default)]
    pub protected_secrets: Option<ProtectedSecrets>,
}

impl Credentials {
    /// The sealed vault key and its IV, if the biometric path is usable.
    ///
    /// An enabled flag without both pieces of material counts as disabled.
    pub fn biometric_material(&self) -> Option<(&[u8], &[u8])> {
        if !self.biometric_enabled {
            return None;
        }
        match (
            &self.biometric_encryption_key,
            &self.biometric_encryption_key_iv,
        ) {
            (Some(blob), Some(iv)) => Some((blob.as_slice(), iv.as_slice())),
            _ => None,
        }
    }

    pub fn enable_biometric(&mut self, ciphertext: Vec<u8>, iv: &InitializationVector) {
        self.biometric_encryption_key = Some(ciphertext);
        self.biometric_encryption_key_iv = Some(iv.as_bytes().to_vec());
        self.biometric_enabled = true;
    }

    pub fn disable_biometric(&mut self) {
        self.biometric_encryption_key = None;
        self.biometric_encryption_key_iv = None;
        self.biometric_enabled = false;
    }
}

mod hex_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// File-backed home of the single credentials record.
#[derive(Debug, Clone)]
pub struct CredentialsStore {
    path: PathBuf,
}

impl CredentialsStore {
    pub fn new(layout: &StorageLayout) -> Self {
        Self {
            path: layout.file(CREDENTIALS_FILE),
        }
    }

    /// Returns `None` when no account has been provisioned.
    pub async fn load(&self) -> Result<Option<Credentials>> {
        match read_optional(&self.path).await? {
            Some(content) => Ok(Some(serde_json::from_slice(&content)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, credentials: &Credentials) -> Result<()> {
        let content = serde_json::to_vec_pretty(credentials)?;
        write_private(&self.path, &content).await?;
        debug!("Saved credentials for {}", credentials.identity);
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        remove_if_exists(&self.path).await?;
        info!("Credentials deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Credentials {
        Credentials {
            identity: "a@b.com".into(),
            argon2: Argon2Params::default(),
            encrypted_encryption_key: vec![0xde, 0xad, 0xbe, 0xef],
            biometric_encryption_key: None,
            biometric_encryption_key_iv: None,
            biometric_enabled: false,
            protected_secrets: None,
        }
    }

    #[test]
    fn test_blobs_serialize_as_hex() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["encrypted_encryption_key"], "deadbeef");
        assert!(json["biometric_encryption_key"].is_null());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{
            "identity": "a@b.com",
            "argon2": {"memory": 19456, "iterations": 2, "parallelism": 1, "version": 19},
            "encrypted_encryption_key": "00ff"
        }"#;
        let credentials: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(credentials.encrypted_encryption_key, vec![0x00, 0xff]);
        assert!(!credentials.biometric_enabled);
        assert!(credentials.protected_secrets.is_none());
    }

    #[test]
    fn test_biometric_material_requires_flag_and_both_parts() {
        let mut credentials = sample();
        let iv = InitializationVector::from_bytes([9u8; 12]);
        assert!(credentials.biometric_material().is_none());

        credentials.enable_biometric(vec![1, 2, 3], &iv);
        let (blob, raw_iv) = credentials.biometric_material().unwrap();
        assert_eq!(blob, &[1, 2, 3]);
        assert_eq!(raw_iv, &[9u8; 12]);

        credentials.biometric_encryption_key_iv = None;
        assert!(credentials.biometric_material().is_none());

        credentials.disable_biometric();
        assert!(!credentials.biometric_enabled);
        assert!(credentials.biometric_encryption_key.is_none());
    }

    #[tokio::test]
    async fn test_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path()).await.unwrap();
        let store = CredentialsStore::new(&layout);

        assert!(store.load().await.unwrap().is_none());

        let mut credentials = sample();
        credentials.enable_biometric(vec![4, 5], &InitializationVector::from_bytes([1; 12]));
        store.save(&credentials).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(credentials));

        store.delete().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.delete().await.unwrap();
    }
}
