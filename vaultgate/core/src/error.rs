use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultgateError {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid secrets: {0}")]
    InvalidSecrets(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Keystore error: {0}")]
    Keystore(#[from] vaultgate_keystore::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl serde::Serialize for VaultgateError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultgateError>;
