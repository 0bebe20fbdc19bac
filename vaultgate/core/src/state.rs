use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use vaultgate_keystore::{KeyAlias, KeyCustodian};

use crate::error::Result;
use crate::security::Argon2Params;
use crate::storage::{
    load_settings, Clock, Credentials, CredentialsStore, GateSettings, StorageLayout,
    VaultTimeout,
};
use crate::vault::{
    EncryptionKey, SecretStore, SessionGate, UserSecrets, VaultError, VaultResult, VaultStatus,
};

/// Everything one process session owns: settings, the Secret Store and the
/// gate for the provisioned account (absent until one exists).
pub struct AppState {
    pub layout: StorageLayout,
    pub settings: GateSettings,
    pub secrets: Arc<SecretStore>,
    credentials: CredentialsStore,
    custodian: Arc<dyn KeyCustodian>,
    gate: RwLock<Option<Arc<SessionGate>>>,
}

impl AppState {
    /// Load settings, restore a still-valid session and build the gate.
    pub async fn initialize(
        layout: StorageLayout,
        custodian: Arc<dyn KeyCustodian>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let settings = load_settings(&layout).await?;
        let secrets =
            Arc::new(SecretStore::open(&layout, &settings, custodian.as_ref(), clock).await?);
        let credentials = CredentialsStore::new(&layout);

        let gate = match credentials.load().await? {
            Some(record) => {
                if secrets.initialize().await? {
                    info!("Session restored for {}", record.identity);
                }
                Some(Arc::new(SessionGate::new(
                    record,
                    credentials.clone(),
                    secrets.clone(),
                    custodian.clone(),
                    settings.clone(),
                )))
            }
            None => {
                // Leftover secrets without an account are never restored
                secrets.clear().await?;
                None
            }
        };

        Ok(Self {
            layout,
            settings,
            secrets,
            credentials,
            custodian,
            gate: RwLock::new(gate),
        })
    }

    pub async fn gate(&self) -> VaultResult<Arc<SessionGate>> {
        self.gate.read().await.clone().ok_or(VaultError::NotProvisioned)
    }

    fn new_gate(&self, record: Credentials) -> Arc<SessionGate> {
        Arc::new(SessionGate::new(
            record,
            self.credentials.clone(),
            self.secrets.clone(),
            self.custodian.clone(),
            self.settings.clone(),
        ))
    }

    /// Set up (or replace) the account. The new gate starts unlocked; when
    /// `secrets` are given the session starts live too, as after a first
    /// login.
    pub async fn provision(
        &self,
        identity: &str,
        password: &str,
        params: Argon2Params,
        secrets: Option<UserSecrets>,
    ) -> VaultResult<EncryptionKey> {
        if self.gate.read().await.is_some() {
            warn!("Replacing existing account");
            self.logout().await?;
        }

        let (record, key) = SessionGate::provision(
            &self.credentials,
            identity,
            password,
            params,
            secrets.as_ref(),
        )
        .await?;
        if let Some(secrets) = secrets {
            self.secrets.save(secrets).await?;
        }
        let gate = SessionGate::provisioned(
            record,
            self.credentials.clone(),
            self.secrets.clone(),
            self.custodian.clone(),
            self.settings.clone(),
            key.clone(),
        );
        *self.gate.write().await = Some(Arc::new(gate));
        Ok(key)
    }

    pub async fn vault_status(&self) -> VaultResult<VaultStatus> {
        if self.gate.read().await.is_none() {
            return Ok(VaultStatus::NotSetup);
        }
        self.secrets.enforce_expiry().await?;
        if self.secrets.get_cached().await.is_some() {
            Ok(VaultStatus::Unlocked)
        } else {
            Ok(VaultStatus::Locked)
        }
    }

    /// End the session: forget the secrets and start over with a fresh,
    /// locked gate.
    pub async fn lock(&self) -> VaultResult<()> {
        let mut gate = self.gate.write().await;
        let current = gate.as_ref().ok_or(VaultError::NotProvisioned)?;
        current.teardown();
        let record = current.credentials().await;

        self.secrets.clear().await?;
        *gate = Some(self.new_gate(record));
        info!("Vault locked");
        Ok(())
    }

    /// Remove the account: secrets, credentials and the biometric key.
    pub async fn logout(&self) -> VaultResult<()> {
        let mut gate = self.gate.write().await;
        if let Some(current) = gate.take() {
            current.teardown();
        }

        self.secrets.clear().await?;
        self.credentials.delete().await?;

        let alias = KeyAlias::new(self.settings.biometric_key_alias.as_str());
        if let Err(e) = self.custodian.delete_key(&alias).await {
            warn!("Failed to delete biometric key on logout: {}", e);
        }
        info!("Logged out");
        Ok(())
    }

    pub async fn set_vault_timeout(&self, timeout: VaultTimeout) -> VaultResult<()> {
        self.secrets.set_timeout(timeout).await?;
        Ok(())
    }
}
