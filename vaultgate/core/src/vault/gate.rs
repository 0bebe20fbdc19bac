//! Session Gate: turns a password or a presence assertion into the vault
//! encryption key, and hands the recovered session secrets to the
//! [`SecretStore`].
//!
//! One attempt runs at a time. Inside an attempt nothing is mutated until
//! every fallible step (derivation, decryption) has succeeded. Once the gate
//! reaches `Unlocked` it stays there; later attempts get the outcome that was
//! already delivered and do nothing else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vaultgate_keystore::{Assertion, InitializationVector, KeyAlias, KeyCustodian};
use zeroize::{Zeroize, Zeroizing};

use super::auth::{AuthMethod, FailureReason, UnlockState};
use super::error::{VaultError, VaultResult};
use super::secrets::{SecretStore, UserSecrets};
use crate::error::VaultgateError;
use crate::security::{
    decrypt, derive_password_hash, encrypt, fingerprint, Argon2Params, CipherError, MasterKey,
};
use crate::storage::{Credentials, CredentialsStore, GateSettings, ProtectedSecrets};

const ENCRYPTION_KEY_LEN: usize = 32;

/// The vault encryption key as handed to the rest of the app (hex string).
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(Zeroizing<String>);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; ENCRYPTION_KEY_LEN]);
        rand::rng().fill_bytes(&mut *bytes);
        Self(Zeroizing::new(hex::encode(&*bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Safe to log or display.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.0.as_bytes())
    }

    fn from_utf8(bytes: Vec<u8>) -> VaultResult<Self> {
        String::from_utf8(bytes)
            .map(|s| Self(Zeroizing::new(s)))
            .map_err(|e| {
                e.into_bytes().zeroize();
                VaultError::StorageUnavailable("decrypted key is not valid text".into())
            })
    }

    fn to_bytes(&self) -> VaultResult<Zeroizing<Vec<u8>>> {
        let bytes = Zeroizing::new(
            hex::decode(self.0.as_str())
                .map_err(|_| VaultError::StorageUnavailable("encryption key is not hex".into()))?,
        );
        if bytes.len() != ENCRYPTION_KEY_LEN {
            return Err(VaultError::StorageUnavailable(format!(
                "encryption key must be {} bytes",
                ENCRYPTION_KEY_LEN
            )));
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EncryptionKey")
            .field(&self.fingerprint())
            .finish()
    }
}

/// Result of a successful unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOutcome {
    pub method: AuthMethod,
    pub encryption_key: EncryptionKey,
}

struct Recovered {
    key: EncryptionKey,
    secrets: Option<UserSecrets>,
}

/// Holds the gate in `Unlocking` for the life of one attempt. If the attempt
/// future is dropped before it settles, the gate falls back to `Locked`.
struct AttemptGuard<'a> {
    state: &'a watch::Sender<UnlockState>,
    settled: bool,
}

impl<'a> AttemptGuard<'a> {
    fn begin(state: &'a watch::Sender<UnlockState>) -> Self {
        state.send_replace(UnlockState::Unlocking);
        Self {
            state,
            settled: false,
        }
    }

    fn settle(mut self, next: UnlockState) {
        self.settled = true;
        self.state.send_replace(next);
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Unlock attempt abandoned");
            self.state.send_replace(UnlockState::Locked);
        }
    }
}

async fn derive_master_key(
    password: Zeroizing<String>,
    identity: String,
    params: Argon2Params,
) -> VaultResult<MasterKey> {
    let key = tokio::task::spawn_blocking(move || {
        derive_password_hash(&password, &identity, &params)
    })
    .await
    .map_err(VaultgateError::from)??;
    Ok(key)
}

fn open_vault_key(credentials: &Credentials, master: &MasterKey) -> VaultResult<EncryptionKey> {
    match decrypt(&credentials.encrypted_encryption_key, master.as_bytes()) {
        Ok(plaintext) => EncryptionKey::from_utf8(plaintext),
        Err(CipherError::AuthenticationFailure) => Err(VaultError::InvalidCredentials),
        Err(e) => Err(VaultError::StorageUnavailable(e.to_string())),
    }
}

fn open_protected_secrets(
    credentials: &Credentials,
    key: &EncryptionKey,
) -> VaultResult<Option<UserSecrets>> {
    let Some(protected) = &credentials.protected_secrets else {
        return Ok(None);
    };
    let key_bytes = key.to_bytes()?;
    let open = |ciphertext: &[u8], name: &str| {
        decrypt(ciphertext, &key_bytes)
            .map(Zeroizing::new)
            .map_err(|e| VaultError::StorageUnavailable(format!("{}: {}", name, e)))
    };
    let private_key = open(&protected.private_key, "protected private key")?;
    let secret_key = open(&protected.secret_key, "protected secret key")?;
    Ok(Some(UserSecrets::from_bytes(&private_key, &secret_key)))
}

fn seal_protected_secrets(
    secrets: &UserSecrets,
    key: &EncryptionKey,
) -> VaultResult<ProtectedSecrets> {
    if secrets.is_locked() {
        return Err(VaultError::StorageUnavailable(
            "cannot protect an incomplete key pair".into(),
        ));
    }
    let key_bytes = key.to_bytes()?;
    let seal = |hex_value: &str| -> VaultResult<Vec<u8>> {
        let plaintext = Zeroizing::new(
            hex::decode(hex_value)
                .map_err(|e| VaultError::StorageUnavailable(format!("invalid key pair: {}", e)))?,
        );
        encrypt(&plaintext, &key_bytes).map_err(|e| VaultError::StorageUnavailable(e.to_string()))
    };
    Ok(ProtectedSecrets {
        private_key: seal(secrets.private_key())?,
        secret_key: seal(secrets.secret_key())?,
    })
}

pub struct SessionGate {
    credentials: RwLock<Credentials>,
    store: CredentialsStore,
    secrets: Arc<SecretStore>,
    custodian: Arc<dyn KeyCustodian>,
    settings: GateSettings,
    state: watch::Sender<UnlockState>,
    // Single-attempt lock; holds the outcome once one has been delivered
    attempt: Mutex<Option<UnlockOutcome>>,
    torn_down: AtomicBool,
}

impl SessionGate {
    pub fn new(
        credentials: Credentials,
        store: CredentialsStore,
        secrets: Arc<SecretStore>,
        custodian: Arc<dyn KeyCustodian>,
        settings: GateSettings,
    ) -> Self {
        Self::build(credentials, store, secrets, custodian, settings, None)
    }

    /// Gate for an account whose password was just set: it starts
    /// `Unlocked` with `encryption_key` as the delivered outcome.
    pub fn provisioned(
        credentials: Credentials,
        store: CredentialsStore,
        secrets: Arc<SecretStore>,
        custodian: Arc<dyn KeyCustodian>,
        settings: GateSettings,
        encryption_key: EncryptionKey,
    ) -> Self {
        let outcome = UnlockOutcome {
            method: AuthMethod::Password,
            encryption_key,
        };
        Self::build(credentials, store, secrets, custodian, settings, Some(outcome))
    }

    fn build(
        credentials: Credentials,
        store: CredentialsStore,
        secrets: Arc<SecretStore>,
        custodian: Arc<dyn KeyCustodian>,
        settings: GateSettings,
        delivered: Option<UnlockOutcome>,
    ) -> Self {
        let initial = if delivered.is_some() {
            UnlockState::Unlocked
        } else {
            UnlockState::Locked
        };
        let (state, _) = watch::channel(initial);
        Self {
            credentials: RwLock::new(credentials),
            store,
            secrets,
            custodian,
            settings,
            state,
            attempt: Mutex::new(delivered),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Create and persist the credentials record for a new account.
    ///
    /// Generates a fresh vault encryption key, encrypts it under the
    /// password-derived master key, and optionally seals the user's key pair
    /// under the vault key so later unlocks can restore it.
    pub async fn provision(
        store: &CredentialsStore,
        identity: &str,
        password: &str,
        params: Argon2Params,
        secrets: Option<&UserSecrets>,
    ) -> VaultResult<(Credentials, EncryptionKey)> {
        let key = EncryptionKey::generate();
        let master = derive_master_key(
            Zeroizing::new(password.to_owned()),
            identity.to_owned(),
            params,
        )
        .await?;

        let encrypted_encryption_key = encrypt(key.as_str().as_bytes(), master.as_bytes())
            .map_err(|e| VaultError::StorageUnavailable(e.to_string()))?;
        let protected_secrets = secrets
            .map(|s| seal_protected_secrets(s, &key))
            .transpose()?;

        let credentials = Credentials {
            identity: identity.to_owned(),
            argon2: params,
            encrypted_encryption_key,
            biometric_encryption_key: None,
            biometric_encryption_key_iv: None,
            biometric_enabled: false,
            protected_secrets,
        };
        store.save(&credentials).await?;
        info!(
            "Provisioned vault for {} (key {})",
            identity,
            key.fingerprint()
        );
        Ok((credentials, key))
    }

    pub fn state(&self) -> UnlockState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnlockState> {
        self.state.subscribe()
    }

    pub async fn credentials(&self) -> Credentials {
        self.credentials.read().await.clone()
    }

    fn biometric_alias(&self) -> KeyAlias {
        KeyAlias::new(self.settings.biometric_key_alias.as_str())
    }

    fn ensure_live(&self) -> VaultResult<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(VaultError::Cancelled);
        }
        Ok(())
    }

    /// Whether the user has to authenticate before secrets are available.
    pub async fn needs_unlock(&self) -> VaultResult<bool> {
        self.secrets.enforce_expiry().await?;
        Ok(self.secrets.get_cached().await.is_none())
    }

    pub async fn unlock_with_password(&self, password: &str) -> VaultResult<Option<UnlockOutcome>> {
        let password = Zeroizing::new(password.to_owned());
        let span = info_span!("unlock", attempt = %Uuid::new_v4(), method = %AuthMethod::Password);

        async move {
            let mut delivered = self.attempt.lock().await;
            if let Some(outcome) = delivered.as_ref() {
                debug!("Gate already unlocked, ignoring attempt");
                return Ok(Some(outcome.clone()));
            }
            self.ensure_live()?;

            let credentials = self.credentials.read().await.clone();
            let attempt = AttemptGuard::begin(&self.state);
            let result = self.recover_with_password(password, &credentials).await;
            self.finish(&mut delivered, attempt, AuthMethod::Password, result)
                .await
        }
        .instrument(span)
        .await
    }

    /// Run the biometric path. `Ok(None)` means the presence check did not
    /// pass (rejected or cancelled) and the gate is back to `Locked`.
    pub async fn unlock_with_biometric(&self) -> VaultResult<Option<UnlockOutcome>> {
        let span =
            info_span!("unlock", attempt = %Uuid::new_v4(), method = %AuthMethod::Biometric);

        async move {
            let mut delivered = self.attempt.lock().await;
            if let Some(outcome) = delivered.as_ref() {
                debug!("Gate already unlocked, ignoring attempt");
                return Ok(Some(outcome.clone()));
            }
            self.ensure_live()?;

            let credentials = self.credentials.read().await.clone();
            let attempt = AttemptGuard::begin(&self.state);
            let result = self.recover_with_biometric(&credentials).await;
            if matches!(result, Err(VaultError::KeyInvalidated)) {
                self.invalidate_biometric().await;
            }
            self.finish(&mut delivered, attempt, AuthMethod::Biometric, result)
                .await
        }
        .instrument(span)
        .await
    }

    /// Start the biometric path if it is enabled and allowed to trigger by
    /// itself. Returns `Ok(None)` when it does not apply.
    pub async fn auto_unlock(&self) -> VaultResult<Option<UnlockOutcome>> {
        if !self.settings.biometric_auto_trigger {
            return Ok(None);
        }
        if self.credentials.read().await.biometric_material().is_none() {
            return Ok(None);
        }
        self.unlock_with_biometric().await
    }

    async fn recover_with_password(
        &self,
        password: Zeroizing<String>,
        credentials: &Credentials,
    ) -> VaultResult<Option<Recovered>> {
        let master =
            derive_master_key(password, credentials.identity.clone(), credentials.argon2).await?;
        let key = open_vault_key(credentials, &master)?;
        let secrets = open_protected_secrets(credentials, &key)?;
        Ok(Some(Recovered { key, secrets }))
    }

    async fn recover_with_biometric(
        &self,
        credentials: &Credentials,
    ) -> VaultResult<Option<Recovered>> {
        let (blob, raw_iv) = credentials.biometric_material().ok_or_else(|| {
            VaultError::BiometricUnavailable("biometric unlock is not enabled".into())
        })?;
        let iv = InitializationVector::from_slice(raw_iv).map_err(VaultError::from_keystore)?;
        let alias = self.biometric_alias();

        let handle = self
            .custodian
            .build_decrypt_operation(&alias, &iv)
            .await
            .map_err(VaultError::from_keystore)?;

        let operation = match self
            .custodian
            .await_assertion(handle)
            .await
            .map_err(VaultError::from_keystore)?
        {
            Assertion::Succeeded(operation) => operation,
            Assertion::Failed => {
                debug!("Presence not asserted");
                return Ok(None);
            }
        };

        let mut plaintext = operation.decrypt(blob).map_err(VaultError::from_keystore)?;
        let key = EncryptionKey::from_utf8(std::mem::take(&mut *plaintext))?;
        let secrets = open_protected_secrets(credentials, &key)?;
        Ok(Some(Recovered { key, secrets }))
    }

    async fn finish(
        &self,
        delivered: &mut Option<UnlockOutcome>,
        attempt: AttemptGuard<'_>,
        method: AuthMethod,
        result: VaultResult<Option<Recovered>>,
    ) -> VaultResult<Option<UnlockOutcome>> {
        let recovered = match result {
            Ok(Some(recovered)) => recovered,
            Ok(None) => {
                attempt.settle(UnlockState::Locked);
                return Ok(None);
            }
            Err(VaultError::InvalidCredentials) => {
                info!("Invalid credentials");
                attempt.settle(UnlockState::Failed(FailureReason::InvalidCredentials));
                return Err(VaultError::InvalidCredentials);
            }
            Err(e) => {
                warn!("Unlock failed: {}", e);
                attempt.settle(UnlockState::Locked);
                return Err(e);
            }
        };

        if self.torn_down.load(Ordering::SeqCst) {
            info!("Gate torn down, discarding recovered key");
            attempt.settle(UnlockState::Locked);
            return Err(VaultError::Cancelled);
        }

        if let Some(secrets) = recovered.secrets {
            // Teardown is checked again under the store's write lock
            let committed = self
                .secrets
                .save_unless(secrets, || self.torn_down.load(Ordering::SeqCst))
                .await;
            match committed {
                Ok(true) => {}
                Ok(false) => {
                    info!("Gate torn down during commit, discarding recovered key");
                    attempt.settle(UnlockState::Locked);
                    return Err(VaultError::Cancelled);
                }
                Err(e) => {
                    error!("Failed to store session secrets: {}", e);
                    attempt.settle(UnlockState::Locked);
                    return Err(e.into());
                }
            }
        }

        let outcome = UnlockOutcome {
            method,
            encryption_key: recovered.key,
        };
        *delivered = Some(outcome.clone());
        attempt.settle(UnlockState::Unlocked);
        info!(
            "Vault unlocked via {} (key {})",
            method,
            outcome.encryption_key.fingerprint()
        );
        Ok(Some(outcome))
    }

    /// The platform key is gone for good: turn the biometric path off and
    /// remove the dead key. Failures here are logged, never surfaced; the
    /// caller already reports `KeyInvalidated`.
    async fn invalidate_biometric(&self) {
        warn!("Biometric key invalidated, disabling biometric unlock");
        if let Err(e) = self.disable_biometric().await {
            error!("Failed to disable biometric unlock: {}", e);
        }
    }

    /// Seal the vault key under a fresh platform key and turn on the
    /// biometric path.
    ///
    /// Only the key this gate delivered on unlock is accepted; a locked gate
    /// refuses with `InvalidCredentials`.
    pub async fn enable_biometric(&self, encryption_key: &EncryptionKey) -> VaultResult<()> {
        let delivered = self.attempt.lock().await;
        match delivered.as_ref() {
            Some(outcome) if &outcome.encryption_key == encryption_key => {}
            Some(_) => {
                warn!("Refusing to enroll a key this gate did not unlock");
                return Err(VaultError::InvalidCredentials);
            }
            None => {
                warn!("Refusing to enroll biometric unlock while locked");
                return Err(VaultError::InvalidCredentials);
            }
        }

        let alias = self.biometric_alias();
        self.custodian
            .create_key(&alias)
            .await
            .map_err(VaultError::from_keystore)?;
        let handle = self
            .custodian
            .build_encrypt_operation(&alias)
            .await
            .map_err(VaultError::from_keystore)?;

        let operation = match self
            .custodian
            .await_encrypt_assertion(handle)
            .await
            .map_err(VaultError::from_keystore)?
        {
            Assertion::Succeeded(operation) => operation,
            Assertion::Failed => {
                if let Err(e) = self.custodian.delete_key(&alias).await {
                    warn!("Failed to remove unused biometric key: {}", e);
                }
                return Err(VaultError::BiometricFailed(
                    "presence was not confirmed".into(),
                ));
            }
        };
        let sealed = operation
            .encrypt(encryption_key.as_str().as_bytes())
            .map_err(VaultError::from_keystore)?;

        let mut credentials = self.credentials.write().await;
        let mut updated = credentials.clone();
        updated.enable_biometric(sealed.ciphertext, &sealed.iv);
        self.store.save(&updated).await?;
        *credentials = updated;
        info!("Biometric unlock enabled");
        Ok(())
    }

    /// Turn off the biometric path and delete its platform key.
    pub async fn disable_biometric(&self) -> VaultResult<()> {
        let mut credentials = self.credentials.write().await;
        let mut updated = credentials.clone();
        updated.disable_biometric();
        self.store.save(&updated).await?;
        *credentials = updated;

        if let Err(e) = self.custodian.delete_key(&self.biometric_alias()).await {
            warn!("Failed to delete biometric key: {}", e);
        }
        info!("Biometric unlock disabled");
        Ok(())
    }

    /// Re-encrypt the vault key under a new password and parameters.
    ///
    /// The vault key itself does not change, so the biometric blob and any
    /// protected secrets stay valid.
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
        params: Argon2Params,
    ) -> VaultResult<()> {
        let _attempt = self.attempt.lock().await;
        self.ensure_live()?;

        let credentials = self.credentials.read().await.clone();
        let master = derive_master_key(
            Zeroizing::new(old_password.to_owned()),
            credentials.identity.clone(),
            credentials.argon2,
        )
        .await?;
        let key = open_vault_key(&credentials, &master)?;

        let new_master = derive_master_key(
            Zeroizing::new(new_password.to_owned()),
            credentials.identity.clone(),
            params,
        )
        .await?;
        let encrypted = encrypt(key.as_str().as_bytes(), new_master.as_bytes())
            .map_err(|e| VaultError::StorageUnavailable(e.to_string()))?;

        let mut current = self.credentials.write().await;
        let mut updated = current.clone();
        updated.argon2 = params;
        updated.encrypted_encryption_key = encrypted;
        self.store.save(&updated).await?;
        *current = updated;
        info!("Password changed");
        Ok(())
    }

    /// Stop the gate. Any attempt still in flight will not commit.
    pub fn teardown(&self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            info!("Session gate torn down");
        }
        self.state.send_if_modified(|state| {
            if *state == UnlockState::Unlocked {
                return false;
            }
            *state = UnlockState::Locked;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::kdf::cheap_params;
    use crate::storage::{ManualClock, StorageLayout};
    use crate::vault::error::UserFeedback;
    use vaultgate_keystore::{
        ManualVerifier, PresenceResult, PresenceVerifier, PromptPurpose, ScriptedVerifier,
        SoftwareCustodian,
    };

    const NOW: i64 = 1_700_000_000_000;

    struct Harness {
        _dir: tempfile::TempDir,
        gate: Arc<SessionGate>,
        custodian: Arc<SoftwareCustodian>,
        secrets: Arc<SecretStore>,
        store: CredentialsStore,
        key: EncryptionKey,
        pair: UserSecrets,
    }

    impl Harness {
        fn alias(&self) -> KeyAlias {
            self.gate.biometric_alias()
        }

        /// Swap in a fresh locked gate over the persisted record, the way
        /// `AppState::lock` does.
        async fn relock(&mut self) {
            self.gate.teardown();
            self.secrets.clear().await.unwrap();
            let record = self.store.load().await.unwrap().unwrap();
            self.gate = Arc::new(SessionGate::new(
                record,
                self.store.clone(),
                self.secrets.clone(),
                self.custodian.clone(),
                GateSettings::default(),
            ));
        }

        /// Unlock with the password, enroll biometric unlock, relock.
        async fn enroll(&mut self) {
            self.gate.unlock_with_password("correct").await.unwrap();
            self.gate.enable_biometric(&self.key).await.unwrap();
            self.relock().await;
        }
    }

    async fn harness(verifier: Arc<dyn PresenceVerifier>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path()).await.unwrap();
        let settings = GateSettings::default();
        let custodian = Arc::new(SoftwareCustodian::new(verifier));
        let secrets = Arc::new(
            SecretStore::open(
                &layout,
                &settings,
                custodian.as_ref(),
                Arc::new(ManualClock::new(NOW)),
            )
            .await
            .unwrap(),
        );
        let store = CredentialsStore::new(&layout);
        let pair = UserSecrets::from_bytes(&[0x11; 32], &[0x22; 32]);

        let (credentials, key) =
            SessionGate::provision(&store, "a@b.com", "correct", cheap_params(), Some(&pair))
                .await
                .unwrap();
        let gate = Arc::new(SessionGate::new(
            credentials,
            store.clone(),
            secrets.clone(),
            custodian.clone(),
            settings,
        ));

        Harness {
            _dir: dir,
            gate,
            custodian,
            secrets,
            store,
            key,
            pair,
        }
    }

    fn verified() -> Arc<ScriptedVerifier> {
        Arc::new(ScriptedVerifier::always(PresenceResult::Verified))
    }

    #[tokio::test]
    async fn test_password_unlock_recovers_key_and_secrets() {
        let h = harness(verified()).await;
        assert!(h.gate.needs_unlock().await.unwrap());

        let outcome = h.gate.unlock_with_password("correct").await.unwrap().unwrap();

        assert_eq!(outcome.method, AuthMethod::Password);
        assert_eq!(outcome.encryption_key, h.key);
        assert_eq!(h.gate.state(), UnlockState::Unlocked);
        assert_eq!(h.secrets.get_cached().await.as_deref(), Some(&h.pair));
        assert!(!h.gate.needs_unlock().await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_password_fails_then_retry_succeeds() {
        let h = harness(verified()).await;

        let err = h.gate.unlock_with_password("wrong").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidCredentials));
        assert_eq!(err.user_feedback(), UserFeedback::Message);
        assert_eq!(
            h.gate.state(),
            UnlockState::Failed(FailureReason::InvalidCredentials)
        );
        assert!(h.secrets.get_cached().await.is_none());

        assert!(h.gate.unlock_with_password("correct").await.unwrap().is_some());
        assert_eq!(h.gate.state(), UnlockState::Unlocked);
    }

    #[tokio::test]
    async fn test_unlocked_is_terminal() {
        let h = harness(verified()).await;
        let first = h.gate.unlock_with_password("correct").await.unwrap();

        // A late attempt gets the delivered outcome and changes nothing.
        h.secrets.lock().await;
        let second = h.gate.unlock_with_password("wrong").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.gate.state(), UnlockState::Unlocked);
        assert!(h.secrets.get_cached().await.is_none());
    }

    #[tokio::test]
    async fn test_state_changes_are_observable() {
        let h = harness(verified()).await;
        let mut rx = h.gate.subscribe();
        assert_eq!(*rx.borrow_and_update(), UnlockState::Locked);

        h.gate.unlock_with_password("correct").await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), UnlockState::Unlocked);
    }

    #[tokio::test]
    async fn test_biometric_unlock_after_enrollment() {
        let verifier = verified();
        let mut h = harness(verifier.clone()).await;

        h.enroll().await;
        let persisted = h.store.load().await.unwrap().unwrap();
        assert!(persisted.biometric_enabled);
        assert!(persisted.biometric_material().is_some());

        let outcome = h.gate.unlock_with_biometric().await.unwrap().unwrap();
        assert_eq!(outcome.method, AuthMethod::Biometric);
        assert_eq!(outcome.encryption_key, h.key);
        assert_eq!(h.secrets.get_cached().await.as_deref(), Some(&h.pair));

        let purposes: Vec<_> = verifier.prompts().into_iter().map(|p| p.purpose).collect();
        assert_eq!(purposes, vec![PromptPurpose::Enroll, PromptPurpose::Unlock]);
    }

    #[tokio::test]
    async fn test_biometric_rejection_returns_to_locked_quietly() {
        let verifier = Arc::new(ScriptedVerifier::new(
            vec![PresenceResult::Verified],
            PresenceResult::Rejected,
        ));
        let mut h = harness(verifier).await;
        h.enroll().await;

        assert!(h.gate.unlock_with_biometric().await.unwrap().is_none());
        assert_eq!(h.gate.state(), UnlockState::Locked);
        assert!(h.secrets.get_cached().await.is_none());

        // The password path is still open.
        assert!(h.gate.unlock_with_password("correct").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_biometric_not_enabled_is_unavailable() {
        let h = harness(verified()).await;

        let err = h.gate.unlock_with_biometric().await.unwrap_err();
        assert!(matches!(err, VaultError::BiometricUnavailable(_)));
        assert_eq!(err.user_feedback(), UserFeedback::Silent);
        assert_eq!(h.gate.state(), UnlockState::Locked);
    }

    #[tokio::test]
    async fn test_invalidated_key_disables_biometric() {
        let mut h = harness(verified()).await;
        h.enroll().await;
        h.custodian.invalidate(&h.alias());

        let err = h.gate.unlock_with_biometric().await.unwrap_err();
        assert!(matches!(err, VaultError::KeyInvalidated));
        assert_eq!(h.gate.state(), UnlockState::Locked);

        assert!(!h.gate.credentials().await.biometric_enabled);
        let persisted = h.store.load().await.unwrap().unwrap();
        assert!(!persisted.biometric_enabled);
        assert!(persisted.biometric_encryption_key.is_none());
        assert!(!h.custodian.backend().contains(&h.alias()));

        // Auto-unlock no longer fires.
        assert!(h.gate.auto_unlock().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_unlock_only_when_enabled() {
        let verifier = verified();
        let mut h = harness(verifier.clone()).await;

        assert!(h.gate.auto_unlock().await.unwrap().is_none());
        assert!(verifier.prompts().is_empty());

        h.enroll().await;
        let outcome = h.gate.auto_unlock().await.unwrap().unwrap();
        assert_eq!(outcome.method, AuthMethod::Biometric);
    }

    #[tokio::test]
    async fn test_enable_biometric_rejects_foreign_key_once_unlocked() {
        let h = harness(verified()).await;
        h.gate.unlock_with_password("correct").await.unwrap();

        let err = h
            .gate
            .enable_biometric(&EncryptionKey::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_enable_biometric_refused_while_locked() {
        let verifier = verified();
        let h = harness(verifier.clone()).await;

        for key in [EncryptionKey::generate(), h.key.clone()] {
            let err = h.gate.enable_biometric(&key).await.unwrap_err();
            assert!(matches!(err, VaultError::InvalidCredentials));
        }
        assert!(verifier.prompts().is_empty());
        assert!(!h.custodian.backend().contains(&h.alias()));
        assert!(h.store.load().await.unwrap().unwrap().biometric_material().is_none());

        let err = h.gate.unlock_with_biometric().await.unwrap_err();
        assert!(matches!(err, VaultError::BiometricUnavailable(_)));
        assert_eq!(h.gate.state(), UnlockState::Locked);
    }

    #[tokio::test]
    async fn test_provisioned_gate_enrolls_only_its_key() {
        let h = harness(verified()).await;
        let record = h.store.load().await.unwrap().unwrap();
        let gate = SessionGate::provisioned(
            record,
            h.store.clone(),
            h.secrets.clone(),
            h.custodian.clone(),
            GateSettings::default(),
            h.key.clone(),
        );
        assert_eq!(gate.state(), UnlockState::Unlocked);

        assert!(matches!(
            gate.enable_biometric(&EncryptionKey::generate()).await,
            Err(VaultError::InvalidCredentials)
        ));
        gate.enable_biometric(&h.key).await.unwrap();
        assert!(gate.credentials().await.biometric_material().is_some());
    }

    #[tokio::test]
    async fn test_racing_attempts_act_once() {
        let verifier = verified();
        let mut h = harness(verifier.clone()).await;
        h.enroll().await;

        let (a, b, c) = tokio::join!(
            h.gate.unlock_with_biometric(),
            h.gate.unlock_with_biometric(),
            h.gate.unlock_with_password("correct"),
        );
        let (a, b, c) = (a.unwrap().unwrap(), b.unwrap().unwrap(), c.unwrap().unwrap());

        // The first attempt to take the lock wins; the rest see its outcome.
        assert_eq!(a, b);
        assert_eq!(b, c);
        let unlock_prompts = verifier
            .prompts()
            .into_iter()
            .filter(|p| p.purpose == PromptPurpose::Unlock)
            .count();
        assert_eq!(unlock_prompts, 1);
        assert_eq!(h.gate.state(), UnlockState::Unlocked);
    }

    #[tokio::test]
    async fn test_teardown_prevents_commit() {
        let (verifier, mut prompts) = ManualVerifier::new();
        let mut h = harness(Arc::new(verifier)).await;

        h.gate.unlock_with_password("correct").await.unwrap();
        let (enabled, _) = tokio::join!(h.gate.enable_biometric(&h.key), async {
            prompts.recv().await.unwrap().respond(PresenceResult::Verified)
        });
        enabled.unwrap();
        h.relock().await;

        let gate = h.gate.clone();
        let attempt = tokio::spawn(async move { gate.unlock_with_biometric().await });

        let pending = prompts.recv().await.unwrap();
        assert_eq!(h.gate.state(), UnlockState::Unlocking);
        h.gate.teardown();
        pending.respond(PresenceResult::Verified);

        assert!(matches!(
            attempt.await.unwrap(),
            Err(VaultError::Cancelled)
        ));
        assert_eq!(h.gate.state(), UnlockState::Locked);
        assert!(h.secrets.get_cached().await.is_none());
        assert!(matches!(
            h.gate.unlock_with_password("correct").await,
            Err(VaultError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_teardown_while_commit_waits_discards_it() {
        let h = harness(verified()).await;
        let writes = h.secrets.hold_writes().await;

        let gate = h.gate.clone();
        let attempt = tokio::spawn(async move { gate.unlock_with_password("correct").await });
        // Let derivation finish so the attempt is parked on the store.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        h.gate.teardown();
        drop(writes);

        assert!(matches!(
            attempt.await.unwrap(),
            Err(VaultError::Cancelled)
        ));
        assert_eq!(h.gate.state(), UnlockState::Locked);
        assert!(h.secrets.get_cached().await.is_none());
        assert!(h.secrets.load_durable_secrets().await.unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_abandoned_attempt_mutates_nothing() {
        let (verifier, mut prompts) = ManualVerifier::new();
        let mut h = harness(Arc::new(verifier)).await;

        h.gate.unlock_with_password("correct").await.unwrap();
        let (enabled, _) = tokio::join!(h.gate.enable_biometric(&h.key), async {
            prompts.recv().await.unwrap().respond(PresenceResult::Verified)
        });
        enabled.unwrap();
        h.relock().await;

        let gate = h.gate.clone();
        let attempt = tokio::spawn(async move { gate.unlock_with_biometric().await });
        let _pending = prompts.recv().await.unwrap();
        assert_eq!(h.gate.state(), UnlockState::Unlocking);

        attempt.abort();
        assert!(attempt.await.unwrap_err().is_cancelled());

        assert_eq!(h.gate.state(), UnlockState::Locked);
        assert!(h.secrets.get_cached().await.is_none());
        assert!(h.gate.unlock_with_password("correct").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_change_password() {
        let h = harness(verified()).await;

        assert!(matches!(
            h.gate
                .change_password("wrong", "new", cheap_params())
                .await,
            Err(VaultError::InvalidCredentials)
        ));

        let params = Argon2Params {
            iterations: 2,
            ..cheap_params()
        };
        h.gate
            .change_password("correct", "new", params)
            .await
            .unwrap();

        let persisted = h.store.load().await.unwrap().unwrap();
        assert_eq!(persisted.argon2, params);

        assert!(matches!(
            h.gate.unlock_with_password("correct").await,
            Err(VaultError::InvalidCredentials)
        ));
        let outcome = h.gate.unlock_with_password("new").await.unwrap().unwrap();
        assert_eq!(outcome.encryption_key, h.key);
    }

    #[tokio::test]
    async fn test_disable_biometric_removes_key() {
        let mut h = harness(verified()).await;
        h.enroll().await;
        assert!(h.custodian.backend().contains(&h.alias()));

        h.gate.disable_biometric().await.unwrap();
        assert!(!h.custodian.backend().contains(&h.alias()));
        assert!(h.store.load().await.unwrap().unwrap().biometric_material().is_none());
    }

    #[test]
    fn test_encryption_key_debug_is_redacted() {
        let key = EncryptionKey::generate();
        assert_eq!(key.as_str().len(), 64);
        assert!(!format!("{:?}", key).contains(key.as_str()));
    }
}
