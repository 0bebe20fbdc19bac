//! Secret Store: session-scoped custody of the user's key pair.
//!
//! The pair lives in three places with different lifetimes:
//! - an in-memory cache, the only thing consulted for "is the session live"
//! - encrypted-at-rest blobs, so a timed session survives a restart
//! - the unlock policy, which decides when both stop counting
//!
//! The cache is a single `Option<Arc<UserSecrets>>` replaced wholesale, so a
//! reader sees either the old pair or the new pair, never a mix.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vaultgate_keystore::{KeyAlias, KeyCustodian};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultgateError};
use crate::storage::{
    is_expired, Clock, EncryptedDataStore, GateSettings, PolicyStore, StorageLayout,
    UnlockPolicy, VaultTimeout,
};

pub const PRIVATE_KEY_FIELD: &str = "private_key";
pub const SECRET_KEY_FIELD: &str = "secret_key";

/// The user's private/secret key pair as hex strings.
///
/// Either both fields are set or the pair is empty (locked).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct UserSecrets {
    private_key: String,
    secret_key: String,
}

impl UserSecrets {
    pub fn new(private_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn from_bytes(private_key: &[u8], secret_key: &[u8]) -> Self {
        Self::new(hex::encode(private_key), hex::encode(secret_key))
    }

    /// The locked (empty) pair.
    pub fn empty() -> Self {
        Self::new(String::new(), String::new())
    }

    /// True unless both keys are present.
    pub fn is_locked(&self) -> bool {
        self.private_key.trim().is_empty() || self.secret_key.trim().is_empty()
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl std::fmt::Debug for UserSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSecrets")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

pub struct SecretStore {
    policy: PolicyStore,
    datastore: EncryptedDataStore,
    cache: RwLock<Option<Arc<UserSecrets>>>,
    clock: Arc<dyn Clock>,
    // Durable write + cache swap happen as one step relative to other writers
    write_lock: Mutex<()>,
}

impl SecretStore {
    pub fn new(policy: PolicyStore, datastore: EncryptedDataStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            datastore,
            cache: RwLock::new(None),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Build the store for `layout`, fetching (or creating) the platform
    /// storage key that protects the at-rest blobs.
    pub async fn open(
        layout: &StorageLayout,
        settings: &GateSettings,
        custodian: &dyn KeyCustodian,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let alias = KeyAlias::new(settings.storage_key_alias.as_str());
        let key = custodian.storage_key(&alias).await?;
        let policy = PolicyStore::new(layout, settings.timeout_sentinels, settings.default_timeout);
        let datastore = EncryptedDataStore::new(layout, key);
        Ok(Self::new(policy, datastore, clock))
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub async fn read_policy(&self) -> Result<UnlockPolicy> {
        self.policy.read_policy().await
    }

    pub fn is_expired(&self, policy: &UnlockPolicy) -> bool {
        is_expired(policy, self.now())
    }

    /// Durable pair, or the empty pair if absent or the policy has expired.
    ///
    /// Expiry is checked before anything is decrypted.
    pub async fn load_durable_secrets(&self) -> Result<UserSecrets> {
        let policy = self.read_policy().await?;
        if self.is_expired(&policy) {
            debug!("Durable secrets expired (timeout {})", policy.timeout);
            return Ok(UserSecrets::empty());
        }

        let private_key = self.datastore.read_encrypted(PRIVATE_KEY_FIELD).await?;
        let secret_key = self.datastore.read_encrypted(SECRET_KEY_FIELD).await?;
        match (private_key, secret_key) {
            (Some(private_key), Some(secret_key)) => {
                Ok(UserSecrets::from_bytes(&private_key, &secret_key))
            }
            _ => Ok(UserSecrets::empty()),
        }
    }

    /// Persist `secrets`, refresh the expiry for timed policies, then make
    /// them the live cache.
    ///
    /// If any durable step fails the cache keeps its previous value.
    pub async fn save(&self, secrets: UserSecrets) -> Result<()> {
        self.save_unless(secrets, || false).await.map(|_| ())
    }

    /// [`save`](Self::save), unless `cancelled` returns true once the write
    /// lock is held. A cancelled save writes nothing and returns `Ok(false)`.
    pub async fn save_unless<F>(&self, secrets: UserSecrets, cancelled: F) -> Result<bool>
    where
        F: FnOnce() -> bool,
    {
        if secrets.is_locked() {
            return Err(VaultgateError::InvalidSecrets(
                "refusing to save an incomplete key pair".into(),
            ));
        }
        let private_key = zeroize::Zeroizing::new(
            hex::decode(secrets.private_key())
                .map_err(|e| VaultgateError::InvalidSecrets(format!("private key: {}", e)))?,
        );
        let secret_key = zeroize::Zeroizing::new(
            hex::decode(secrets.secret_key())
                .map_err(|e| VaultgateError::InvalidSecrets(format!("secret key: {}", e)))?,
        );

        let _guard = self.write_lock.lock().await;
        if cancelled() {
            debug!("Save cancelled before commit");
            return Ok(false);
        }

        let policy = self.read_policy().await?;
        let expires_at = policy
            .timeout
            .as_millis()
            .map(|timeout_ms| self.now().saturating_add(timeout_ms));

        self.datastore
            .write_encrypted(&[
                (PRIVATE_KEY_FIELD, private_key.as_slice()),
                (SECRET_KEY_FIELD, secret_key.as_slice()),
            ])
            .await?;

        if let Some(expires_at) = expires_at {
            if let Err(e) = self.policy.write_expires_at(expires_at).await {
                // The new blobs must not outlive a stale expiry
                if let Err(cleanup) = self
                    .datastore
                    .delete_encrypted(&[PRIVATE_KEY_FIELD, SECRET_KEY_FIELD])
                    .await
                {
                    warn!("Failed to remove session secrets: {}", cleanup);
                }
                return Err(e);
            }
            debug!("Session expires at {}", expires_at);
        }

        *self.cache.write().await = Some(Arc::new(secrets));
        info!("Session secrets saved (timeout {})", policy.timeout);
        Ok(true)
    }

    /// Forget the pair everywhere: durable blobs and cache.
    ///
    /// The cache is emptied even when the durable delete fails.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let deleted = self
            .datastore
            .delete_encrypted(&[PRIVATE_KEY_FIELD, SECRET_KEY_FIELD])
            .await;
        *self.cache.write().await = None;
        deleted?;
        info!("Session secrets cleared");
        Ok(())
    }

    /// The live pair, or `None` while locked.
    pub async fn get_cached(&self) -> Option<Arc<UserSecrets>> {
        self.cache.read().await.clone()
    }

    /// Restore a still-valid session at process start.
    ///
    /// Returns whether a session was restored. Unreadable blobs (e.g. the
    /// storage key was replaced) leave the store locked.
    pub async fn initialize(&self) -> Result<bool> {
        let secrets = match self.load_durable_secrets().await {
            Ok(secrets) => secrets,
            Err(VaultgateError::Encryption(e)) => {
                warn!("Discarding unreadable session secrets: {}", e);
                UserSecrets::empty()
            }
            Err(e) => return Err(e),
        };

        let _guard = self.write_lock.lock().await;
        if secrets.is_locked() {
            *self.cache.write().await = None;
            return Ok(false);
        }
        *self.cache.write().await = Some(Arc::new(secrets));
        info!("Restored session secrets from storage");
        Ok(true)
    }

    /// Drop the in-memory pair only.
    pub async fn lock(&self) {
        let _guard = self.write_lock.lock().await;
        *self.cache.write().await = None;
        debug!("Session cache locked");
    }

    /// Evict the cache once a timed session has run past its expiry.
    ///
    /// INSTANT only governs what survives a restart; the in-memory pair of
    /// the current process stays until it is locked. Returns true when a
    /// live pair was evicted.
    pub async fn enforce_expiry(&self) -> Result<bool> {
        let policy = self.read_policy().await?;
        let timed = matches!(policy.timeout, VaultTimeout::Seconds(_));
        if !timed || !self.is_expired(&policy) {
            return Ok(false);
        }

        let _guard = self.write_lock.lock().await;
        let evicted = self.cache.write().await.take().is_some();
        if evicted {
            info!("Session expired (timeout {})", policy.timeout);
        }
        Ok(evicted)
    }

    #[cfg(test)]
    pub(crate) async fn hold_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Change the timeout. A live timed session gets a fresh expiry under
    /// the new value.
    pub async fn set_timeout(&self, timeout: VaultTimeout) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.policy.write_timeout(timeout).await?;

        if let Some(timeout_ms) = timeout.as_millis() {
            if self.cache.read().await.is_some() {
                self.policy
                    .write_expires_at(self.now().saturating_add(timeout_ms))
                    .await?;
            }
        }
        info!("Vault timeout set to {}", timeout);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ManualClock, TimeoutSentinels};
    use vaultgate_keystore::PlatformKey;

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: StorageLayout,
        clock: Arc<ManualClock>,
        store: SecretStore,
    }

    async fn fixture(default_timeout: VaultTimeout) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path()).await.unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let store = store_for(&layout, PlatformKey::from_slice(&[5u8; 32]).unwrap(), default_timeout, clock.clone());
        Fixture {
            _dir: dir,
            layout,
            clock,
            store,
        }
    }

    fn store_for(
        layout: &StorageLayout,
        key: PlatformKey,
        default_timeout: VaultTimeout,
        clock: Arc<ManualClock>,
    ) -> SecretStore {
        SecretStore::new(
            PolicyStore::new(layout, TimeoutSentinels::default(), default_timeout),
            EncryptedDataStore::new(layout, key),
            clock,
        )
    }

    fn pair(tag: u8) -> UserSecrets {
        UserSecrets::from_bytes(&[tag; 32], &[tag.wrapping_add(1); 32])
    }

    #[test]
    fn test_user_secrets_lock_state() {
        assert!(UserSecrets::empty().is_locked());
        assert!(UserSecrets::new("aa", "").is_locked());
        assert!(UserSecrets::new("  ", "bb").is_locked());
        assert!(!UserSecrets::new("aa", "bb").is_locked());
        assert!(!format!("{:?}", pair(1)).contains("0101"));
    }

    #[tokio::test]
    async fn test_save_sets_expiry_and_clear_removes_everything() {
        let f = fixture(VaultTimeout::Seconds(30)).await;

        f.store.save(pair(1)).await.unwrap();

        let policy = f.store.read_policy().await.unwrap();
        assert_eq!(policy.expires_at, NOW + 30_000);
        assert_eq!(f.store.get_cached().await.as_deref(), Some(&pair(1)));
        assert_eq!(f.store.load_durable_secrets().await.unwrap(), pair(1));

        f.store.clear().await.unwrap();
        assert!(f.store.get_cached().await.is_none());
        assert!(f.store.load_durable_secrets().await.unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_instant_timeout_is_never_restorable() {
        let f = fixture(VaultTimeout::Instant).await;

        f.store.save(pair(2)).await.unwrap();

        assert!(f.store.load_durable_secrets().await.unwrap().is_locked());
        assert_eq!(f.store.read_policy().await.unwrap().expires_at, 0);

        // The running process keeps its pair until locked.
        assert!(!f.store.enforce_expiry().await.unwrap());
        assert!(f.store.get_cached().await.is_some());
    }

    #[tokio::test]
    async fn test_never_timeout_survives_any_clock() {
        let f = fixture(VaultTimeout::Never).await;
        f.store.save(pair(3)).await.unwrap();

        f.clock.advance(365 * 24 * 3600 * 1000);
        assert!(!f.store.enforce_expiry().await.unwrap());
        assert_eq!(f.store.load_durable_secrets().await.unwrap(), pair(3));
    }

    #[tokio::test]
    async fn test_expiry_evicts_cache_and_hides_durable() {
        let f = fixture(VaultTimeout::Seconds(30)).await;
        f.store.save(pair(4)).await.unwrap();

        f.clock.advance(30_000);
        assert!(!f.store.enforce_expiry().await.unwrap());

        f.clock.advance(1);
        assert!(f.store.enforce_expiry().await.unwrap());
        assert!(f.store.get_cached().await.is_none());
        assert!(f.store.load_durable_secrets().await.unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_initialize_restores_live_session() {
        let f = fixture(VaultTimeout::Seconds(60)).await;
        f.store.save(pair(5)).await.unwrap();

        // A new process over the same data directory.
        let restarted = store_for(
            &f.layout,
            PlatformKey::from_slice(&[5u8; 32]).unwrap(),
            VaultTimeout::Seconds(60),
            f.clock.clone(),
        );
        assert!(restarted.initialize().await.unwrap());
        assert_eq!(restarted.get_cached().await.as_deref(), Some(&pair(5)));
    }

    #[tokio::test]
    async fn test_initialize_with_replaced_storage_key_stays_locked() {
        let f = fixture(VaultTimeout::Seconds(60)).await;
        f.store.save(pair(6)).await.unwrap();

        let restarted = store_for(
            &f.layout,
            PlatformKey::generate(),
            VaultTimeout::Seconds(60),
            f.clock.clone(),
        );
        assert!(!restarted.initialize().await.unwrap());
        assert!(restarted.get_cached().await.is_none());
    }

    #[tokio::test]
    async fn test_incomplete_pair_rejected_without_touching_cache() {
        let f = fixture(VaultTimeout::Seconds(30)).await;
        f.store.save(pair(7)).await.unwrap();

        assert!(matches!(
            f.store.save(UserSecrets::new("aa", "")).await,
            Err(VaultgateError::InvalidSecrets(_))
        ));
        assert!(matches!(
            f.store.save(UserSecrets::new("zz", "bb")).await,
            Err(VaultgateError::InvalidSecrets(_))
        ));
        assert_eq!(f.store.get_cached().await.as_deref(), Some(&pair(7)));
    }

    #[tokio::test]
    async fn test_failed_durable_write_leaves_cache_untouched() {
        let f = fixture(VaultTimeout::Seconds(30)).await;
        f.store.save(pair(8)).await.unwrap();

        // Make the datastore file unreadable JSON so the read-modify-write fails.
        std::fs::write(f.layout.file("secrets.enc.json"), b"not json").unwrap();

        assert!(f.store.save(pair(9)).await.is_err());
        assert_eq!(f.store.get_cached().await.as_deref(), Some(&pair(8)));
    }

    #[tokio::test]
    async fn test_unreadable_policy_writes_nothing() {
        let f = fixture(VaultTimeout::Seconds(30)).await;
        f.store.save(pair(12)).await.unwrap();

        std::fs::write(f.layout.file("policy.json"), b"not json").unwrap();
        assert!(f.store.save(pair(13)).await.is_err());

        let on_disk = f
            .store
            .datastore
            .read_encrypted(PRIVATE_KEY_FIELD)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(on_disk.as_slice(), &[12u8; 32]);
        assert_eq!(f.store.get_cached().await.as_deref(), Some(&pair(12)));
    }

    #[tokio::test]
    async fn test_failed_expiry_write_removes_new_blobs() {
        let f = fixture(VaultTimeout::Seconds(30)).await;
        f.store.save(pair(14)).await.unwrap();

        // The policy temp file cannot be created over a directory.
        std::fs::create_dir(f.layout.file("policy.tmp")).unwrap();
        assert!(f.store.save(pair(15)).await.is_err());

        assert!(f
            .store
            .datastore
            .read_encrypted(PRIVATE_KEY_FIELD)
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.store.get_cached().await.as_deref(), Some(&pair(14)));
    }

    #[tokio::test]
    async fn test_cancelled_save_commits_nothing() {
        let f = fixture(VaultTimeout::Seconds(30)).await;
        let store = Arc::new(f.store);
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let writes = store.hold_writes().await;
        let pending = {
            let store = store.clone();
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                store
                    .save_unless(pair(16), || {
                        cancelled.load(std::sync::atomic::Ordering::SeqCst)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        drop(writes);

        assert!(!pending.await.unwrap().unwrap());
        assert!(store.get_cached().await.is_none());
        assert!(store.load_durable_secrets().await.unwrap().is_locked());
        assert!(store.save_unless(pair(17), || false).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_keeps_durable_copy() {
        let f = fixture(VaultTimeout::Seconds(30)).await;
        f.store.save(pair(10)).await.unwrap();

        f.store.lock().await;
        assert!(f.store.get_cached().await.is_none());
        assert_eq!(f.store.load_durable_secrets().await.unwrap(), pair(10));
    }

    #[tokio::test]
    async fn test_set_timeout_refreshes_live_expiry() {
        let f = fixture(VaultTimeout::Never).await;
        f.store.save(pair(11)).await.unwrap();
        assert_eq!(f.store.read_policy().await.unwrap().expires_at, 0);

        f.clock.advance(5_000);
        f.store.set_timeout(VaultTimeout::Seconds(10)).await.unwrap();

        let policy = f.store.read_policy().await.unwrap();
        assert_eq!(policy.timeout, VaultTimeout::Seconds(10));
        assert_eq!(policy.expires_at, NOW + 15_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cache_never_half_populated_under_contention() {
        let f = fixture(VaultTimeout::Never).await;
        let store = Arc::new(f.store);
        let candidates = [pair(20), pair(40), pair(60)];

        let mut tasks = Vec::new();
        for round in 0..12u8 {
            let store = store.clone();
            let secrets = candidates[(round % 3) as usize].clone();
            tasks.push(tokio::spawn(async move {
                if round % 4 == 3 {
                    store.clear().await.unwrap();
                } else {
                    store.save(secrets).await.unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let store = store.clone();
            let candidates = candidates.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    if let Some(seen) = store.get_cached().await {
                        assert!(!seen.is_locked());
                        assert!(candidates.iter().any(|c| c == seen.as_ref()));
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Durable copy and cache agree once writers are done.
        let durable = store.load_durable_secrets().await.unwrap();
        match store.get_cached().await {
            Some(cached) => assert_eq!(cached.as_ref(), &durable),
            None => assert!(durable.is_locked()),
        }
    }
}
