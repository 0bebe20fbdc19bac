//! Generic custodian that pairs a key backend with a presence verifier.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::{DecryptOperation, EncryptOperation, PlatformKey};
use crate::models::*;
use crate::{KeyCustodian, PresenceVerifier};

/// Storage for raw platform keys, addressed by alias.
///
/// `load` must return [`Error::KeyInvalidated`] for keys the platform
/// has permanently revoked, and `Ok(None)` for keys that were never created.
pub trait KeyBackend: Send + Sync {
    fn status(&self) -> SecretStorageStatus;
    fn load(&self, alias: &KeyAlias) -> Result<Option<PlatformKey>>;
    fn store(&self, alias: &KeyAlias, key: &PlatformKey) -> Result<()>;
    fn delete(&self, alias: &KeyAlias) -> Result<()>;
}

/// A [`KeyCustodian`] built from a [`KeyBackend`] and a [`PresenceVerifier`].
///
/// Backend calls may block (keyring D-Bus round trips), so they run on the
/// blocking pool.
pub struct Custodian<B> {
    backend: Arc<B>,
    verifier: Arc<dyn PresenceVerifier>,
}

impl<B: KeyBackend + 'static> Custodian<B> {
    pub fn with_backend(backend: B, verifier: Arc<dyn PresenceVerifier>) -> Self {
        Self {
            backend: Arc::new(backend),
            verifier,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&B) -> Result<T> + Send + 'static,
    {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || op(&backend))
            .await
            .map_err(|e| Error::Internal(format!("Key backend task failed: {}", e)))?
    }

    async fn require_key(&self, alias: &KeyAlias) -> Result<PlatformKey> {
        let alias = alias.clone();
        self.blocking(move |backend| {
            backend
                .load(&alias)?
                .ok_or_else(|| Error::KeyNotFound(alias.to_string()))
        })
        .await
    }

    async fn assert_presence(&self, prompt: Prompt) -> Result<bool> {
        match self.verifier.verify(&prompt).await {
            PresenceResult::Verified => Ok(true),
            PresenceResult::Rejected => {
                debug!("Presence rejected for {}", prompt.alias);
                Ok(false)
            }
            PresenceResult::Cancelled => {
                debug!("Presence prompt cancelled for {}", prompt.alias);
                Ok(false)
            }
            PresenceResult::Unavailable(reason) => {
                warn!("Presence verification unavailable: {}", reason);
                Err(Error::NotAvailable(reason))
            }
        }
    }
}

#[async_trait]
impl<B: KeyBackend + 'static> KeyCustodian for Custodian<B> {
    async fn check_availability(&self) -> Result<SecretStorageStatus> {
        self.blocking(|backend| Ok(backend.status())).await
    }

    async fn create_key(&self, alias: &KeyAlias) -> Result<()> {
        let key = PlatformKey::generate();
        let target = alias.clone();
        self.blocking(move |backend| backend.store(&target, &key)).await?;
        info!("Created platform key '{}'", alias);
        Ok(())
    }

    async fn delete_key(&self, alias: &KeyAlias) -> Result<()> {
        let target = alias.clone();
        self.blocking(move |backend| backend.delete(&target)).await?;
        info!("Deleted platform key '{}'", alias);
        Ok(())
    }

    async fn storage_key(&self, alias: &KeyAlias) -> Result<PlatformKey> {
        let target = alias.clone();
        let (key, created) = self
            .blocking(move |backend| {
                if let Some(key) = backend.load(&target)? {
                    return Ok((key, false));
                }
                let key = PlatformKey::generate();
                backend.store(&target, &key)?;
                Ok((key, true))
            })
            .await?;
        if created {
            info!("Generated storage key '{}'", alias);
        }
        Ok(key)
    }

    async fn build_encrypt_operation(&self, alias: &KeyAlias) -> Result<EncryptHandle> {
        self.require_key(alias).await?;
        Ok(EncryptHandle::new(alias.clone()))
    }

    async fn build_decrypt_operation(
        &self,
        alias: &KeyAlias,
        iv: &InitializationVector,
    ) -> Result<OperationHandle> {
        // Surface invalidation before any prompt is shown.
        self.require_key(alias).await?;
        Ok(OperationHandle::new(alias.clone(), *iv))
    }

    async fn await_assertion(
        &self,
        handle: OperationHandle,
    ) -> Result<Assertion<DecryptOperation>> {
        let prompt = Prompt {
            alias: handle.alias().clone(),
            purpose: PromptPurpose::Unlock,
        };
        if !self.assert_presence(prompt).await? {
            return Ok(Assertion::Failed);
        }

        // The key may have been invalidated while the prompt was showing.
        let key = self.require_key(handle.alias()).await?;
        Ok(Assertion::Succeeded(DecryptOperation::new(key, *handle.iv())))
    }

    async fn await_encrypt_assertion(
        &self,
        handle: EncryptHandle,
    ) -> Result<Assertion<EncryptOperation>> {
        let prompt = Prompt {
            alias: handle.alias().clone(),
            purpose: PromptPurpose::Enroll,
        };
        if !self.assert_presence(prompt).await? {
            return Ok(Assertion::Failed);
        }

        let key = self.require_key(handle.alias()).await?;
        Ok(Assertion::Succeeded(EncryptOperation::new(key)))
    }
}
