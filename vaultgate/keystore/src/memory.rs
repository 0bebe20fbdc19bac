//! Software key backend and presence verifiers for tests and headless use.
//!
//! Keys live in process memory only. [`MemoryBackend::invalidate`] models the
//! platform revoking a key, e.g. after a biometric enrollment change.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::custodian::{Custodian, KeyBackend};
use crate::error::{Error, Result};
use crate::key::PlatformKey;
use crate::models::*;
use crate::PresenceVerifier;

/// Custodian keeping keys in memory.
pub type SoftwareCustodian = Custodian<MemoryBackend>;

impl SoftwareCustodian {
    pub fn new(verifier: Arc<dyn PresenceVerifier>) -> Self {
        Custodian::with_backend(MemoryBackend::default(), verifier)
    }

    /// Mark the key under `alias` as permanently unusable.
    pub fn invalidate(&self, alias: &KeyAlias) {
        self.backend().invalidate(alias);
    }
}

#[derive(Default)]
struct MemoryKeys {
    keys: HashMap<KeyAlias, PlatformKey>,
    invalidated: HashSet<KeyAlias>,
}

/// In-memory key storage.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryKeys>,
}

impl MemoryBackend {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryKeys>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("Memory key store poisoned".into()))
    }

    pub fn invalidate(&self, alias: &KeyAlias) {
        if let Ok(mut inner) = self.lock() {
            inner.invalidated.insert(alias.clone());
            debug!("Invalidated software key '{}'", alias);
        }
    }

    pub fn contains(&self, alias: &KeyAlias) -> bool {
        self.lock()
            .map(|inner| inner.keys.contains_key(alias))
            .unwrap_or(false)
    }
}

impl KeyBackend for MemoryBackend {
    fn status(&self) -> SecretStorageStatus {
        SecretStorageStatus::available(SecretStorageMethod::Software)
    }

    fn load(&self, alias: &KeyAlias) -> Result<Option<PlatformKey>> {
        let inner = self.lock()?;
        if inner.invalidated.contains(alias) {
            return Err(Error::KeyInvalidated(alias.to_string()));
        }
        Ok(inner.keys.get(alias).cloned())
    }

    fn store(&self, alias: &KeyAlias, key: &PlatformKey) -> Result<()> {
        let mut inner = self.lock()?;
        inner.invalidated.remove(alias);
        inner.keys.insert(alias.clone(), key.clone());
        Ok(())
    }

    fn delete(&self, alias: &KeyAlias) -> Result<()> {
        let mut inner = self.lock()?;
        inner.keys.remove(alias);
        inner.invalidated.remove(alias);
        Ok(())
    }
}

/// Verifier answering prompts from a fixed script, then a fallback.
pub struct ScriptedVerifier {
    script: Mutex<VecDeque<PresenceResult>>,
    fallback: PresenceResult,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedVerifier {
    pub fn always(result: PresenceResult) -> Self {
        Self::new(Vec::new(), result)
    }

    pub fn new(script: Vec<PresenceResult>, fallback: PresenceResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts shown so far, oldest first.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PresenceVerifier for ScriptedVerifier {
    async fn verify(&self, prompt: &Prompt) -> PresenceResult {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A prompt waiting for an answer from a [`ManualVerifier`] controller.
#[derive(Debug)]
pub struct PendingPrompt {
    pub prompt: Prompt,
    responder: oneshot::Sender<PresenceResult>,
}

impl PendingPrompt {
    /// Deliver the single terminal result for this prompt.
    pub fn respond(self, result: PresenceResult) {
        let _ = self.responder.send(result);
    }
}

/// Verifier whose prompts are answered from the outside, one oneshot
/// channel per prompt. Lets callers control exactly when an assertion
/// completes.
pub struct ManualVerifier {
    pending: mpsc::UnboundedSender<PendingPrompt>,
}

impl ManualVerifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingPrompt>) {
        let (pending, rx) = mpsc::unbounded_channel();
        (Self { pending }, rx)
    }
}

#[async_trait]
impl PresenceVerifier for ManualVerifier {
    async fn verify(&self, prompt: &Prompt) -> PresenceResult {
        let (responder, answer) = oneshot::channel();
        let pending = PendingPrompt {
            prompt: prompt.clone(),
            responder,
        };
        if self.pending.send(pending).is_err() {
            return PresenceResult::Unavailable("no prompt controller".into());
        }
        // A dropped responder counts as the user dismissing the prompt.
        answer.await.unwrap_or(PresenceResult::Cancelled)
    }
}
