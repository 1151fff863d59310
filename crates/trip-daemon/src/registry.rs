//! Per-identity state registry.
//!
//! All mutations of a given chain and its mobility profile are
//! serialized behind a per-identity async mutex; verdict computation
//! clones a consistent snapshot and runs off-lock. The registry map
//! itself sits behind a short-lived synchronous lock that is never held
//! across an await.
//!
//! With a chain store attached, accepted breadcrumbs are persisted
//! before the in-memory state advances, so a crash never acknowledges
//! evidence it cannot recover.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use trip_core::breadcrumb::IdentityKey;
use trip_core::chain::ChainError;
use trip_core::config::VerifierConfig;
use trip_core::crypto::Hash;
use trip_core::identity::IdentityState;
use trip_core::store::{ChainStore, StoreError};

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Chain validation failure; the submitted batch was rejected.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Persistence failure; the operation was aborted.
    #[error("persistence fault: {0}")]
    Store(#[from] StoreError),
}

/// Owner of every identity's verifier-side state.
pub struct Registry {
    config: VerifierConfig,
    store: Option<Arc<ChainStore>>,
    states: RwLock<HashMap<IdentityKey, Arc<Mutex<IdentityState>>>>,
}

impl Registry {
    /// Creates a registry, optionally backed by a chain store.
    #[must_use]
    pub fn new(config: VerifierConfig, store: Option<Arc<ChainStore>>) -> Self {
        Self {
            config,
            store,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds in-memory state for every persisted chain.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if a stored chain fails revalidation.
    pub fn recover(&self) -> Result<usize, RegistryError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut recovered = 0;
        for identity in store.identities()? {
            if let Some(chain) = store.load_chain(identity, &self.config.chain)? {
                let state = IdentityState::recover(chain, self.config.clone())?;
                self.states
                    .write()
                    .expect("lock poisoned")
                    .insert(identity, Arc::new(Mutex::new(state)));
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(identities = recovered, "recovered chains from store");
        }
        Ok(recovered)
    }

    fn entry(&self, identity: IdentityKey) -> Arc<Mutex<IdentityState>> {
        if let Some(state) = self.states.read().expect("lock poisoned").get(&identity) {
            return Arc::clone(state);
        }
        let mut states = self.states.write().expect("lock poisoned");
        Arc::clone(states.entry(identity).or_insert_with(|| {
            Arc::new(Mutex::new(IdentityState::new(
                identity,
                self.config.clone(),
            )))
        }))
    }

    /// Validates, persists, and applies a breadcrumb batch for
    /// `identity`, returning the appended count and the new head.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Chain`] for validation failures (state
    /// unchanged) or [`RegistryError::Store`] for persistence faults
    /// (state unchanged; the operation aborts).
    pub async fn ingest(
        &self,
        identity: IdentityKey,
        batch: &[u8],
    ) -> Result<(usize, Option<Hash>, Option<u64>), RegistryError> {
        let entry = self.entry(identity);
        let mut guard = entry.lock().await;

        // Validate and apply on a scratch copy, persist, then swap the
        // accepted state in. A store fault leaves memory untouched.
        let mut next = guard.clone();
        let appended = next.ingest_batch(batch)?;

        if let Some(store) = &self.store {
            for crumb in &next.chain().breadcrumbs()[guard.chain().len()..] {
                store.append(crumb)?;
            }
        }

        *guard = next;
        Ok((appended, guard.chain().head_hash(), guard.chain().head_index()))
    }

    /// Consistent snapshot of an identity's state, or `None` if the
    /// identity has no chain.
    pub async fn snapshot(&self, identity: IdentityKey) -> Option<IdentityState> {
        let entry = {
            let states = self.states.read().expect("lock poisoned");
            Arc::clone(states.get(&identity)?)
        };
        let guard = entry.lock().await;
        if guard.chain().is_empty() {
            return None;
        }
        Some(guard.clone())
    }

    /// The stored head hash and index for `identity`.
    pub async fn head(&self, identity: IdentityKey) -> Option<(Hash, u64)> {
        let entry = {
            let states = self.states.read().expect("lock poisoned");
            Arc::clone(states.get(&identity)?)
        };
        let guard = entry.lock().await;
        Some((guard.chain().head_hash()?, guard.chain().head_index()?))
    }

    /// Applies a closure to an identity's live state.
    pub async fn with_state<R>(
        &self,
        identity: IdentityKey,
        f: impl FnOnce(&mut IdentityState) -> R,
    ) -> R {
        let entry = self.entry(identity);
        let mut guard = entry.lock().await;
        f(&mut guard)
    }

    /// Destroys all state for `identity` (administrative purge).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] if the persisted chain cannot
    /// be removed.
    pub async fn purge(&self, identity: IdentityKey) -> Result<bool, RegistryError> {
        let existed = self
            .states
            .write()
            .expect("lock poisoned")
            .remove(&identity)
            .is_some();
        if let Some(store) = &self.store {
            store.purge(identity)?;
        }
        Ok(existed)
    }
}
