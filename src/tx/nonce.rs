//! Nonce management for reliable transaction submission
//!
//! The nonce file of a chain holds the last nonce handed out. A new nonce is
//! `max(last + 1, chainPending)` and is written to disk before the signed
//! transaction leaves the process, so a restart never reissues a nonce that
//! may already be in a mempool. A nonce whose transaction was rejected by the
//! node is handed back so the next submission reuses it.

use crate::chain::ChainRegistry;
use crate::error::RelayerResult;
use crate::state::StateManager;
use crate::types::ChainCode;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Next nonce given the persisted last-issued value and the chain's pending count
pub fn resolve_nonce(last_issued: Option<u64>, chain_pending: u64) -> u64 {
    match last_issued {
        Some(last) => (last + 1).max(chain_pending),
        None => chain_pending,
    }
}

/// Issues nonces per chain for the oracle wallet
pub struct NonceManager {
    registry: Arc<ChainRegistry>,
    state: Arc<StateManager>,
    wallet_address: Address,
    /// Serializes issuance per chain
    chain_locks: DashMap<ChainCode, Arc<Mutex<()>>>,
}

impl NonceManager {
    pub fn new(
        registry: Arc<ChainRegistry>,
        state: Arc<StateManager>,
        wallet_address: Address,
    ) -> Self {
        Self {
            registry,
            state,
            wallet_address,
            chain_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, chain: &ChainCode) -> Arc<Mutex<()>> {
        self.chain_locks
            .entry(chain.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn chain_pending(&self, chain: &ChainCode) -> RelayerResult<u64> {
        let provider = self.registry.provider(chain)?;
        provider
            .transaction_count(self.wallet_address, "pending")
            .await
    }

    /// Issue the next nonce for `chain` and persist it
    pub async fn next_nonce(&self, chain: &ChainCode) -> RelayerResult<u64> {
        let lock = self.lock_for(chain);
        let _guard = lock.lock().await;

        let path = self.state.nonce_path(chain);
        let last = self.state.read_u64(&path).await?;
        let pending = self.chain_pending(chain).await?;
        let nonce = resolve_nonce(last, pending);

        self.state.write_u64(&path, nonce).await?;
        debug!(
            chain = %chain,
            "Allocated nonce {} (persisted {:?}, chain pending {})",
            nonce,
            last,
            pending
        );
        Ok(nonce)
    }

    /// Hand back a nonce that never reached a mempool. Only the most recently
    /// issued nonce can be returned; anything older is left alone.
    pub async fn release(&self, chain: &ChainCode, nonce: u64) -> RelayerResult<bool> {
        let lock = self.lock_for(chain);
        let _guard = lock.lock().await;

        let path = self.state.nonce_path(chain);
        if self.state.read_u64(&path).await? != Some(nonce) {
            debug!(chain = %chain, "Nonce {} is no longer the latest, keeping it", nonce);
            return Ok(false);
        }
        match nonce.checked_sub(1) {
            Some(previous) => self.state.write_u64(&path, previous).await?,
            None => self.state.remove_file(&path).await?,
        }
        debug!(chain = %chain, "Released unused nonce {}", nonce);
        Ok(true)
    }

    /// Move past a nonce the chain reported as used or known
    pub async fn bump_after_conflict(&self, chain: &ChainCode, used: u64) -> RelayerResult<u64> {
        let lock = self.lock_for(chain);
        let _guard = lock.lock().await;

        let path = self.state.nonce_path(chain);
        let pending = self.chain_pending(chain).await?;
        let persisted = self.state.read_u64(&path).await?;
        let nonce = resolve_nonce(Some(used.max(persisted.unwrap_or(0))), pending);

        self.state.write_u64(&path, nonce).await?;
        warn!(chain = %chain, "Nonce {} conflicted, moving to {}", used, nonce);
        Ok(nonce)
    }

    /// Last nonce handed out, if any
    pub async fn last_issued(&self, chain: &ChainCode) -> RelayerResult<Option<u64>> {
        self.state.read_u64(&self.state.nonce_path(chain)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chain_config, registry_with, ScriptedTransport};
    use serde_json::json;

    #[test]
    fn resolve_takes_the_maximum() {
        assert_eq!(resolve_nonce(None, 7), 7);
        assert_eq!(resolve_nonce(Some(7), 5), 8);
        assert_eq!(resolve_nonce(Some(3), 9), 9);
    }

    #[tokio::test]
    async fn nonces_stay_monotonic_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new("rpc");
        // The node lags behind what was already broadcast
        transport.set("eth_getTransactionCount", json!("0x5"));
        let registry = registry_with(chain_config("POL", true), transport.clone());
        let pol = ChainCode::new("POL");

        let first = {
            let state = Arc::new(StateManager::new(dir.path()).await.unwrap());
            let nonces = NonceManager::new(registry.clone(), state, Address::zero());
            let a = nonces.next_nonce(&pol).await.unwrap();
            let b = nonces.next_nonce(&pol).await.unwrap();
            assert_eq!((a, b), (5, 6));
            b
        };

        // Fresh manager over the same directory, as after a process restart
        let state = Arc::new(StateManager::new(dir.path()).await.unwrap());
        let nonces = NonceManager::new(registry, state, Address::zero());
        assert!(nonces.next_nonce(&pol).await.unwrap() > first);
        assert_eq!(nonces.last_issued(&pol).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn conflict_bump_respects_chain_pending() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new("rpc");
        transport.set("eth_getTransactionCount", json!("0xa"));
        let registry = registry_with(chain_config("POL", true), transport);
        let state = Arc::new(StateManager::new(dir.path()).await.unwrap());
        let nonces = NonceManager::new(registry, state, Address::zero());
        let pol = ChainCode::new("POL");

        assert_eq!(nonces.bump_after_conflict(&pol, 4).await.unwrap(), 10);
        assert_eq!(nonces.next_nonce(&pol).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn released_nonce_is_issued_again() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new("rpc");
        transport.set("eth_getTransactionCount", json!("0x0"));
        let registry = registry_with(chain_config("POL", true), transport);
        let state = Arc::new(StateManager::new(dir.path()).await.unwrap());
        let nonces = NonceManager::new(registry, state, Address::zero());
        let pol = ChainCode::new("POL");

        assert_eq!(nonces.next_nonce(&pol).await.unwrap(), 0);
        assert!(nonces.release(&pol, 0).await.unwrap());
        assert_eq!(nonces.last_issued(&pol).await.unwrap(), None);
        assert_eq!(nonces.next_nonce(&pol).await.unwrap(), 0);

        assert_eq!(nonces.next_nonce(&pol).await.unwrap(), 1);
        assert_eq!(nonces.next_nonce(&pol).await.unwrap(), 2);
        // Only the latest nonce can be handed back
        assert!(!nonces.release(&pol, 1).await.unwrap());
        assert!(nonces.release(&pol, 2).await.unwrap());
        assert_eq!(nonces.next_nonce(&pol).await.unwrap(), 2);
    }
}
