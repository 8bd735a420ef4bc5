//! Chain module - RPC access to every configured EVM chain
//!
//! This module provides:
//! - Multi-RPC provider management with ordered fallback per call class
//! - A global request throttle shared by all chains
//! - Bridge contract ABIs keyed by chain, asset type and address

pub mod contract;
pub mod provider;
pub mod throttle;

pub use contract::BridgeContract;
pub use provider::{split_block_range, CallClass, ChainProvider, ProviderDescriptor, RpcTransport};
pub use throttle::{RequestThrottle, ThrottleSettings};

use crate::config::{ChainConfig, Settings};
use crate::error::{RelayerError, RelayerResult};
use crate::types::{AssetType, ChainCode};

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lookup key for a deployed bridge contract
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContractKey {
    pub chain: ChainCode,
    pub asset: AssetType,
    pub address: Address,
}

struct ChainEntry {
    config: Arc<ChainConfig>,
    provider: Arc<ChainProvider>,
}

/// Owns the provider and contracts of every enabled chain
pub struct ChainRegistry {
    chains: DashMap<ChainCode, ChainEntry>,
    contracts: DashMap<ContractKey, Arc<BridgeContract>>,
    /// Contract currently relayed for each chain and asset
    active: DashMap<(ChainCode, AssetType), Address>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
            contracts: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Build providers and contracts for all enabled chains
    pub fn from_settings(
        settings: &Settings,
        throttle: Arc<RequestThrottle>,
    ) -> RelayerResult<Self> {
        let registry = Self::new();
        let timeout = Duration::from_secs(settings.rpc.request_timeout_secs);

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} ({}, ID: {})",
                name, chain_config.code, chain_config.chain_id
            );
            let provider = ChainProvider::from_config(chain_config, throttle.clone(), timeout)?;
            registry.insert_chain(chain_config.clone(), Arc::new(provider))?;
            info!("Chain {} initialized successfully", name);
        }

        Ok(registry)
    }

    /// Register a chain along with the bridge contracts named in its config
    pub fn insert_chain(
        &self,
        config: ChainConfig,
        provider: Arc<ChainProvider>,
    ) -> RelayerResult<()> {
        let code = ChainCode::new(&config.code);

        self.register_contract(BridgeContract::new(
            code.clone(),
            AssetType::Tokens,
            &config.token_contract,
        )?);
        match &config.nft_contract {
            Some(address) => {
                self.register_contract(BridgeContract::new(code.clone(), AssetType::Nft, address)?)
            }
            None => warn!("Chain {} has no NFT contract", code),
        }

        self.chains.insert(
            code,
            ChainEntry {
                config: Arc::new(config),
                provider,
            },
        );
        Ok(())
    }

    pub fn register_contract(&self, contract: BridgeContract) {
        let key = ContractKey {
            chain: contract.chain().clone(),
            asset: contract.asset(),
            address: contract.address(),
        };
        self.active
            .insert((key.chain.clone(), key.asset), key.address);
        self.contracts.insert(key, Arc::new(contract));
    }

    pub fn provider(&self, chain: &ChainCode) -> RelayerResult<Arc<ChainProvider>> {
        self.chains
            .get(chain)
            .map(|e| e.provider.clone())
            .ok_or_else(|| RelayerError::ChainNotFound {
                chain: chain.to_string(),
            })
    }

    pub fn config(&self, chain: &ChainCode) -> RelayerResult<Arc<ChainConfig>> {
        self.chains
            .get(chain)
            .map(|e| e.config.clone())
            .ok_or_else(|| RelayerError::ChainNotFound {
                chain: chain.to_string(),
            })
    }

    /// The contract relayed for `asset` on `chain`
    pub fn contract(
        &self,
        chain: &ChainCode,
        asset: AssetType,
    ) -> RelayerResult<Arc<BridgeContract>> {
        let address = self
            .active
            .get(&(chain.clone(), asset))
            .map(|a| *a)
            .ok_or_else(|| RelayerError::ContractNotFound {
                chain: chain.to_string(),
                asset: asset.to_string(),
            })?;
        self.contract_at(chain, asset, address)
            .ok_or_else(|| RelayerError::ContractNotFound {
                chain: chain.to_string(),
                asset: asset.to_string(),
            })
    }

    pub fn contract_at(
        &self,
        chain: &ChainCode,
        asset: AssetType,
        address: Address,
    ) -> Option<Arc<BridgeContract>> {
        self.contracts
            .get(&ContractKey {
                chain: chain.clone(),
                asset,
                address,
            })
            .map(|c| c.clone())
    }

    /// All registered chains, sorted by code
    pub fn chains(&self) -> Vec<ChainCode> {
        let mut codes: Vec<ChainCode> = self.chains.iter().map(|e| e.key().clone()).collect();
        codes.sort();
        codes
    }

    /// Asset types with a contract on `chain`
    pub fn assets(&self, chain: &ChainCode) -> Vec<AssetType> {
        [AssetType::Tokens, AssetType::Nft]
            .into_iter()
            .filter(|asset| self.active.contains_key(&(chain.clone(), *asset)))
            .collect()
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainCode, bool)> {
        let mut results = Vec::new();

        for chain in self.chains() {
            let healthy = match self.provider(&chain) {
                Ok(provider) => provider.health_check().await,
                Err(_) => false,
            };
            crate::metrics::record_chain_health(chain.as_str(), healthy);
            results.push((chain, healthy));
        }

        results
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chain_config, registry_with, ScriptedTransport};

    #[test]
    fn contracts_are_keyed_by_chain_asset_and_address() {
        let transport = ScriptedTransport::new("rpc");
        let registry = registry_with(chain_config("POL", true), transport);
        let pol = ChainCode::new("pol");

        let tokens = registry.contract(&pol, AssetType::Tokens).unwrap();
        assert_eq!(tokens.asset(), AssetType::Tokens);
        assert!(registry
            .contract_at(&pol, AssetType::Nft, tokens.address())
            .is_none());
        assert_eq!(registry.assets(&pol), vec![AssetType::Tokens, AssetType::Nft]);
        assert_eq!(registry.chains(), vec![pol]);
    }

    #[test]
    fn missing_chain_is_an_error() {
        let registry = ChainRegistry::new();
        assert!(matches!(
            registry.provider(&ChainCode::new("ETH")),
            Err(RelayerError::ChainNotFound { .. })
        ));
    }

    #[test]
    fn chain_without_nft_contract_only_relays_tokens() {
        let transport = ScriptedTransport::new("rpc");
        let registry = registry_with(chain_config("ETH", false), transport);
        let eth = ChainCode::new("ETH");
        assert_eq!(registry.assets(&eth), vec![AssetType::Tokens]);
        assert!(matches!(
            registry.contract(&eth, AssetType::Nft),
            Err(RelayerError::ContractNotFound { .. })
        ));
    }
}
