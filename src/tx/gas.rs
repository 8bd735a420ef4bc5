//! Gas price policy: quoted or fixed, with retry and replacement bumps

use crate::chain::ChainRegistry;
use crate::config::{GasConfig, GasPriceMode};
use crate::error::{RelayerError, RelayerResult};
use crate::types::ChainCode;

use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, warn};

const GWEI: u64 = 1_000_000_000;

/// A gas price quote provider
#[async_trait]
pub trait GasPriceSource: Send + Sync {
    fn name(&self) -> &str;

    /// Quoted price in wei
    async fn gas_price(&self, chain: &ChainCode) -> RelayerResult<U256>;
}

/// Quotes straight from the chain's `eth_gasPrice`
pub struct RpcGasPriceSource {
    registry: Arc<ChainRegistry>,
}

impl RpcGasPriceSource {
    pub fn new(registry: Arc<ChainRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl GasPriceSource for RpcGasPriceSource {
    fn name(&self) -> &str {
        "rpc"
    }

    async fn gas_price(&self, chain: &ChainCode) -> RelayerResult<U256> {
        self.registry.provider(chain)?.gas_price().await
    }
}

/// Multiply a wei amount by a decimal factor with milli precision
pub fn scale(price: U256, factor: f64) -> U256 {
    let millis = (factor * 1000.0).round().max(0.0) as u64;
    price * U256::from(millis) / U256::from(1000u64)
}

pub struct GasPolicy {
    mode: GasPriceMode,
    tier_multiplier: f64,
    fixed_price: Option<U256>,
    retry_multiplier: f64,
    replacement_multiplier: f64,
    sources: Vec<Arc<dyn GasPriceSource>>,
}

impl GasPolicy {
    pub fn new(config: &GasConfig, sources: Vec<Arc<dyn GasPriceSource>>) -> Self {
        Self {
            mode: config.mode.clone(),
            tier_multiplier: config.tier_multiplier(),
            fixed_price: config.fixed_gwei.map(|g| U256::from(g) * U256::from(GWEI)),
            retry_multiplier: config.retry_multiplier,
            replacement_multiplier: config.replacement_multiplier,
            sources,
        }
    }

    /// Price for a first submission
    pub async fn base_price(&self, chain: &ChainCode) -> RelayerResult<U256> {
        if self.mode == GasPriceMode::Fixed {
            return self
                .fixed_price
                .filter(|p| !p.is_zero())
                .ok_or_else(|| RelayerError::GasPriceUnavailable {
                    chain: chain.to_string(),
                });
        }

        let mut best: Option<U256> = None;
        for source in &self.sources {
            match source.gas_price(chain).await {
                Ok(price) if !price.is_zero() => {
                    debug!(chain = %chain, source = source.name(), "Gas quote {}", price);
                    best = Some(best.map_or(price, |b| b.max(price)));
                }
                Ok(_) => warn!(chain = %chain, source = source.name(), "Ignoring zero gas quote"),
                Err(e) => warn!(chain = %chain, source = source.name(), "Gas quote failed: {}", e),
            }
        }

        best.map(|p| scale(p, self.tier_multiplier))
            .filter(|p| !p.is_zero())
            .ok_or_else(|| RelayerError::GasPriceUnavailable {
                chain: chain.to_string(),
            })
    }

    /// Price for the next attempt after an underpriced or reverted send
    pub fn for_retry(&self, previous: U256) -> U256 {
        scale(previous, self.retry_multiplier)
    }

    /// Price for a replacement of a stuck transaction
    pub fn for_replacement(&self, previous: U256) -> U256 {
        scale(previous, self.replacement_multiplier)
    }
}
