//! Queue handlers that carry out relay actions

use crate::chain::ChainRegistry;
use crate::error::{RelayerError, RelayerResult};
use crate::fio::{FioLedger, UnwrapAction};
use crate::jobs::QueueHandler;
use crate::tx::classify::{classify, ErrorClass};
use crate::tx::{SubmitOutcome, SubmitRequest, TransactionSender};
use crate::types::{ActionType, Payload, QueueItem};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Wraps and burns on the target chain
pub struct ChainExecutor {
    registry: Arc<ChainRegistry>,
    sender: Arc<TransactionSender>,
}

impl ChainExecutor {
    pub fn new(registry: Arc<ChainRegistry>, sender: Arc<TransactionSender>) -> Self {
        Self { registry, sender }
    }

    fn build(&self, item: &QueueItem) -> RelayerResult<SubmitRequest> {
        let contract = self.registry.contract(&item.chain_code, item.asset)?;
        let config = self.registry.config(&item.chain_code)?;

        let (data, gas_limit) = match (item.action, &item.payload) {
            (ActionType::Wrap, payload) => (
                contract.wrap_calldata(payload, &item.obt_id)?,
                config.wrap_gas_limit,
            ),
            (ActionType::Burn, Payload::Burn { token_id, .. }) => (
                contract.burn_calldata(*token_id, &item.obt_id)?,
                config.burn_gas_limit,
            ),
            (action, payload) => {
                return Err(RelayerError::Transaction(format!(
                    "cannot execute {} with {:?} on {}",
                    action, payload, item.chain_code
                )))
            }
        };

        Ok(SubmitRequest {
            chain: item.chain_code.clone(),
            action: item.action,
            asset: item.asset,
            obt_id: item.obt_id.clone(),
            payload: item.payload.clone(),
            to: contract.address(),
            data,
            gas_limit,
            nonce: None,
            replaces: None,
            gas_price_floor: None,
        })
    }
}

#[async_trait]
impl QueueHandler for ChainExecutor {
    async fn handle(&self, item: &QueueItem) -> RelayerResult<()> {
        let request = self.build(item)?;
        match self.sender.submit(request).await? {
            SubmitOutcome::Submitted { hash, nonce } => info!(
                chain = %item.chain_code,
                obt_id = %item.obt_id,
                nonce,
                "{} {} submitted as {:?}", item.action, item.asset, hash
            ),
            SubmitOutcome::AlreadyCompleted => info!(
                chain = %item.chain_code,
                obt_id = %item.obt_id,
                "{} {} was already completed", item.action, item.asset
            ),
        }
        Ok(())
    }
}

/// Unwrap action for a queue item
pub fn unwrap_action(item: &QueueItem) -> RelayerResult<UnwrapAction> {
    let amount_error =
        |amount| RelayerError::MalformedEntry(format!("unwrap amount {} out of range", amount));
    match &item.payload {
        Payload::Tokens {
            amount,
            target_address,
        } => {
            if *amount > ethers::types::U256::from(u64::MAX) {
                return Err(amount_error(amount));
            }
            Ok(UnwrapAction::Tokens {
                amount: amount.as_u64(),
                obt_id: item.obt_id.clone(),
                fio_address: target_address.clone(),
            })
        }
        Payload::Nft {
            name,
            target_address,
        } => Ok(UnwrapAction::Domain {
            fio_domain: name.clone(),
            obt_id: item.obt_id.clone(),
            fio_address: target_address.clone(),
        }),
        Payload::Burn { .. } => Err(RelayerError::MalformedEntry(format!(
            "burn payload in unwrap queue for {}",
            item.obt_id
        ))),
    }
}

/// Unwraps posted back to the native ledger
pub struct UnwrapExecutor {
    ledger: Arc<dyn FioLedger>,
}

impl UnwrapExecutor {
    pub fn new(ledger: Arc<dyn FioLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl QueueHandler for UnwrapExecutor {
    async fn handle(&self, item: &QueueItem) -> RelayerResult<()> {
        let action = unwrap_action(item)?;
        match self.ledger.push_unwrap(&action).await {
            Ok(tx_id) => {
                info!(chain = %item.chain_code, obt_id = %item.obt_id, "Unwrap pushed: {}", tx_id);
                Ok(())
            }
            Err(e) if classify(&e) == ErrorClass::AlreadyCompleted => {
                info!(chain = %item.chain_code, obt_id = %item.obt_id, "Unwrap already completed");
                crate::metrics::record_already_completed(
                    item.chain_code.as_str(),
                    item.action.as_str(),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
