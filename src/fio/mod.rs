//! Native ledger (FIO) access
//!
//! Reads go to several API servers and are only trusted when the fresh or
//! in-sync servers agree. Signing and pushing actions is delegated to a
//! [`LedgerSigner`].

mod client;
pub mod consensus;

pub use client::{FioHttpClient, SigningServiceClient};

use crate::error::RelayerResult;
use crate::types::OracleLedgerItem;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names of the oracle actions on the native ledger
pub mod actions {
    pub const UNWRAP_TOKENS: &str = "unwraptokens";
    pub const UNWRAP_DOMAIN: &str = "unwrapdomain";
}

/// A domain row held by the oracle custodian account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: u64,
    pub name: String,
    pub account: String,
    /// Unix seconds
    pub expiration: i64,
}

/// An unwrap action found in the ledger history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAction {
    pub name: String,
    pub obt_id: String,
    pub amount: Option<u64>,
    pub fio_domain: Option<String>,
    /// Unix seconds
    pub block_time: i64,
}

/// An unwrap to post back to the native ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwrapAction {
    Tokens {
        amount: u64,
        obt_id: String,
        fio_address: String,
    },
    Domain {
        fio_domain: String,
        obt_id: String,
        fio_address: String,
    },
}

impl UnwrapAction {
    pub fn name(&self) -> &'static str {
        match self {
            UnwrapAction::Tokens { .. } => actions::UNWRAP_TOKENS,
            UnwrapAction::Domain { .. } => actions::UNWRAP_DOMAIN,
        }
    }

    pub fn obt_id(&self) -> &str {
        match self {
            UnwrapAction::Tokens { obt_id, .. } | UnwrapAction::Domain { obt_id, .. } => obt_id,
        }
    }

    /// Action data as the oracle contract expects it
    pub fn data(&self, actor: &str) -> Value {
        match self {
            UnwrapAction::Tokens {
                amount,
                obt_id,
                fio_address,
            } => serde_json::json!({
                "amount": amount,
                "obt_id": obt_id,
                "fio_address": fio_address,
                "actor": actor,
            }),
            UnwrapAction::Domain {
                fio_domain,
                obt_id,
                fio_address,
            } => serde_json::json!({
                "fio_domain": fio_domain,
                "obt_id": obt_id,
                "fio_address": fio_address,
                "actor": actor,
            }),
        }
    }
}

/// One action to be signed and pushed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRequest {
    pub contract: String,
    pub action: String,
    pub actor: String,
    pub permission: String,
    pub data: Value,
}

/// Black-box signing and broadcast of native-ledger actions
#[async_trait]
pub trait LedgerSigner: Send + Sync {
    /// Sign `request` and push it through `server`; returns the ledger response
    async fn sign_and_push(&self, server: &str, request: &ActionRequest) -> RelayerResult<Value>;
}

/// Everything the pipelines need from the native ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FioLedger: Send + Sync {
    /// Every row of the oracle ledger table, consensus-checked
    async fn oracle_ledger(&self) -> RelayerResult<Vec<OracleLedgerItem>>;

    /// Domains held by the custodian account, consensus-checked
    async fn wrapped_domains(&self) -> RelayerResult<Vec<DomainRecord>>;

    /// Unwrap actions posted by this oracle since `since` (unix seconds)
    async fn unwrap_actions(&self, since: i64) -> RelayerResult<Vec<LedgerAction>>;

    /// Push an unwrap; returns the ledger transaction id
    async fn push_unwrap(&self, action: &UnwrapAction) -> RelayerResult<String>;

    async fn health_check(&self) -> bool;
}
