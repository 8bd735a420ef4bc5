//! Domain types shared by the pipelines

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RelayerError;

/// Short chain code as used by the native ledger, e.g. `ETH` or `POL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainCode(String);

impl ChainCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Wrap,
    Unwrap,
    Burn,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Wrap => "wrap",
            ActionType::Unwrap => "unwrap",
            ActionType::Burn => "burn",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Tokens,
    Nft,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Tokens => "tokens",
            AssetType::Nft => "nft",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tokens" => Ok(AssetType::Tokens),
            "nft" => Ok(AssetType::Nft),
            other => Err(RelayerError::Config(format!("unknown asset type {other}"))),
        }
    }
}

/// What a queue item moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Fungible amount in the smallest unit (SUF on FIO, wei-like on the chain)
    Tokens { amount: U256, target_address: String },
    /// FIO domain moved as an NFT
    Nft { name: String, target_address: String },
    /// NFT to burn on the target chain
    Burn { token_id: U256, name: String },
}

impl Payload {
    pub fn target_address(&self) -> Option<&str> {
        match self {
            Payload::Tokens { target_address, .. } | Payload::Nft { target_address, .. } => {
                Some(target_address)
            }
            Payload::Burn { .. } => None,
        }
    }
}

/// One pending relay action, persisted one per line in a queue file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub obt_id: String,
    pub chain_code: ChainCode,
    pub action: ActionType,
    pub asset: AssetType,
    pub payload: Payload,
}

impl QueueItem {
    /// Queue line: `"<id> <jsonPayload>"`
    pub fn to_line(&self) -> Result<String, RelayerError> {
        Ok(format!("{} {}", self.obt_id, serde_json::to_string(self)?))
    }

    pub fn from_line(line: &str) -> Result<Self, RelayerError> {
        let (_, json) = line
            .split_once(' ')
            .ok_or_else(|| RelayerError::MalformedEntry(line.to_string()))?;
        serde_json::from_str(json).map_err(|e| RelayerError::MalformedEntry(format!("{e}: {line}")))
    }
}

/// A row of the native ledger's oracle table describing an intended wrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleLedgerItem {
    pub id: u64,
    pub chaincode: String,
    pub pubaddress: String,
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default)]
    pub nftname: Option<String>,
    /// Seconds since the unix epoch
    pub timestamp: i64,
}

impl OracleLedgerItem {
    pub fn asset(&self) -> AssetType {
        if self.nftname.is_some() {
            AssetType::Nft
        } else {
            AssetType::Tokens
        }
    }

    pub fn obt_id(&self) -> String {
        self.id.to_string()
    }

    /// Turn the ledger row into a wrap queue item.
    pub fn to_queue_item(&self) -> Option<QueueItem> {
        let payload = match (&self.nftname, self.amount) {
            (Some(name), _) => Payload::Nft {
                name: name.clone(),
                target_address: self.pubaddress.clone(),
            },
            (None, Some(amount)) => Payload::Tokens {
                amount: U256::from(amount),
                target_address: self.pubaddress.clone(),
            },
            (None, None) => return None,
        };
        Some(QueueItem {
            obt_id: self.obt_id(),
            chain_code: ChainCode::new(&self.chaincode),
            action: ActionType::Wrap,
            asset: self.asset(),
            payload,
        })
    }
}
