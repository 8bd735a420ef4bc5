//! Pending transaction log and the stuck-transaction sweep

use super::sender::{SubmitOutcome, TransactionSender};
use crate::chain::ChainRegistry;
use crate::config::TransactionConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::StateManager;
use crate::types::{ActionType, AssetType, ChainCode, Payload};

use chrono::Utc;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A broadcast transaction that has not been seen mined yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransactionRecord {
    pub tx_hash: H256,
    #[serde(default)]
    pub original_tx_hash: Option<H256>,
    pub chain_code: ChainCode,
    pub action_type: ActionType,
    pub asset_type: AssetType,
    pub obt_id: String,
    pub payload: Payload,
    pub nonce: u64,
    /// Unix seconds
    pub submitted_at: i64,
    pub is_replacement: bool,
    pub to: Address,
    pub data: Bytes,
    pub gas_limit: u64,
    #[serde(default)]
    pub gas_price: Option<U256>,
}

impl PendingTransactionRecord {
    /// Pending log line: `"<txHash> <jsonPayload>"`
    pub fn to_line(&self) -> RelayerResult<String> {
        Ok(format!("{:?} {}", self.tx_hash, serde_json::to_string(self)?))
    }

    pub fn from_line(line: &str) -> RelayerResult<Self> {
        let (_, json) = line
            .split_once(' ')
            .ok_or_else(|| RelayerError::MalformedEntry(line.to_string()))?;
        serde_json::from_str(json).map_err(|e| RelayerError::MalformedEntry(format!("{e}: {line}")))
    }

    /// Hash of the first transaction in this replacement chain
    pub fn root_hash(&self) -> H256 {
        self.original_tx_hash.unwrap_or(self.tx_hash)
    }
}

/// Read every well-formed record of a chain's pending log
pub async fn load_pending(
    state: &StateManager,
    chain: &ChainCode,
) -> RelayerResult<Vec<PendingTransactionRecord>> {
    let path = state.pending_path(chain);
    let mut records = Vec::new();
    for line in state.read_lines(&path).await? {
        match PendingTransactionRecord::from_line(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(chain = %chain, "Dropping malformed pending entry: {}", e),
        }
    }
    Ok(records)
}

async fn write_pending(
    state: &StateManager,
    chain: &ChainCode,
    records: &[PendingTransactionRecord],
) -> RelayerResult<()> {
    let lines = records
        .iter()
        .map(PendingTransactionRecord::to_line)
        .collect::<RelayerResult<Vec<_>>>()?;
    state.write_lines(&state.pending_path(chain), &lines).await
}

/// Add a record, superseding any record with the same nonce
pub async fn record_pending(
    state: &StateManager,
    record: &PendingTransactionRecord,
) -> RelayerResult<()> {
    let _guard = state.lock_file(&state.pending_path(&record.chain_code)).await;
    let mut records = load_pending(state, &record.chain_code).await?;
    records.retain(|r| r.nonce != record.nonce);
    records.push(record.clone());
    write_pending(state, &record.chain_code, &records).await
}

pub async fn remove_pending(
    state: &StateManager,
    chain: &ChainCode,
    tx_hash: H256,
) -> RelayerResult<()> {
    remove_pending_many(state, chain, &HashSet::from([tx_hash])).await
}

/// Drop every record whose hash is in `hashes`. The log is re-read under the
/// file lock so records added since the caller's last read are preserved.
pub async fn remove_pending_many(
    state: &StateManager,
    chain: &ChainCode,
    hashes: &HashSet<H256>,
) -> RelayerResult<()> {
    if hashes.is_empty() {
        return Ok(());
    }
    let _guard = state.lock_file(&state.pending_path(chain)).await;
    let mut records = load_pending(state, chain).await?;
    let before = records.len();
    records.retain(|r| !hashes.contains(&r.tx_hash));
    if records.len() != before {
        write_pending(state, chain, &records).await?;
    }
    Ok(())
}

/// Whether anything is still in flight on `chain`
pub async fn has_pending(state: &StateManager, chain: &ChainCode) -> RelayerResult<bool> {
    Ok(state.line_count(&state.pending_path(chain)).await? > 0)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub discarded: usize,
    pub replaced: usize,
    pub kept: usize,
}

/// Periodic sweep over the pending log of each chain
pub struct PendingMonitor {
    registry: Arc<ChainRegistry>,
    state: Arc<StateManager>,
    sender: Arc<TransactionSender>,
    drop_timeout_secs: i64,
    max_pending_age_secs: i64,
}

impl PendingMonitor {
    pub fn new(
        registry: Arc<ChainRegistry>,
        state: Arc<StateManager>,
        sender: Arc<TransactionSender>,
        config: &TransactionConfig,
    ) -> Self {
        Self {
            registry,
            state,
            sender,
            drop_timeout_secs: config.drop_timeout_secs as i64,
            max_pending_age_secs: config.max_pending_age_secs as i64,
        }
    }

    pub async fn sweep(&self, chain: &ChainCode) -> RelayerResult<SweepReport> {
        self.sweep_at(chain, Utc::now().timestamp()).await
    }

    pub async fn sweep_at(&self, chain: &ChainCode, now: i64) -> RelayerResult<SweepReport> {
        let records = load_pending(&self.state, chain).await?;
        let mut report = SweepReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        let provider = self.registry.provider(chain)?;
        let confirmed = provider
            .transaction_count(self.sender.address(), "latest")
            .await?;

        // Hashes that a later replacement points back to
        let superseded: HashSet<H256> = records
            .iter()
            .filter(|r| r.is_replacement)
            .filter_map(|r| r.original_tx_hash)
            .collect();

        // Hashes to drop from the log once classification is done
        let mut settled: HashSet<H256> = HashSet::new();

        // Newest record wins per nonce
        let mut by_nonce: HashMap<u64, PendingTransactionRecord> = HashMap::new();
        for record in records.iter().cloned() {
            if record.nonce < confirmed || superseded.contains(&record.tx_hash) {
                debug!(
                    chain = %chain,
                    nonce = record.nonce,
                    "Discarding settled pending entry {:?}", record.tx_hash
                );
                report.discarded += 1;
                settled.insert(record.tx_hash);
                continue;
            }
            match by_nonce.get(&record.nonce) {
                Some(existing) if existing.submitted_at > record.submitted_at => {
                    report.discarded += 1;
                    settled.insert(record.tx_hash);
                }
                Some(existing) => {
                    report.discarded += 1;
                    settled.insert(existing.tx_hash);
                    by_nonce.insert(record.nonce, record);
                }
                None => {
                    by_nonce.insert(record.nonce, record);
                }
            }
        }

        let mut candidates: Vec<PendingTransactionRecord> = by_nonce.into_values().collect();
        candidates.sort_by_key(|r| r.nonce);

        let mut stuck = Vec::new();
        for record in candidates {
            let age = now - record.submitted_at;
            let seen = provider.get_transaction(record.tx_hash).await?;
            let mined = seen
                .as_ref()
                .map(|tx| !tx["blockNumber"].is_null())
                .unwrap_or(false);

            if mined {
                report.discarded += 1;
                settled.insert(record.tx_hash);
            } else if (seen.is_none() && age >= self.drop_timeout_secs)
                || age >= self.max_pending_age_secs
            {
                settled.insert(record.tx_hash);
                stuck.push(record);
            } else {
                report.kept += 1;
            }
        }

        remove_pending_many(&self.state, chain, &settled).await?;

        for record in stuck {
            warn!(
                chain = %chain,
                nonce = record.nonce,
                obt_id = %record.obt_id,
                "Replacing stuck transaction {:?}",
                record.tx_hash
            );
            match self.sender.replace(&record).await {
                Ok(SubmitOutcome::Submitted { hash, .. }) => {
                    info!(chain = %chain, nonce = record.nonce, "Replacement {:?} sent", hash);
                    report.replaced += 1;
                }
                Ok(SubmitOutcome::AlreadyCompleted) => report.discarded += 1,
                Err(e) => {
                    error!(chain = %chain, nonce = record.nonce, "Replacement failed: {}", e);
                    record_pending(&self.state, &record).await?;
                    report.kept += 1;
                }
            }
        }

        Ok(report)
    }
}
