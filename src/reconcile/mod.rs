//! Missing-action reconciler
//!
//! Compares what the native ledger asked for with what the target chains
//! show, and re-drives the actions that never landed. Runs beside the
//! regular pipelines under its own lock and only acts on items old enough
//! that the pipelines should have finished them.

use crate::chain::ChainRegistry;
use crate::config::ReconcilerConfig;
use crate::error::RelayerResult;
use crate::events::{names, CachedEvent, EventCache, EventQuery};
use crate::fio::{actions, FioLedger, LedgerAction};
use crate::jobs::{JobKind, JobLocks, JobQueue, LockKey, QueueHandler};
use crate::pipeline::unwrap_item;
use crate::state::StateManager;
use crate::tx::classify::{classify, ErrorClass};
use crate::tx::has_pending;
use crate::types::{ActionType, AssetType, ChainCode, OracleLedgerItem, QueueItem};

use chrono::Utc;
use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lock scope for the reconciler, which spans every chain
const LEDGER_SCOPE: &str = "FIO";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub wraps_checked: usize,
    pub unwraps_checked: usize,
    pub missing: Vec<QueueItem>,
    pub executed: usize,
    pub failed: usize,
    /// Chains whose wraps were not executed because transactions were in flight
    pub skipped_chains: Vec<ChainCode>,
    /// Items left to the queue that already holds them or is draining them
    pub left_to_queue: usize,
    /// Another run held the lock
    pub skipped: bool,
}

/// What a wrap event must show to prove a ledger item was handled
struct WrapEvidence<'a> {
    obt_id: String,
    target: String,
    amount: Option<String>,
    domain: Option<&'a str>,
    oracle: String,
}

impl WrapEvidence<'_> {
    fn value_matches(&self, event: &CachedEvent) -> bool {
        match (&self.amount, self.domain) {
            (Some(amount), _) => event.value_str("amount") == Some(amount.as_str()),
            (None, Some(domain)) => event.value_str("domain") == Some(domain),
            (None, None) => false,
        }
    }

    fn matches(&self, event: &CachedEvent) -> bool {
        if event.obt_id() != Some(self.obt_id.as_str()) || !self.value_matches(event) {
            return false;
        }
        let account = event.value_str("account").map(str::to_ascii_lowercase);
        match event.event_name.as_str() {
            names::WRAPPED => account.as_deref() == Some(self.target.as_str()),
            names::CONSENSUS_ACTIVITY => account.as_deref() == Some(self.oracle.as_str()),
            _ => false,
        }
    }
}

fn unwrap_matches(event: &CachedEvent, action: &LedgerAction) -> bool {
    if !action.obt_id.eq_ignore_ascii_case(&event.transaction_hash) {
        return false;
    }
    match action.name.as_str() {
        actions::UNWRAP_TOKENS => {
            event.value_str("amount").and_then(|a| a.parse::<u64>().ok()) == action.amount
        }
        actions::UNWRAP_DOMAIN => event.value_str("domain") == action.fio_domain.as_deref(),
        _ => false,
    }
}

pub struct MissingActionReconciler {
    registry: Arc<ChainRegistry>,
    state: Arc<StateManager>,
    events: Arc<EventCache>,
    ledger: Arc<dyn FioLedger>,
    locks: JobLocks,
    queue: JobQueue,
    wrap_executor: Arc<dyn QueueHandler>,
    unwrap_executor: Arc<dyn QueueHandler>,
    oracle: Address,
    config: ReconcilerConfig,
}

impl MissingActionReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ChainRegistry>,
        state: Arc<StateManager>,
        events: Arc<EventCache>,
        ledger: Arc<dyn FioLedger>,
        locks: JobLocks,
        wrap_executor: Arc<dyn QueueHandler>,
        unwrap_executor: Arc<dyn QueueHandler>,
        oracle: Address,
        config: ReconcilerConfig,
    ) -> Self {
        let queue = JobQueue::new(state.clone());
        Self {
            registry,
            state,
            events,
            ledger,
            locks,
            queue,
            wrap_executor,
            unwrap_executor,
            oracle,
            config,
        }
    }

    pub async fn run(&self) -> RelayerResult<ReconcileReport> {
        self.run_at(Utc::now().timestamp()).await
    }

    pub async fn run_at(&self, now: i64) -> RelayerResult<ReconcileReport> {
        let key = LockKey::new(JobKind::Reconcile, &ChainCode::new(LEDGER_SCOPE), None, None);
        let Some(_lock) = self.locks.acquire(key) else {
            debug!("Reconciler already running");
            return Ok(ReconcileReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = ReconcileReport::default();
        let mut missing = self.find_missing_wraps(now, &mut report).await?;
        missing.extend(self.find_missing_unwraps(now, &mut report).await?);

        for item in &missing {
            warn!(
                chain = %item.chain_code,
                obt_id = %item.obt_id,
                "Missing {} {} found", item.action, item.asset
            );
            crate::metrics::record_missing_action(item.chain_code.as_str(), item.action.as_str());
        }
        report.missing = missing;

        self.execute(&mut report).await?;
        info!(
            "Reconciler checked {} wraps and {} unwraps: {} missing, {} executed",
            report.wraps_checked,
            report.unwraps_checked,
            report.missing.len(),
            report.executed
        );
        Ok(report)
    }

    fn window(&self, now: i64) -> (i64, i64) {
        (
            now - self.config.max_age_secs as i64,
            now - self.config.min_age_secs as i64,
        )
    }

    /// Ledger items inside the age window with no proof of a wrap on chain
    async fn find_missing_wraps(
        &self,
        now: i64,
        report: &mut ReconcileReport,
    ) -> RelayerResult<Vec<QueueItem>> {
        let (oldest, newest) = self.window(now);
        let chains: HashSet<ChainCode> = self.registry.chains().into_iter().collect();
        let candidates: Vec<OracleLedgerItem> = self
            .ledger
            .oracle_ledger()
            .await?
            .into_iter()
            .filter(|row| row.timestamp >= oldest && row.timestamp <= newest)
            .filter(|row| chains.contains(&ChainCode::new(&row.chaincode)))
            .collect();

        let mut disk: HashMap<(ChainCode, AssetType), Vec<CachedEvent>> = HashMap::new();
        let mut missing = Vec::new();

        for row in candidates {
            let Some(item) = row.to_queue_item() else {
                continue;
            };
            if self.registry.contract(&item.chain_code, item.asset).is_err() {
                continue;
            }
            report.wraps_checked += 1;

            let evidence = WrapEvidence {
                obt_id: item.obt_id.clone(),
                target: row.pubaddress.to_ascii_lowercase(),
                amount: row.amount.map(|a| a.to_string()),
                domain: row.nftname.as_deref(),
                oracle: format!("{:?}", self.oracle),
            };

            let recent = self.events.get_cached_events(
                &item.chain_code,
                item.asset,
                &EventQuery::default().between(row.timestamp, now),
            );
            if recent.iter().any(|e| evidence.matches(e)) {
                continue;
            }

            let slot = (item.chain_code.clone(), item.asset);
            if !disk.contains_key(&slot) {
                let events = self.events.read_disk_events(&item.chain_code, item.asset).await?;
                disk.insert(slot.clone(), events);
            }
            if disk
                .get(&slot)
                .map_or(false, |events| events.iter().any(|e| evidence.matches(e)))
            {
                continue;
            }

            if self.completed_on_chain(&item).await? {
                continue;
            }
            missing.push(item);
        }

        Ok(missing)
    }

    /// Approval check, then a dry run of the wrap
    async fn completed_on_chain(&self, item: &QueueItem) -> RelayerResult<bool> {
        let provider = self.registry.provider(&item.chain_code)?;
        let contract = self.registry.contract(&item.chain_code, item.asset)?;

        let approval = contract.approval_calldata(&item.obt_id, self.oracle)?;
        let output = provider.call(self.oracle, contract.address(), &approval).await?;
        if contract.decode_approval(&output)? {
            debug!(
                chain = %item.chain_code,
                obt_id = %item.obt_id,
                "Oracle approval already recorded"
            );
            return Ok(true);
        }

        let data = contract.wrap_calldata(&item.payload, &item.obt_id)?;
        match provider.call(self.oracle, contract.address(), &data).await {
            Ok(_) => Ok(false),
            Err(e) if classify(&e) == ErrorClass::AlreadyCompleted => Ok(true),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                debug!(
                    chain = %item.chain_code,
                    obt_id = %item.obt_id,
                    "Wrap dry run failed: {}",
                    e
                );
                Ok(false)
            }
        }
    }

    /// Cached unwrap events with no matching native-ledger action
    async fn find_missing_unwraps(
        &self,
        now: i64,
        report: &mut ReconcileReport,
    ) -> RelayerResult<Vec<QueueItem>> {
        let (oldest, newest) = self.window(now);
        let mut events = Vec::new();
        for chain in self.registry.chains() {
            for asset in self.registry.assets(&chain) {
                for event in self.events.get_cached_events(
                    &chain,
                    asset,
                    &EventQuery::named(names::UNWRAPPED).between(oldest, newest),
                ) {
                    events.push((chain.clone(), asset, event));
                }
            }
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let history = self.ledger.unwrap_actions(oldest).await?;
        let mut missing = Vec::new();
        for (chain, asset, event) in events {
            report.unwraps_checked += 1;
            if history.iter().any(|action| unwrap_matches(&event, action)) {
                continue;
            }
            match unwrap_item(&chain, asset, &event) {
                Ok(item) => missing.push(item),
                Err(e) => warn!(chain = %chain, "Cannot rebuild unwrap: {}", e),
            }
        }
        Ok(missing)
    }

    /// Re-drive missing items one at a time. Items still waiting in their
    /// queue, parked in its error queue, or behind a running drain are left
    /// to that queue.
    async fn execute(&self, report: &mut ReconcileReport) -> RelayerResult<()> {
        let delay = Duration::from_millis(self.config.item_delay_ms);
        let mut busy: HashMap<ChainCode, bool> = HashMap::new();

        for item in report.missing.clone() {
            let handler = match item.action {
                ActionType::Wrap => {
                    let in_flight = match busy.get(&item.chain_code) {
                        Some(b) => *b,
                        None => {
                            let b = has_pending(&self.state, &item.chain_code).await?;
                            busy.insert(item.chain_code.clone(), b);
                            b
                        }
                    };
                    if in_flight {
                        if !report.skipped_chains.contains(&item.chain_code) {
                            warn!(
                                chain = %item.chain_code,
                                "Transactions in flight, not re-driving wraps"
                            );
                            report.skipped_chains.push(item.chain_code.clone());
                        }
                        continue;
                    }
                    &self.wrap_executor
                }
                ActionType::Unwrap => &self.unwrap_executor,
                ActionType::Burn => continue,
            };

            let drain_key = LockKey::new(
                JobKind::Drain,
                &item.chain_code,
                Some(item.action),
                Some(item.asset),
            );
            let Some(drain_lock) = self.locks.acquire(drain_key) else {
                debug!(chain = %item.chain_code, obt_id = %item.obt_id, "Queue is draining");
                report.left_to_queue += 1;
                continue;
            };
            if self.queue.is_tracked(&item).await? {
                debug!(chain = %item.chain_code, obt_id = %item.obt_id, "Already queued");
                report.left_to_queue += 1;
                continue;
            }

            match handler.handle(&item).await {
                Ok(()) => report.executed += 1,
                Err(e) => {
                    error!(
                        chain = %item.chain_code,
                        obt_id = %item.obt_id,
                        "Re-driving failed: {}",
                        e
                    );
                    let line = item.to_line()?;
                    self.state.record_error("reconcile", Some(&line), &e).await?;
                    report.failed += 1;
                }
            }
            drop(drain_lock);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }
}
