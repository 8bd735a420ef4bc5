//! Scheduler driving every pipeline on its own interval

use super::executors::{ChainExecutor, UnwrapExecutor};
use super::pollers::{BurnPoller, UnwrapPoller, WrapPoller};
use crate::chain::ChainRegistry;
use crate::config::{RelayerConfig, Settings};
use crate::error::RelayerResult;
use crate::events::EventCache;
use crate::fio::FioLedger;
use crate::jobs::{DrainReport, JobKind, JobLocks, JobQueue, LockKey, QueueHandler, QueueKey};
use crate::reconcile::{MissingActionReconciler, ReconcileReport};
use crate::state::StateManager;
use crate::tx::{load_pending, PendingMonitor, TransactionSender};
use crate::types::{ActionType, AssetType, ChainCode};

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lock scope for passes that read the native ledger as a whole
const LEDGER_SCOPE: &str = "FIO";

/// Outcome of one poll-and-drain pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub queued: usize,
    pub processed: usize,
    pub failed: usize,
    /// Another instance of the pass held the lock
    pub skipped: bool,
}

impl PassReport {
    fn absorb(&mut self, drain: &DrainReport) {
        self.processed += drain.processed;
        self.failed += drain.failed;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub chain: ChainCode,
    pub action: ActionType,
    pub asset: AssetType,
    pub depth: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub chain: ChainCode,
    pub pending_transactions: usize,
    pub last_seen_block: u64,
    pub queues: Vec<QueueStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub chains: Vec<(ChainCode, bool)>,
    pub ledger: bool,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.ledger && self.chains.iter().all(|(_, healthy)| *healthy)
    }
}

/// Relay engine: pollers, queue drains, cache refresh, pending sweep and
/// reconciliation, each on its own interval
pub struct RelayEngine {
    registry: Arc<ChainRegistry>,
    state: Arc<StateManager>,
    events: Arc<EventCache>,
    ledger: Arc<dyn FioLedger>,
    sender: Arc<TransactionSender>,
    locks: JobLocks,
    queue: Arc<JobQueue>,
    wrap_poller: WrapPoller,
    unwrap_poller: UnwrapPoller,
    burn_poller: BurnPoller,
    chain_executor: Arc<ChainExecutor>,
    unwrap_executor: Arc<UnwrapExecutor>,
    pending: PendingMonitor,
    reconciler: MissingActionReconciler,
    config: RelayerConfig,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl RelayEngine {
    pub fn new(
        settings: &Settings,
        registry: Arc<ChainRegistry>,
        state: Arc<StateManager>,
        events: Arc<EventCache>,
        ledger: Arc<dyn FioLedger>,
        sender: Arc<TransactionSender>,
    ) -> Self {
        let locks = JobLocks::new(Duration::from_secs(settings.relayer.lock_ttl_secs));
        let queue = Arc::new(JobQueue::new(state.clone()));
        let chain_executor = Arc::new(ChainExecutor::new(registry.clone(), sender.clone()));
        let unwrap_executor = Arc::new(UnwrapExecutor::new(ledger.clone()));

        let reconciler = MissingActionReconciler::new(
            registry.clone(),
            state.clone(),
            events.clone(),
            ledger.clone(),
            locks.clone(),
            chain_executor.clone(),
            unwrap_executor.clone(),
            sender.address(),
            settings.reconciler.clone(),
        );

        Self {
            wrap_poller: WrapPoller::new(
                ledger.clone(),
                registry.clone(),
                state.clone(),
                queue.clone(),
            ),
            unwrap_poller: UnwrapPoller::new(events.clone(), state.clone(), queue.clone()),
            burn_poller: BurnPoller::new(
                ledger.clone(),
                registry.clone(),
                queue.clone(),
                sender.address(),
                settings.fio.burn_grace_secs,
            ),
            pending: PendingMonitor::new(
                registry.clone(),
                state.clone(),
                sender.clone(),
                &settings.transactions,
            ),
            reconciler,
            chain_executor,
            unwrap_executor,
            registry,
            state,
            events,
            ledger,
            sender,
            locks,
            queue,
            config: settings.relayer.clone(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main loop: one ticker per pass, all running until `stop`
    pub async fn run(self: Arc<Self>) -> RelayerResult<()> {
        let c = self.config.clone();
        info!("Relay engine started for chains {:?}", self.registry.chains());

        tokio::join!(
            self.every("event cache", c.event_cache_interval_secs, |e| async move {
                e.cache_pass().await
            }),
            self.every("wrap", c.wrap_interval_secs, |e| async move {
                e.poll_ledger().await.map(|_| ())
            }),
            self.every("unwrap", c.unwrap_interval_secs, |e| async move {
                e.unwrap_pass().await.map(|_| ())
            }),
            self.every("burn", c.burn_interval_secs, |e| async move {
                e.burn_pass().await.map(|_| ())
            }),
            self.every("pending sweep", c.pending_sweep_interval_secs, |e| async move {
                e.sweep_pass().await
            }),
            self.every("reconcile", c.reconcile_interval_secs, |e| async move {
                e.reconcile_pass().await.map(|_| ())
            }),
        );

        info!("Relay engine stopped");
        Ok(())
    }

    async fn every<F, Fut>(self: &Arc<Self>, name: &'static str, period_secs: u64, pass: F)
    where
        F: Fn(Arc<Self>) -> Fut,
        Fut: Future<Output = RelayerResult<()>>,
    {
        let mut ticker = interval(Duration::from_secs(period_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            debug!("Running {} pass", name);
            if let Err(e) = pass(self.clone()).await {
                if e.should_alert() {
                    error!("{} pass failed: {}", name, e);
                } else {
                    warn!("{} pass failed: {}", name, e);
                }
            }
        }
    }

    async fn stagger(&self, index: usize) {
        if index > 0 && self.config.chain_stagger_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.chain_stagger_ms)).await;
        }
    }

    async fn drain(
        &self,
        chain: &ChainCode,
        action: ActionType,
        asset: AssetType,
        handler: &dyn QueueHandler,
    ) -> RelayerResult<DrainReport> {
        let key = QueueKey::new(chain, action, asset);
        let Some(lock) = self
            .locks
            .acquire(LockKey::new(JobKind::Drain, chain, Some(action), Some(asset)))
        else {
            return Ok(DrainReport::default());
        };
        self.queue.drain(lock, &key, handler).await
    }

    /// Read the oracle ledger, queue new wraps and drain every wrap queue
    pub async fn poll_ledger(&self) -> RelayerResult<PassReport> {
        let scope = ChainCode::new(LEDGER_SCOPE);
        let Some(_lock) = self
            .locks
            .acquire(LockKey::new(JobKind::Poll, &scope, Some(ActionType::Wrap), None))
        else {
            return Ok(PassReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = PassReport {
            queued: self.wrap_poller.poll().await?,
            ..Default::default()
        };

        for (i, chain) in self.registry.chains().iter().enumerate() {
            self.stagger(i).await;
            for asset in self.registry.assets(chain) {
                match self
                    .drain(chain, ActionType::Wrap, asset, self.chain_executor.as_ref())
                    .await
                {
                    Ok(drain) => report.absorb(&drain),
                    Err(e) => error!(chain = %chain, "Wrap drain failed: {}", e),
                }
            }
        }
        Ok(report)
    }

    /// Queue cached unwraps and push them to the native ledger. A failing
    /// chain is logged and the pass moves on.
    pub async fn unwrap_pass(&self) -> RelayerResult<PassReport> {
        let mut report = PassReport::default();

        for (i, chain) in self.registry.chains().iter().enumerate() {
            self.stagger(i).await;
            for asset in self.registry.assets(chain) {
                let Some(_lock) = self.locks.acquire(LockKey::new(
                    JobKind::Poll,
                    chain,
                    Some(ActionType::Unwrap),
                    Some(asset),
                )) else {
                    continue;
                };
                match self.unwrap_poller.poll(chain, asset).await {
                    Ok(queued) => report.queued += queued,
                    Err(e) => error!(chain = %chain, asset = %asset, "Unwrap poll failed: {}", e),
                }
                match self
                    .drain(chain, ActionType::Unwrap, asset, self.unwrap_executor.as_ref())
                    .await
                {
                    Ok(drain) => report.absorb(&drain),
                    Err(e) => error!(chain = %chain, asset = %asset, "Unwrap drain failed: {}", e),
                }
            }
        }
        Ok(report)
    }

    /// Queue burns for expired wrapped domains and send them
    pub async fn burn_pass(&self) -> RelayerResult<PassReport> {
        let scope = ChainCode::new(LEDGER_SCOPE);
        let Some(_lock) = self
            .locks
            .acquire(LockKey::new(JobKind::Poll, &scope, Some(ActionType::Burn), None))
        else {
            return Ok(PassReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = PassReport::default();
        // Burns queued by earlier passes still go out when the ledger is unreachable
        match self.burn_poller.poll(Utc::now().timestamp()).await {
            Ok(queued) => report.queued = queued,
            Err(e) => error!("Burn poll failed: {}", e),
        }
        for (i, chain) in self.registry.chains().iter().enumerate() {
            if !self.registry.assets(chain).contains(&AssetType::Nft) {
                continue;
            }
            self.stagger(i).await;
            match self
                .drain(chain, ActionType::Burn, AssetType::Nft, self.chain_executor.as_ref())
                .await
            {
                Ok(drain) => report.absorb(&drain),
                Err(e) => error!(chain = %chain, "Burn drain failed: {}", e),
            }
        }
        Ok(report)
    }

    /// Refresh the event cache for every chain and asset
    pub async fn cache_pass(&self) -> RelayerResult<()> {
        for (i, chain) in self.registry.chains().iter().enumerate() {
            self.stagger(i).await;
            for asset in self.registry.assets(chain) {
                let Some(_lock) = self
                    .locks
                    .acquire(LockKey::new(JobKind::CacheRefresh, chain, None, Some(asset)))
                else {
                    continue;
                };
                if let Err(e) = self.events.refresh(chain, asset).await {
                    warn!(chain = %chain, asset = %asset, "Event cache refresh failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Sweep the pending log of every chain
    pub async fn sweep_pass(&self) -> RelayerResult<()> {
        for chain in self.registry.chains() {
            let Some(_lock) = self
                .locks
                .acquire(LockKey::new(JobKind::PendingSweep, &chain, None, None))
            else {
                continue;
            };
            match self.pending.sweep(&chain).await {
                Ok(report) if report.replaced > 0 || report.discarded > 0 => info!(
                    chain = %chain,
                    "Pending sweep: {} discarded, {} replaced, {} kept",
                    report.discarded, report.replaced, report.kept
                ),
                Ok(_) => {}
                Err(e) => warn!(chain = %chain, "Pending sweep failed: {}", e),
            }
        }
        Ok(())
    }

    pub async fn reconcile_pass(&self) -> RelayerResult<ReconcileReport> {
        self.reconciler.run().await
    }

    /// Queue depths and in-flight transactions per chain
    pub async fn status(&self) -> RelayerResult<Vec<ChainStatus>> {
        let mut out = Vec::new();
        for chain in self.registry.chains() {
            let mut queues = Vec::new();
            for asset in self.registry.assets(&chain) {
                for action in [ActionType::Wrap, ActionType::Unwrap, ActionType::Burn] {
                    if action == ActionType::Burn && asset != AssetType::Nft {
                        continue;
                    }
                    let key = QueueKey::new(&chain, action, asset);
                    queues.push(QueueStatus {
                        chain: chain.clone(),
                        action,
                        asset,
                        depth: self.queue.depth(&key).await?,
                        errors: self.queue.error_depth(&key).await?,
                    });
                }
            }

            out.push(ChainStatus {
                pending_transactions: load_pending(&self.state, &chain).await?.len(),
                last_seen_block: self.registry.provider(&chain)?.last_seen_block(),
                chain,
                queues,
            });
        }
        Ok(out)
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            chains: self.registry.health_check().await,
            ledger: self.ledger.health_check().await,
        }
    }

    /// Record the wallet balance on every chain
    pub async fn check_balances(&self) {
        for chain in self.registry.chains() {
            match self.sender.balance(&chain).await {
                Ok(balance) => {
                    crate::metrics::record_wallet_balance(chain.as_str(), balance.low_u128() as f64)
                }
                Err(e) => warn!(chain = %chain, "Balance check failed: {}", e),
            }
        }
    }

    /// Stop the engine after the passes in progress
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Relay engine shutdown initiated");
    }

    pub async fn is_stopped(&self) -> bool {
        *self.shutdown.read().await
    }
}
