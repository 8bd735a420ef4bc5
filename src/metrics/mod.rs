//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain and provider health
//! - Queue throughput and failures
//! - Transaction submission and replacement
//! - Reconciler findings

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "fio_oracle_chain_healthy",
        "Chain provider health (1=healthy, 0=unhealthy)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "fio_oracle_chain_block_height",
        "Latest block height seen per chain",
        &["chain"]
    ).unwrap();

    pub static ref PROVIDER_FAILOVERS: CounterVec = register_counter_vec!(
        "fio_oracle_provider_failovers_total",
        "Requests that moved past a failing provider",
        &["chain", "provider"]
    ).unwrap();

    pub static ref RATE_LIMITED: CounterVec = register_counter_vec!(
        "fio_oracle_rate_limited_total",
        "Rate-limit responses by provider",
        &["provider"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_CACHED: CounterVec = register_counter_vec!(
        "fio_oracle_events_cached_total",
        "Bridge events added to the cache",
        &["chain", "asset"]
    ).unwrap();

    // Queue metrics
    pub static ref ITEMS_ENQUEUED: CounterVec = register_counter_vec!(
        "fio_oracle_items_enqueued_total",
        "Items added to relay queues",
        &["chain", "action", "asset"]
    ).unwrap();

    pub static ref ITEMS_PROCESSED: CounterVec = register_counter_vec!(
        "fio_oracle_items_processed_total",
        "Queue items completed",
        &["chain", "action"]
    ).unwrap();

    pub static ref ITEMS_FAILED: CounterVec = register_counter_vec!(
        "fio_oracle_items_failed_total",
        "Queue items moved to the error queue",
        &["chain", "action"]
    ).unwrap();

    pub static ref LOCK_CONTENTION: CounterVec = register_counter_vec!(
        "fio_oracle_lock_contention_total",
        "Jobs skipped because their lock was held",
        &["lock"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "fio_oracle_transactions_submitted_total",
        "Transactions broadcast",
        &["chain", "action"]
    ).unwrap();

    pub static ref TX_REPLACED: CounterVec = register_counter_vec!(
        "fio_oracle_transactions_replaced_total",
        "Stuck transactions replaced",
        &["chain"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "fio_oracle_transactions_failed_total",
        "Transactions that failed terminally",
        &["chain"]
    ).unwrap();

    pub static ref ALREADY_COMPLETED: CounterVec = register_counter_vec!(
        "fio_oracle_already_completed_total",
        "Submissions the contract reported as already done",
        &["chain", "action"]
    ).unwrap();

    // Native ledger metrics
    pub static ref CONSENSUS_FAILURES: CounterVec = register_counter_vec!(
        "fio_oracle_consensus_failures_total",
        "Native ledger reads rejected for lack of server agreement",
        &["read"]
    ).unwrap();

    pub static ref MISSING_ACTIONS: CounterVec = register_counter_vec!(
        "fio_oracle_missing_actions_found_total",
        "Actions the reconciler found missing",
        &["chain", "action"]
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "fio_oracle_wallet_balance_wei",
        "Oracle wallet native balance",
        &["chain"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| {
                RelayerError::Internal(format!("binding metrics server to {}: {}", addr, e))
            })?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))
    }
}

async fn metrics_handler() -> (StatusCode, String) {
    match render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain: &str, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain])
        .set(block_number as f64);
}

pub fn record_provider_failover(chain: &str, provider: &str) {
    PROVIDER_FAILOVERS.with_label_values(&[chain, provider]).inc();
}

pub fn record_rate_limited(provider: &str) {
    RATE_LIMITED.with_label_values(&[provider]).inc();
}

pub fn record_events_cached(chain: &str, asset: &str, count: usize) {
    EVENTS_CACHED
        .with_label_values(&[chain, asset])
        .inc_by(count as f64);
}

pub fn record_item_enqueued(chain: &str, action: &str, asset: &str) {
    ITEMS_ENQUEUED.with_label_values(&[chain, action, asset]).inc();
}

pub fn record_item_processed(chain: &str, action: &str) {
    ITEMS_PROCESSED.with_label_values(&[chain, action]).inc();
}

pub fn record_item_failed(chain: &str, action: &str) {
    ITEMS_FAILED.with_label_values(&[chain, action]).inc();
}

pub fn record_lock_contention(lock: &str) {
    LOCK_CONTENTION.with_label_values(&[lock]).inc();
}

pub fn record_tx_submitted(chain: &str, action: &str) {
    TX_SUBMITTED.with_label_values(&[chain, action]).inc();
}

pub fn record_tx_replaced(chain: &str) {
    TX_REPLACED.with_label_values(&[chain]).inc();
}

pub fn record_tx_failed(chain: &str) {
    TX_FAILED.with_label_values(&[chain]).inc();
}

pub fn record_already_completed(chain: &str, action: &str) {
    ALREADY_COMPLETED.with_label_values(&[chain, action]).inc();
}

pub fn record_consensus_failure(read: &str) {
    CONSENSUS_FAILURES.with_label_values(&[read]).inc();
}

pub fn record_missing_action(chain: &str, action: &str) {
    MISSING_ACTIONS.with_label_values(&[chain, action]).inc();
}

pub fn record_wallet_balance(chain: &str, balance_wei: f64) {
    WALLET_BALANCE.with_label_values(&[chain]).set(balance_wei);
}
