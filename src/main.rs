//! FIO Oracle Relayer - bridges FIO tokens and domains to EVM chains
//!
//! The relayer watches the FIO oracle ledger for wrap requests, the EVM
//! bridge contracts for unwraps, and expired wrapped domains for burns.
//! Each action is queued on disk and executed exactly once per oracle.

use anyhow::{anyhow, Result};
use ethers::signers::Signer;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod events;
mod fio;
mod jobs;
mod metrics;
mod pipeline;
mod reconcile;
mod state;
#[cfg(test)]
mod test_utils;
mod tx;
mod types;

use chain::{ChainRegistry, RequestThrottle};
use config::Settings;
use events::EventCache;
use fio::{FioHttpClient, FioLedger, SigningServiceClient};
use metrics::MetricsServer;
use pipeline::RelayEngine;
use state::StateManager;
use tx::{
    load_wallet, GasPolicy, GasPriceSource, NonceManager, RpcGasPriceSource, TransactionSender,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting FIO Oracle Relayer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let state_manager = Arc::new(StateManager::new(settings.storage.state_dir.clone()).await?);
    info!("State directory ready at {:?}", settings.storage.state_dir);

    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    let throttle = Arc::new(RequestThrottle::new((&settings.rpc).into()));
    let registry = Arc::new(ChainRegistry::from_settings(&settings, throttle)?);
    info!("Chain providers initialized");

    let events = Arc::new(EventCache::new(
        registry.clone(),
        state_manager.clone(),
        settings.storage.event_retention_secs,
    ));
    events.load().await?;

    let wallet = load_wallet(&settings.wallet.private_key_env)?;
    let nonces = Arc::new(NonceManager::new(
        registry.clone(),
        state_manager.clone(),
        wallet.address(),
    ));
    let sources: Vec<Arc<dyn GasPriceSource>> =
        vec![Arc::new(RpcGasPriceSource::new(registry.clone()))];
    let gas = Arc::new(GasPolicy::new(&settings.gas, sources));
    let sender = Arc::new(TransactionSender::new(
        registry.clone(),
        state_manager.clone(),
        nonces,
        gas,
        wallet,
        settings.transactions.clone(),
    ));

    let signer_url = settings
        .fio
        .signer_url
        .clone()
        .filter(|url| !url.is_empty())
        .ok_or_else(|| anyhow!("fio.signer_url must point at the transaction signing service"))?;
    let signer = Arc::new(SigningServiceClient::new(
        &signer_url,
        Duration::from_secs(settings.fio.request_timeout_secs),
    )?);
    let ledger: Arc<dyn FioLedger> = Arc::new(FioHttpClient::new(&settings.fio, signer)?);
    info!("FIO client initialized for {} servers", settings.fio.servers.len());

    let engine = Arc::new(RelayEngine::new(
        &settings,
        registry.clone(),
        state_manager.clone(),
        events,
        ledger,
        sender,
    ));
    info!("Relay engine initialized");

    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Relay engine error: {}", e);
            }
        }
    });

    let health_handle = tokio::spawn({
        let registry = registry.clone();
        let engine = engine.clone();
        let interval = settings.relayer.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                for (chain, healthy) in registry.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }

                engine.check_balances().await;
            }
        }
    });

    info!("FIO Oracle Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    engine.stop().await;

    api_handle.abort();
    engine_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("FIO Oracle Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,fio_oracle_relayer=debug,hyper=warn,reqwest=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
