//! HTTP API for health checks, status, and manual polling

use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::pipeline::{ChainStatus, PassReport, RelayEngine};
use crate::types::ChainCode;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RelayEngine>,
    pub started: Instant,
}

pub fn router(engine: Arc<RelayEngine>) -> Router {
    let state = AppState {
        engine,
        started: Instant::now(),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/poll", post(trigger_poll))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<RelayEngine>) -> RelayerResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("binding API server to {}: {}", addr, e)))?;
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| RelayerError::Internal(format!("API server: {}", e)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every chain provider and the ledger servers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.engine.health().await;
    let ready = health.is_ready();
    let body = ReadinessResponse {
        ready,
        ledger: health.ledger,
        chains: health
            .chains
            .into_iter()
            .map(|(chain, healthy)| ChainHealth { chain, healthy })
            .collect(),
    };

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Run a native-ledger poll cycle now
async fn trigger_poll(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.poll_ledger().await {
        Ok(report) => (StatusCode::OK, Json(PollResponse::Done(report))),
        Err(e) => {
            error!("Manual poll failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PollResponse::Failed { error: e.to_string() }),
            )
        }
    }
}

/// Queue depths and in-flight transactions
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.status().await {
        Ok(chains) => (
            StatusCode::OK,
            Json(StatusResponse {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_seconds: state.started.elapsed().as_secs(),
                chains,
            }),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    ledger: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainCode,
    healthy: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
enum PollResponse {
    Done(PassReport),
    Failed { error: String },
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    chains: Vec<ChainStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayerError;
    use crate::fio::MockFioLedger;
    use crate::pipeline::engine_with;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let (_h, engine) = engine_with(MockFioLedger::new()).await;
        let response = router(engine)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn ready_fails_when_the_ledger_is_down() {
        let mut ledger = MockFioLedger::new();
        ledger.expect_health_check().returning(|| false);
        let (h, engine) = engine_with(ledger).await;
        h.transport.set("eth_blockNumber", json!("0x10"));

        let response = router(engine)
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["ledger"], false);
        assert_eq!(body["chains"][0]["chain"], "POL");
        assert_eq!(body["chains"][0]["healthy"], true);
    }

    #[tokio::test]
    async fn poll_reports_queued_items() {
        let mut ledger = MockFioLedger::new();
        ledger.expect_oracle_ledger().returning(|| Ok(vec![]));
        let (_h, engine) = engine_with(ledger).await;

        let response = router(engine)
            .oneshot(Request::post("/poll").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["queued"], 0);
    }

    #[tokio::test]
    async fn poll_surfaces_consensus_failures() {
        let mut ledger = MockFioLedger::new();
        ledger
            .expect_oracle_ledger()
            .returning(|| Err(RelayerError::ConsensusFailure("servers disagree".into())));
        let (_h, engine) = engine_with(ledger).await;

        let response = router(engine)
            .oneshot(Request::post("/poll").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("servers disagree"));
    }

    #[tokio::test]
    async fn status_lists_queues_per_chain() {
        let (_h, engine) = engine_with(MockFioLedger::new()).await;
        let response = router(engine)
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let chain = &body["chains"][0];
        assert_eq!(chain["chain"], "POL");
        assert_eq!(chain["pending_transactions"], 0);
        // tokens: wrap, unwrap; nft: wrap, unwrap, burn
        assert_eq!(chain["queues"].as_array().unwrap().len(), 5);
    }
}
