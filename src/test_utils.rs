//! Helpers shared by unit tests

use crate::chain::{
    ChainProvider, ChainRegistry, ProviderDescriptor, RequestThrottle, RpcTransport,
    ThrottleSettings,
};
use crate::config::{ChainConfig, ProviderConfig};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::types::ChainCode;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Well-known development key; never funded
pub const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

type Handler = Box<dyn Fn(&Value) -> Result<Value, ProviderError> + Send + Sync>;

/// JSON-RPC transport answering from a script.
///
/// Lookup order per call: queued one-shot responses, then a handler, then a
/// sticky default.
pub struct ScriptedTransport {
    name: String,
    queued: Mutex<HashMap<String, VecDeque<Result<Value, ProviderError>>>>,
    handlers: Mutex<HashMap<String, Handler>>,
    defaults: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            queued: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, method: &str, result: Result<Value, ProviderError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, ProviderError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), Box::new(handler));
    }

    pub fn set(&self, method: &str, value: Value) {
        self.defaults
            .lock()
            .unwrap()
            .insert(method.to_string(), value);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        if let Some(result) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        if let Some(handler) = self.handlers.lock().unwrap().get(method) {
            return handler(&params);
        }
        if let Some(value) = self.defaults.lock().unwrap().get(method) {
            return Ok(value.clone());
        }
        Err(ProviderError::new(
            &self.name,
            ProviderErrorKind::Rpc {
                code: -32601,
                data: None,
            },
            format!("no scripted answer for {}", method),
        ))
    }
}

pub fn rpc_error(provider: &str, message: &str) -> ProviderError {
    ProviderError::new(
        provider,
        ProviderErrorKind::Rpc {
            code: -32000,
            data: None,
        },
        message,
    )
}

pub fn descriptor(
    name: &str,
    priority: u32,
    logs_priority: Option<u32>,
    max_logs_block_span: Option<u64>,
) -> ProviderDescriptor {
    ProviderDescriptor {
        name: name.to_string(),
        priority,
        logs_priority,
        max_logs_block_span,
    }
}

pub fn test_throttle() -> Arc<RequestThrottle> {
    Arc::new(RequestThrottle::new(ThrottleSettings {
        spacing: Duration::ZERO,
        rate_limit_retries: 0,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        cooldown_after_retry: Duration::ZERO,
    }))
}

pub fn chain_config(code: &str, with_nft: bool) -> ChainConfig {
    ChainConfig {
        code: code.to_string(),
        chain_id: 137,
        providers: vec![ProviderConfig {
            name: "rpc".into(),
            url: "http://localhost:8545".into(),
            priority: 1,
            logs_priority: Some(1),
            max_logs_block_span: Some(1000),
        }],
        token_contract: "0x0000000000000000000000000000000000000001".into(),
        nft_contract: with_nft.then(|| "0x0000000000000000000000000000000000000002".to_string()),
        block_safety_offset: 5,
        initial_lookback_blocks: 100,
        wrap_gas_limit: 400_000,
        burn_gas_limit: 300_000,
        enabled: true,
    }
}

/// Registry with one chain served by a single scripted transport
pub fn registry_with(
    config: ChainConfig,
    transport: Arc<ScriptedTransport>,
) -> Arc<ChainRegistry> {
    let provider = ChainProvider::new(
        ChainCode::new(&config.code),
        config.chain_id,
        vec![(
            descriptor("rpc", 1, Some(1), Some(1000)),
            transport as Arc<dyn RpcTransport>,
        )],
        test_throttle(),
    )
    .unwrap();
    let registry = ChainRegistry::new();
    registry.insert_chain(config, Arc::new(provider)).unwrap();
    Arc::new(registry)
}
