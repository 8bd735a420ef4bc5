//! Chain provider with prioritized multi-RPC fallback and block-range chunking

use super::throttle::RequestThrottle;
use crate::config::ChainConfig;
use crate::error::{ProviderError, ProviderErrorKind, RelayerError, RelayerResult};
use crate::tx::classify::{self, ErrorClass};
use crate::types::ChainCode;

use async_trait::async_trait;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, JsonRpcError};
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// A single JSON-RPC endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError>;
}

/// HTTP transport backed by the ethers JSON-RPC client
pub struct HttpTransport {
    name: String,
    client: Http,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(name: &str, url: &str, timeout: Duration) -> RelayerResult<Self> {
        let client = Http::from_str(url)
            .map_err(|e| RelayerError::Config(format!("Invalid RPC url for {}: {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            client,
            timeout,
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let call = self.client.request::<Value, Value>(method, params);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_http_error(&self.name, e)),
            Err(_) => Err(ProviderError::new(
                &self.name,
                ProviderErrorKind::Timeout,
                format!("{} timed out after {:?}", method, self.timeout),
            )),
        }
    }
}

/// Map a transport failure onto the provider error taxonomy
fn classify_http_error(provider: &str, err: HttpClientError) -> ProviderError {
    match err {
        HttpClientError::ReqwestError(e) => {
            let kind = if e.is_timeout() {
                ProviderErrorKind::Timeout
            } else if let Some(status) = e.status() {
                status_kind(status.as_u16())
            } else {
                ProviderErrorKind::Network
            };
            ProviderError::new(provider, kind, e.to_string())
        }
        HttpClientError::JsonRpcError(JsonRpcError { code, message, data }) => {
            let kind = if code == 429 || code == -32005 {
                ProviderErrorKind::RateLimited
            } else {
                match classify::classify_text(&message) {
                    ErrorClass::RateLimited => ProviderErrorKind::RateLimited,
                    ErrorClass::AuthFailure => ProviderErrorKind::Auth,
                    _ => ProviderErrorKind::Rpc {
                        code,
                        data: data.map(|d| classify::collect_error_text(&d)),
                    },
                }
            };
            ProviderError::new(provider, kind, message)
        }
        HttpClientError::SerdeJson { err, text } => {
            // Gateways answer throttling and outages with plain text or HTML
            let kind = match classify::classify_text(&text) {
                ErrorClass::RateLimited => ProviderErrorKind::RateLimited,
                ErrorClass::AuthFailure => ProviderErrorKind::Auth,
                ErrorClass::ServerError => ProviderErrorKind::Server,
                ErrorClass::Network => ProviderErrorKind::Network,
                _ if text.trim_start().starts_with('<') => ProviderErrorKind::Server,
                _ => ProviderErrorKind::Decode,
            };
            ProviderError::new(provider, kind, format!("{}: {}", err, text))
        }
    }
}

fn status_kind(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimited,
        401 | 403 => ProviderErrorKind::Auth,
        500..=599 => ProviderErrorKind::Server,
        _ => ProviderErrorKind::Network,
    }
}

/// Static description of one provider of a chain
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Order for general calls, lowest first
    pub priority: u32,
    /// Order for `eth_getLogs`; providers without one are tried last
    pub logs_priority: Option<u32>,
    /// Largest block span the provider accepts for a log query
    pub max_logs_block_span: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    General,
    Logs,
}

struct ProviderEntry {
    descriptor: ProviderDescriptor,
    transport: Arc<dyn RpcTransport>,
}

/// Split `[from, to]` into contiguous windows at most `cap` blocks wide.
pub fn split_block_range(from: u64, to: u64, cap: Option<u64>) -> Vec<(u64, u64)> {
    if from > to {
        return Vec::new();
    }
    let cap = match cap {
        Some(cap) if cap > 0 => cap,
        _ => return vec![(from, to)],
    };

    let mut windows = Vec::new();
    let mut start = from;
    loop {
        let end = start.saturating_add(cap - 1).min(to);
        windows.push((start, end));
        if end >= to {
            break;
        }
        start = end + 1;
    }
    windows
}

/// All providers of one chain behind a single client
pub struct ChainProvider {
    chain: ChainCode,
    chain_id: u64,
    providers: Vec<ProviderEntry>,
    general_order: Vec<usize>,
    logs_order: Vec<usize>,
    throttle: Arc<RequestThrottle>,
    last_block: AtomicU64,
}

impl ChainProvider {
    /// Create a provider set from already-built transports
    pub fn new(
        chain: ChainCode,
        chain_id: u64,
        entries: Vec<(ProviderDescriptor, Arc<dyn RpcTransport>)>,
        throttle: Arc<RequestThrottle>,
    ) -> RelayerResult<Self> {
        if entries.is_empty() {
            return Err(RelayerError::Config(format!(
                "Chain {} has no RPC providers",
                chain
            )));
        }

        let providers: Vec<ProviderEntry> = entries
            .into_iter()
            .map(|(descriptor, transport)| ProviderEntry {
                descriptor,
                transport,
            })
            .collect();

        let general_order = Self::order(&providers, CallClass::General);
        let logs_order = Self::order(&providers, CallClass::Logs);

        for class in [CallClass::General, CallClass::Logs] {
            let mut seen = std::collections::HashSet::new();
            for p in &providers {
                let priority = match class {
                    CallClass::General => Some(p.descriptor.priority),
                    CallClass::Logs => p.descriptor.logs_priority,
                };
                if let Some(priority) = priority {
                    if !seen.insert(priority) {
                        return Err(RelayerError::Config(format!(
                            "Chain {} has duplicate {:?} priority {}",
                            chain, class, priority
                        )));
                    }
                }
            }
        }

        Ok(Self {
            chain,
            chain_id,
            providers,
            general_order,
            logs_order,
            throttle,
            last_block: AtomicU64::new(0),
        })
    }

    /// Build HTTP transports for every configured provider
    pub fn from_config(
        config: &ChainConfig,
        throttle: Arc<RequestThrottle>,
        timeout: Duration,
    ) -> RelayerResult<Self> {
        let mut entries: Vec<(ProviderDescriptor, Arc<dyn RpcTransport>)> = Vec::new();
        for p in &config.providers {
            let transport = HttpTransport::new(&p.name, &p.url, timeout)?;
            debug!("Added provider {} for chain {}", p.name, config.code);
            entries.push((
                ProviderDescriptor {
                    name: p.name.clone(),
                    priority: p.priority,
                    logs_priority: p.logs_priority,
                    max_logs_block_span: p.max_logs_block_span,
                },
                Arc::new(transport),
            ));
        }
        Self::new(ChainCode::new(&config.code), config.chain_id, entries, throttle)
    }

    fn order(providers: &[ProviderEntry], class: CallClass) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..providers.len()).collect();
        match class {
            CallClass::General => idx.sort_by_key(|&i| providers[i].descriptor.priority),
            CallClass::Logs => idx.sort_by_key(|&i| {
                let d = &providers[i].descriptor;
                (d.logs_priority.is_none(), d.logs_priority, d.priority)
            }),
        }
        idx
    }

    pub fn chain(&self) -> &ChainCode {
        &self.chain
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Provider names in the order used for a call class
    pub fn provider_order(&self, class: CallClass) -> Vec<&str> {
        let order = match class {
            CallClass::General => &self.general_order,
            CallClass::Logs => &self.logs_order,
        };
        order
            .iter()
            .map(|&i| self.providers[i].descriptor.name.as_str())
            .collect()
    }

    async fn call_provider(
        &self,
        idx: usize,
        method: &str,
        params: &Value,
    ) -> Result<Value, ProviderError> {
        let entry = &self.providers[idx];
        let context = format!("{} {} via {}", self.chain, method, entry.descriptor.name);
        self.throttle
            .enqueue(&context, || entry.transport.request(method, params.clone()))
            .await
    }

    async fn with_fallback(
        &self,
        order: &[usize],
        method: &str,
        params: Value,
    ) -> RelayerResult<Value> {
        let mut last: Option<ProviderError> = None;

        for &idx in order {
            match self.call_provider(idx, method, &params).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(chain = %self.chain, method, "Provider failed, falling back: {}", e);
                    crate::metrics::record_provider_failover(self.chain.as_str(), &e.provider);
                    last = Some(e);
                }
                Err(e) => {
                    return Err(RelayerError::Provider {
                        chain: self.chain.to_string(),
                        source: e,
                    })
                }
            }
        }

        Err(RelayerError::AllProvidersFailed {
            chain: self.chain.to_string(),
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// General JSON-RPC call with ordered fallback
    pub async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> RelayerResult<R> {
        let value = self.with_fallback(&self.general_order, method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn block_number(&self) -> RelayerResult<u64> {
        let block: U64 = self.request("eth_blockNumber", json!([])).await?;
        let block = block.as_u64();
        self.last_block.store(block, Ordering::Relaxed);
        crate::metrics::record_block_height(self.chain.as_str(), block);
        Ok(block)
    }

    /// Last head block observed by `block_number`
    pub fn last_seen_block(&self) -> u64 {
        self.last_block.load(Ordering::Relaxed)
    }

    /// `tag` is `"pending"` or `"latest"`
    pub async fn transaction_count(&self, address: Address, tag: &str) -> RelayerResult<u64> {
        let count: U256 = self
            .request("eth_getTransactionCount", json!([address, tag]))
            .await?;
        Ok(count.low_u64())
    }

    pub async fn gas_price(&self) -> RelayerResult<U256> {
        self.request("eth_gasPrice", json!([])).await
    }

    pub async fn balance(&self, address: Address) -> RelayerResult<U256> {
        self.request("eth_getBalance", json!([address, "latest"]))
            .await
    }

    pub async fn send_raw_transaction(&self, raw: &Bytes) -> RelayerResult<H256> {
        self.request("eth_sendRawTransaction", json!([raw])).await
    }

    /// Raw transaction object, `None` if the node does not know the hash
    pub async fn get_transaction(&self, hash: H256) -> RelayerResult<Option<Value>> {
        let value: Value = self
            .request("eth_getTransactionByHash", json!([hash]))
            .await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    /// Static call against the latest block
    pub async fn call(&self, from: Address, to: Address, data: &Bytes) -> RelayerResult<Bytes> {
        self.request(
            "eth_call",
            json!([{ "from": from, "to": to, "data": data }, "latest"]),
        )
        .await
    }

    /// Windows the head logs provider would use for `[from, to]`
    pub fn split_range_by_provider(&self, from: u64, to: u64) -> Vec<(u64, u64)> {
        let cap = self
            .logs_order
            .first()
            .and_then(|&i| self.providers[i].descriptor.max_logs_block_span);
        split_block_range(from, to, cap)
    }

    /// Fetch every log emitted by `address` in `[from, to]`.
    ///
    /// Each provider is asked in logs-priority order for the part of the range
    /// not yet fetched, chunked to that provider's block-span cap.
    pub async fn get_logs(&self, address: Address, from: u64, to: u64) -> RelayerResult<Vec<Log>> {
        let mut logs = Vec::new();
        if from > to {
            return Ok(logs);
        }

        let mut cursor = from;
        let mut last: Option<ProviderError> = None;

        for &idx in &self.logs_order {
            let descriptor = &self.providers[idx].descriptor;
            let windows = split_block_range(cursor, to, descriptor.max_logs_block_span);
            let mut failed = false;

            for (start, end) in windows {
                match self.fetch_window(idx, address, start, end).await {
                    Ok(mut batch) => {
                        logs.append(&mut batch);
                        cursor = end + 1;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            chain = %self.chain,
                            provider = %descriptor.name,
                            start, end,
                            "Log query failed, trying next provider: {}", e
                        );
                        crate::metrics::record_provider_failover(self.chain.as_str(), &e.provider);
                        last = Some(e);
                        failed = true;
                        break;
                    }
                    Err(e) => {
                        return Err(RelayerError::Provider {
                            chain: self.chain.to_string(),
                            source: e,
                        })
                    }
                }
            }

            if !failed {
                return Ok(logs);
            }
        }

        error!(chain = %self.chain, "All providers failed to return logs");
        Err(RelayerError::AllProvidersFailed {
            chain: self.chain.to_string(),
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn fetch_window(
        &self,
        idx: usize,
        address: Address,
        start: u64,
        end: u64,
    ) -> Result<Vec<Log>, ProviderError> {
        match self.fetch_logs_once(idx, address, start, end).await {
            Err(e) if classify::classify_text(&e.full_text()) == ErrorClass::BlockRangeTooLarge => {
                let span = self.smallest_safe_span(end - start + 1);
                debug!(
                    chain = %self.chain,
                    start, end, span,
                    "Window rejected as too large, re-splitting"
                );
                let mut out = Vec::new();
                for (s, e) in split_block_range(start, end, Some(span)) {
                    out.extend(self.fetch_logs_once(idx, address, s, e).await?);
                }
                Ok(out)
            }
            other => other,
        }
    }

    async fn fetch_logs_once(
        &self,
        idx: usize,
        address: Address,
        start: u64,
        end: u64,
    ) -> Result<Vec<Log>, ProviderError> {
        let params = json!([{
            "address": address,
            "fromBlock": format!("{:#x}", start),
            "toBlock": format!("{:#x}", end),
        }]);
        let value = self.call_provider(idx, "eth_getLogs", &params).await?;
        serde_json::from_value(value).map_err(|e| {
            ProviderError::new(
                &self.providers[idx].descriptor.name,
                ProviderErrorKind::Decode,
                e.to_string(),
            )
        })
    }

    /// Smallest span any provider of this chain is known to accept
    fn smallest_safe_span(&self, rejected: u64) -> u64 {
        let known = self
            .providers
            .iter()
            .filter_map(|p| p.descriptor.max_logs_block_span)
            .min();
        match known {
            Some(span) if span < rejected => span,
            _ => (rejected / 2).max(1),
        }
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{descriptor, rpc_error, test_throttle, ScriptedTransport};

    fn provider(entries: Vec<(ProviderDescriptor, Arc<ScriptedTransport>)>) -> ChainProvider {
        let entries = entries
            .into_iter()
            .map(|(d, t)| (d, t as Arc<dyn RpcTransport>))
            .collect();
        ChainProvider::new(ChainCode::new("POL"), 137, entries, test_throttle()).unwrap()
    }

    #[test]
    fn split_covers_range_exactly() {
        let windows = split_block_range(100, 300, Some(95));
        assert_eq!(windows, vec![(100, 194), (195, 289), (290, 300)]);

        let mut expected = 100;
        for (start, end) in &windows {
            assert_eq!(*start, expected);
            assert!(end - start + 1 <= 95);
            expected = end + 1;
        }
        assert_eq!(expected, 301);
    }

    #[test]
    fn split_edge_cases() {
        assert_eq!(split_block_range(5, 5, Some(10)), vec![(5, 5)]);
        assert_eq!(split_block_range(1, 1000, None), vec![(1, 1000)]);
        assert!(split_block_range(10, 9, Some(3)).is_empty());
        assert_eq!(split_block_range(1, 4, Some(2)), vec![(1, 2), (3, 4)]);
    }

    #[test]
    fn logs_order_differs_from_general_order() {
        let a = ScriptedTransport::new("infura");
        let b = ScriptedTransport::new("alchemy");
        let c = ScriptedTransport::new("public");
        let p = provider(vec![
            (descriptor("infura", 1, Some(3), Some(95)), a),
            (descriptor("alchemy", 2, Some(1), None), b),
            (descriptor("public", 3, None, None), c),
        ]);
        assert_eq!(p.provider_order(CallClass::General), vec!["infura", "alchemy", "public"]);
        assert_eq!(p.provider_order(CallClass::Logs), vec!["alchemy", "infura", "public"]);
        assert_eq!(p.split_range_by_provider(100, 300), vec![(100, 300)]);
    }

    #[test]
    fn duplicate_priorities_are_rejected() {
        let entries: Vec<(ProviderDescriptor, Arc<dyn RpcTransport>)> = vec![
            (descriptor("a", 1, None, None), ScriptedTransport::new("a") as Arc<dyn RpcTransport>),
            (descriptor("b", 1, None, None), ScriptedTransport::new("b") as Arc<dyn RpcTransport>),
        ];
        assert!(ChainProvider::new(ChainCode::new("ETH"), 1, entries, test_throttle()).is_err());
    }

    #[tokio::test]
    async fn network_error_falls_back_to_next_provider() {
        let a = ScriptedTransport::new("a");
        let b = ScriptedTransport::new("b");
        a.push(
            "eth_blockNumber",
            Err(ProviderError::new("a", ProviderErrorKind::Network, "reset")),
        );
        b.set("eth_blockNumber", json!("0x10"));
        let p = provider(vec![
            (descriptor("a", 1, None, None), a.clone()),
            (descriptor("b", 2, None, None), b.clone()),
        ]);

        assert_eq!(p.block_number().await.unwrap(), 16);
        assert_eq!(a.calls_to("eth_blockNumber"), 1);
        assert_eq!(b.calls_to("eth_blockNumber"), 1);
        assert_eq!(p.last_seen_block(), 16);
    }

    #[tokio::test]
    async fn business_error_is_not_retried_elsewhere() {
        let a = ScriptedTransport::new("a");
        let b = ScriptedTransport::new("b");
        a.push("eth_sendRawTransaction", Err(rpc_error("a", "nonce too low")));
        b.set("eth_sendRawTransaction", json!(H256::zero()));
        let p = provider(vec![
            (descriptor("a", 1, None, None), a),
            (descriptor("b", 2, None, None), b.clone()),
        ]);

        let err = p.send_raw_transaction(&Bytes::from(vec![1u8])).await.unwrap_err();
        assert!(matches!(err, RelayerError::Provider { .. }));
        assert_eq!(b.calls_to("eth_sendRawTransaction"), 0);
    }

    #[tokio::test]
    async fn all_providers_failing_is_reported() {
        let a = ScriptedTransport::new("a");
        a.push("eth_gasPrice", Err(ProviderError::new("a", ProviderErrorKind::Server, "502")));
        let p = provider(vec![(descriptor("a", 1, None, None), a)]);

        let err = p.gas_price().await.unwrap_err();
        assert!(matches!(err, RelayerError::AllProvidersFailed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn logs_are_chunked_by_provider_cap() {
        let a = ScriptedTransport::new("a");
        a.on("eth_getLogs", |_| Ok(json!([])));
        let p = provider(vec![(descriptor("a", 1, Some(1), Some(95)), a.clone())]);

        p.get_logs(Address::zero(), 100, 300).await.unwrap();
        let ranges: Vec<(String, String)> = a
            .calls()
            .into_iter()
            .filter(|(m, _)| m == "eth_getLogs")
            .map(|(_, params)| {
                (
                    params[0]["fromBlock"].as_str().unwrap().to_string(),
                    params[0]["toBlock"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            ranges,
            vec![
                ("0x64".to_string(), "0xc2".to_string()),
                ("0xc3".to_string(), "0x121".to_string()),
                ("0x122".to_string(), "0x12c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_window_is_resplit_to_safe_span() {
        let big = ScriptedTransport::new("big");
        let small = ScriptedTransport::new("small");
        big.push(
            "eth_getLogs",
            Err(rpc_error("big", "exceeded maximum block range: 50")),
        );
        big.on("eth_getLogs", |_| Ok(json!([])));
        let p = provider(vec![
            (descriptor("big", 1, Some(1), Some(200)), big.clone()),
            (descriptor("small", 2, Some(2), Some(50)), small.clone()),
        ]);

        p.get_logs(Address::zero(), 1, 200).await.unwrap();
        // one rejected window plus four windows of 50 blocks
        assert_eq!(big.calls_to("eth_getLogs"), 5);
        assert_eq!(small.calls_to("eth_getLogs"), 0);
    }

    #[tokio::test]
    async fn log_fallback_resumes_from_unfetched_block() {
        let a = ScriptedTransport::new("a");
        let b = ScriptedTransport::new("b");
        a.push("eth_getLogs", Ok(json!([])));
        a.push("eth_getLogs", Err(ProviderError::new("a", ProviderErrorKind::Timeout, "timeout")));
        b.on("eth_getLogs", |_| Ok(json!([])));
        let p = provider(vec![
            (descriptor("a", 1, Some(1), Some(10)), a.clone()),
            (descriptor("b", 2, Some(2), None), b.clone()),
        ]);

        p.get_logs(Address::zero(), 1, 30).await.unwrap();
        let b_calls = b.calls();
        assert_eq!(b_calls.len(), 1);
        assert_eq!(b_calls[0].1[0]["fromBlock"], "0xb");
        assert_eq!(b_calls[0].1[0]["toBlock"], "0x1e");
    }
}
