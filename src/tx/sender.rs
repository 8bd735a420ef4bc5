//! Transaction sender with retry logic and stuck transaction replacement

use super::classify::{classify, ErrorClass};
use super::gas::GasPolicy;
use super::nonce::NonceManager;
use super::pending::{record_pending, remove_pending, PendingTransactionRecord};
use crate::chain::{ChainProvider, ChainRegistry};
use crate::config::TransactionConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::StateManager;
use crate::types::{ActionType, AssetType, ChainCode, Payload};

use chrono::Utc;
use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Everything needed to build one contract call
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub chain: ChainCode,
    pub action: ActionType,
    pub asset: AssetType,
    pub obt_id: String,
    pub payload: Payload,
    pub to: Address,
    pub data: Bytes,
    pub gas_limit: u64,
    /// Reuse this nonce instead of issuing a new one
    pub nonce: Option<u64>,
    /// Root hash of the transaction being replaced
    pub replaces: Option<H256>,
    /// Lowest acceptable base price before the replacement bump
    pub gas_price_floor: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { hash: H256, nonce: u64 },
    /// The contract reported the action as already done
    AlreadyCompleted,
}

/// Load the signing key from the named environment variable
pub fn load_wallet(env_name: &str) -> RelayerResult<LocalWallet> {
    let key = std::env::var(env_name)
        .map_err(|_| RelayerError::Wallet(format!("No wallet configured. Set {}", env_name)))?;
    key.trim()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
}

/// Builds, signs and broadcasts contract calls for every chain
pub struct TransactionSender {
    registry: Arc<ChainRegistry>,
    state: Arc<StateManager>,
    nonces: Arc<NonceManager>,
    gas: Arc<GasPolicy>,
    wallet: LocalWallet,
    config: TransactionConfig,
    /// Serializes submissions per chain
    submit_locks: DashMap<ChainCode, Arc<Mutex<()>>>,
}

impl TransactionSender {
    pub fn new(
        registry: Arc<ChainRegistry>,
        state: Arc<StateManager>,
        nonces: Arc<NonceManager>,
        gas: Arc<GasPolicy>,
        wallet: LocalWallet,
        config: TransactionConfig,
    ) -> Self {
        info!("Transaction sender initialized with wallet: {:?}", wallet.address());
        Self {
            registry,
            state,
            nonces,
            gas,
            wallet,
            config,
            submit_locks: DashMap::new(),
        }
    }

    /// Wallet address
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    fn lock_for(&self, chain: &ChainCode) -> Arc<Mutex<()>> {
        self.submit_locks
            .entry(chain.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Submit a contract call, retrying recoverable failures.
    ///
    /// Nonce conflicts move to a fresh nonce, underpriced or reverted sends
    /// raise the gas price, transport failures resend the same transaction.
    /// All of these share one attempt budget. Submissions on one chain are
    /// serialized from the dry run until the transaction is recorded as
    /// pending; waiting for inclusion happens outside that section.
    pub async fn submit(&self, request: SubmitRequest) -> RelayerResult<SubmitOutcome> {
        let provider = self.registry.provider(&request.chain)?;

        let outcome = {
            let lock = self.lock_for(&request.chain);
            let _guard = lock.lock().await;
            self.broadcast(&provider, &request).await?
        };

        if let SubmitOutcome::Submitted { hash, .. } = outcome {
            self.wait_for_inclusion(&provider, &request.chain, hash).await?;
        }
        Ok(outcome)
    }

    async fn broadcast(
        &self,
        provider: &ChainProvider,
        request: &SubmitRequest,
    ) -> RelayerResult<SubmitOutcome> {
        let chain = &request.chain;

        // Replacements keep the nonce of a transaction already in flight
        if request.replaces.is_none() {
            if let Some(outcome) = self.dry_run(provider, request).await? {
                return Ok(outcome);
            }
        }

        if let Some(fixed) = request.nonce {
            let mut nonce = fixed;
            return self.send_with_retries(provider, request, &mut nonce).await;
        }

        let mut nonce = self.nonces.next_nonce(chain).await?;
        let result = self.send_with_retries(provider, request, &mut nonce).await;
        if !matches!(result, Ok(SubmitOutcome::Submitted { .. })) {
            // Nothing reached a mempool under this nonce
            if let Err(e) = self.nonces.release(chain, nonce).await {
                warn!(chain = %chain, "Could not release nonce {}: {}", nonce, e);
            }
        }
        result
    }

    /// Static call of the contract method from the oracle wallet. Returns an
    /// outcome when the call shows the action needs no transaction.
    async fn dry_run(
        &self,
        provider: &ChainProvider,
        request: &SubmitRequest,
    ) -> RelayerResult<Option<SubmitOutcome>> {
        let err = match provider.call(self.address(), request.to, &request.data).await {
            Ok(_) => return Ok(None),
            Err(e) => e,
        };

        match classify(&err) {
            ErrorClass::AlreadyCompleted => {
                info!(
                    chain = %request.chain,
                    obt_id = %request.obt_id,
                    "Already completed on chain: {}",
                    err
                );
                crate::metrics::record_already_completed(
                    request.chain.as_str(),
                    request.action.as_str(),
                );
                Ok(Some(SubmitOutcome::AlreadyCompleted))
            }
            ErrorClass::Reverted | ErrorClass::NonRetryable => {
                error!(
                    chain = %request.chain,
                    obt_id = %request.obt_id,
                    "Dry run rejected: {}",
                    err
                );
                crate::metrics::record_tx_failed(request.chain.as_str());
                Err(RelayerError::Transaction(format!(
                    "{} {} for obt_id {} would revert: {}",
                    request.action, request.asset, request.obt_id, err
                )))
            }
            class => {
                warn!(
                    chain = %request.chain,
                    obt_id = %request.obt_id,
                    "Dry run inconclusive ({:?}), sending anyway: {}",
                    class,
                    err
                );
                Ok(None)
            }
        }
    }

    /// The attempt loop. `nonce` tracks the nonce currently in use so the
    /// caller can hand it back when nothing was sent.
    async fn send_with_retries(
        &self,
        provider: &ChainProvider,
        request: &SubmitRequest,
        nonce: &mut u64,
    ) -> RelayerResult<SubmitOutcome> {
        let chain = &request.chain;
        let operation = format!(
            "{} {} on {} for obt_id {}",
            request.action, request.asset, chain, request.obt_id
        );

        let mut gas_price = self.gas.base_price(chain).await?;
        if request.replaces.is_some() {
            let floor = request.gas_price_floor.unwrap_or_default();
            gas_price = self.gas.for_replacement(gas_price.max(floor));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error: Option<RelayerError> = None;
        // Sends whose delivery the node never confirmed or denied
        let mut unconfirmed: Vec<(H256, u64, U256)> = Vec::new();

        for attempt in 1..=max_attempts {
            let (raw, local_hash) = self.sign(request, provider.chain_id(), *nonce, gas_price)?;
            debug!(
                chain = %chain,
                obt_id = %request.obt_id,
                nonce = *nonce,
                %gas_price,
                "Sending {} (attempt {}/{})",
                operation,
                attempt,
                max_attempts
            );

            let err = match provider.send_raw_transaction(&raw).await {
                Ok(hash) => {
                    if hash != local_hash {
                        warn!(
                            chain = %chain,
                            "Node returned hash {:?}, expected {:?}",
                            hash,
                            local_hash
                        );
                    }
                    return self.record_sent(request, hash, *nonce, gas_price).await;
                }
                Err(e) => e,
            };

            let class = classify(&err);
            match class {
                ErrorClass::AlreadyCompleted => {
                    info!(
                        chain = %chain,
                        obt_id = %request.obt_id,
                        "Already completed on chain: {}",
                        err
                    );
                    crate::metrics::record_already_completed(
                        chain.as_str(),
                        request.action.as_str(),
                    );
                    return Ok(SubmitOutcome::AlreadyCompleted);
                }
                ErrorClass::NonceConflict => {
                    if provider.get_transaction(local_hash).await.ok().flatten().is_some() {
                        // This exact transaction already reached the mempool
                        return self
                            .record_sent(request, local_hash, *nonce, gas_price)
                            .await;
                    }
                    if request.nonce.is_some() {
                        return Err(RelayerError::Nonce {
                            chain: chain.to_string(),
                            message: format!("nonce {} already used: {}", nonce, err),
                        });
                    }
                    *nonce = self.nonces.bump_after_conflict(chain, *nonce).await?;
                }
                c if c.raises_gas() => gas_price = self.gas.for_retry(gas_price),
                ErrorClass::Network
                | ErrorClass::RateLimited
                | ErrorClass::ServerError
                | ErrorClass::AuthFailure => unconfirmed.push((local_hash, *nonce, gas_price)),
                _ => {
                    error!(
                        chain = %chain,
                        obt_id = %request.obt_id,
                        "Submission rejected: {}",
                        err
                    );
                    crate::metrics::record_tx_failed(chain.as_str());
                    return Err(err);
                }
            }

            warn!(
                chain = %chain,
                obt_id = %request.obt_id,
                "Attempt {}/{} failed ({:?}): {}",
                attempt,
                max_attempts,
                class,
                err
            );
            last_error = Some(err);

            if attempt < max_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        // A send that timed out may still have been accepted
        for (hash, sent_nonce, sent_price) in unconfirmed.into_iter().rev() {
            if provider.get_transaction(hash).await.ok().flatten().is_some() {
                *nonce = sent_nonce;
                return self.record_sent(request, hash, sent_nonce, sent_price).await;
            }
        }

        crate::metrics::record_tx_failed(chain.as_str());
        Err(RelayerError::RetriesExhausted {
            operation,
            attempts: max_attempts,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Resend a stuck transaction with the same nonce and a higher price
    pub async fn replace(&self, record: &PendingTransactionRecord) -> RelayerResult<SubmitOutcome> {
        let outcome = self
            .submit(SubmitRequest {
                chain: record.chain_code.clone(),
                action: record.action_type,
                asset: record.asset_type,
                obt_id: record.obt_id.clone(),
                payload: record.payload.clone(),
                to: record.to,
                data: record.data.clone(),
                gas_limit: record.gas_limit,
                nonce: Some(record.nonce),
                replaces: Some(record.root_hash()),
                gas_price_floor: record.gas_price,
            })
            .await?;

        if matches!(outcome, SubmitOutcome::Submitted { .. }) {
            crate::metrics::record_tx_replaced(record.chain_code.as_str());
        }
        Ok(outcome)
    }

    fn sign(
        &self,
        request: &SubmitRequest,
        chain_id: u64,
        nonce: u64,
        gas_price: U256,
    ) -> RelayerResult<(Bytes, H256)> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(request.to)
            .data(request.data.clone())
            .nonce(nonce)
            .gas(request.gas_limit)
            .gas_price(gas_price)
            .chain_id(chain_id)
            .into();

        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let signature = wallet
            .sign_transaction_sync(&tx)
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        Ok((raw, hash))
    }

    /// Log a broadcast transaction as pending and in the transaction log
    async fn record_sent(
        &self,
        request: &SubmitRequest,
        hash: H256,
        nonce: u64,
        gas_price: U256,
    ) -> RelayerResult<SubmitOutcome> {
        let record = PendingTransactionRecord {
            tx_hash: hash,
            original_tx_hash: request.replaces,
            chain_code: request.chain.clone(),
            action_type: request.action,
            asset_type: request.asset,
            obt_id: request.obt_id.clone(),
            payload: request.payload.clone(),
            nonce,
            submitted_at: Utc::now().timestamp(),
            is_replacement: request.replaces.is_some(),
            to: request.to,
            data: request.data.clone(),
            gas_limit: request.gas_limit,
            gas_price: Some(gas_price),
        };
        record_pending(&self.state, &record).await?;

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "chain": request.chain,
            "action": request.action,
            "asset": request.asset,
            "obtId": request.obt_id,
            "txHash": format!("{:?}", hash),
            "nonce": nonce,
            "gasPrice": gas_price.to_string(),
            "replaces": request.replaces.map(|h| format!("{:?}", h)),
        });
        self.state
            .append_line(&self.state.tx_log_path(&request.chain), &entry.to_string())
            .await?;

        crate::metrics::record_tx_submitted(request.chain.as_str(), request.action.as_str());
        info!(
            chain = %request.chain,
            obt_id = %request.obt_id,
            nonce,
            "Transaction sent: {:?}",
            hash
        );

        Ok(SubmitOutcome::Submitted { hash, nonce })
    }

    /// Poll until the transaction is mined or the confirmation timeout passes.
    /// A mined transaction leaves the pending log.
    async fn wait_for_inclusion(
        &self,
        provider: &ChainProvider,
        chain: &ChainCode,
        hash: H256,
    ) -> RelayerResult<bool> {
        if self.config.confirmation_timeout_secs == 0 {
            return Ok(false);
        }

        let poll = Duration::from_millis(self.config.confirmation_poll_ms.max(1));
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.confirmation_timeout_secs);

        while tokio::time::Instant::now() < deadline {
            match provider.get_transaction(hash).await {
                Ok(Some(tx)) if !tx["blockNumber"].is_null() => {
                    remove_pending(&self.state, chain, hash).await?;
                    debug!(chain = %chain, "Transaction {:?} mined", hash);
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) => warn!(chain = %chain, "Confirmation poll failed: {}", e),
            }
            tokio::time::sleep(poll).await;
        }

        warn!(
            chain = %chain,
            "Transaction {:?} not mined yet, leaving it to the pending sweep",
            hash
        );
        Ok(false)
    }

    /// Native balance of the wallet on a chain
    pub async fn balance(&self, chain: &ChainCode) -> RelayerResult<U256> {
        self.registry.provider(chain)?.balance(self.address()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{GasConfig, GasPriceMode, GasTier};
    use crate::test_utils::{chain_config, registry_with, rpc_error, ScriptedTransport, TEST_KEY};
    use crate::tx::gas::{GasPriceSource, RpcGasPriceSource};
    use crate::tx::pending::load_pending;
    use serde_json::Value;

    pub(crate) struct Harness {
        pub _dir: tempfile::TempDir,
        pub state: Arc<StateManager>,
        pub registry: Arc<ChainRegistry>,
        pub transport: Arc<ScriptedTransport>,
        pub sender: Arc<TransactionSender>,
    }

    pub(crate) fn tx_config() -> TransactionConfig {
        TransactionConfig {
            max_attempts: 3,
            retry_delay_ms: 0,
            confirmation_timeout_secs: 0,
            confirmation_poll_ms: 10,
            drop_timeout_secs: 300,
            max_pending_age_secs: 1800,
        }
    }

    /// Sender over a scripted chain quoting 100 wei gas at nonce 3
    pub(crate) async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateManager::new(dir.path()).await.unwrap());
        let transport = ScriptedTransport::new("rpc");
        transport.set("eth_getTransactionCount", serde_json::json!("0x3"));
        transport.set("eth_gasPrice", serde_json::json!("0x64"));
        transport.set("eth_getTransactionByHash", Value::Null);
        transport.set(
            "eth_sendRawTransaction",
            serde_json::json!(H256::from_low_u64_be(0xabc)),
        );
        transport.set("eth_call", serde_json::json!("0x"));
        let registry = registry_with(chain_config("POL", true), transport.clone());

        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let nonces = Arc::new(NonceManager::new(
            registry.clone(),
            state.clone(),
            wallet.address(),
        ));
        let gas_config = GasConfig {
            mode: GasPriceMode::Api,
            tier: GasTier::Average,
            fixed_gwei: None,
            low_multiplier: 1.0,
            average_multiplier: 1.0,
            high_multiplier: 1.0,
            retry_multiplier: 1.2,
            replacement_multiplier: 1.5,
        };
        let sources: Vec<Arc<dyn GasPriceSource>> =
            vec![Arc::new(RpcGasPriceSource::new(registry.clone()))];
        let gas = Arc::new(GasPolicy::new(&gas_config, sources));
        let sender = Arc::new(TransactionSender::new(
            registry.clone(),
            state.clone(),
            nonces,
            gas,
            wallet,
            tx_config(),
        ));

        Harness {
            _dir: dir,
            state,
            registry,
            transport,
            sender,
        }
    }

    pub(crate) fn wrap_request() -> SubmitRequest {
        SubmitRequest {
            chain: ChainCode::new("POL"),
            action: ActionType::Wrap,
            asset: AssetType::Tokens,
            obt_id: "42".into(),
            payload: Payload::Tokens {
                amount: U256::from(500u64),
                target_address: "0x00000000000000000000000000000000000000aa".into(),
            },
            to: Address::from_low_u64_be(1),
            data: Bytes::from(vec![0xde, 0xad]),
            gas_limit: 400_000,
            nonce: None,
            replaces: None,
            gas_price_floor: None,
        }
    }

    #[tokio::test]
    async fn successful_submission_is_logged_and_pending() {
        let h = harness().await;
        let outcome = h.sender.submit(wrap_request()).await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Submitted {
                hash: H256::from_low_u64_be(0xabc),
                nonce: 3
            }
        );

        let pol = ChainCode::new("POL");
        let pending = load_pending(&h.state, &pol).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].nonce, 3);
        assert_eq!(pending[0].gas_price, Some(U256::from(100u64)));
        assert_eq!(h.state.line_count(&h.state.tx_log_path(&pol)).await.unwrap(), 1);
        assert_eq!(h.state.read_u64(&h.state.nonce_path(&pol)).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn nonce_conflict_moves_to_next_nonce() {
        let h = harness().await;
        h.transport
            .push("eth_sendRawTransaction", Err(rpc_error("rpc", "nonce too low")));

        let outcome = h.sender.submit(wrap_request()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted { nonce: 4, .. }));
        assert_eq!(h.transport.calls_to("eth_sendRawTransaction"), 2);
    }

    #[tokio::test]
    async fn already_completed_counts_as_success() {
        let h = harness().await;
        h.transport.push(
            "eth_call",
            Err(rpc_error("rpc", "execution reverted: Obtid already complete")),
        );

        assert_eq!(
            h.sender.submit(wrap_request()).await.unwrap(),
            SubmitOutcome::AlreadyCompleted
        );
        let pol = ChainCode::new("POL");
        assert_eq!(h.transport.calls_to("eth_sendRawTransaction"), 0);
        assert!(load_pending(&h.state, &pol).await.unwrap().is_empty());
        assert_eq!(h.state.read_u64(&h.state.nonce_path(&pol)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dry_run_revert_fails_without_using_a_nonce() {
        let h = harness().await;
        h.transport.push(
            "eth_call",
            Err(rpc_error("rpc", "execution reverted: Invalid oracle")),
        );

        let err = h.sender.submit(wrap_request()).await.unwrap_err();
        assert!(matches!(err, RelayerError::Transaction(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.transport.calls_to("eth_sendRawTransaction"), 0);
        assert_eq!(
            h.state.read_u64(&h.state.nonce_path(&ChainCode::new("POL"))).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn inconclusive_dry_run_still_sends() {
        let h = harness().await;
        h.transport.push("eth_call", Err(rpc_error("rpc", "header not found")));

        let outcome = h.sender.submit(wrap_request()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted { nonce: 3, .. }));
    }

    #[tokio::test]
    async fn completion_reported_at_send_releases_the_nonce() {
        let h = harness().await;
        h.transport.push(
            "eth_sendRawTransaction",
            Err(rpc_error("rpc", "execution reverted: Obtid already complete")),
        );

        assert_eq!(
            h.sender.submit(wrap_request()).await.unwrap(),
            SubmitOutcome::AlreadyCompleted
        );
        let outcome = h.sender.submit(wrap_request()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted { nonce: 3, .. }));
    }

    #[tokio::test]
    async fn underpriced_send_raises_gas() {
        let h = harness().await;
        h.transport.push(
            "eth_sendRawTransaction",
            Err(rpc_error("rpc", "transaction underpriced")),
        );

        h.sender.submit(wrap_request()).await.unwrap();
        let pending = load_pending(&h.state, &ChainCode::new("POL")).await.unwrap();
        assert_eq!(pending[0].gas_price, Some(U256::from(120u64)));
        assert_eq!(pending[0].nonce, 3);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let h = harness().await;
        h.transport.push(
            "eth_sendRawTransaction",
            Err(rpc_error("rpc", "insufficient funds for gas * price + value")),
        );

        assert!(h.sender.submit(wrap_request()).await.is_err());
        assert_eq!(h.transport.calls_to("eth_sendRawTransaction"), 1);
    }

    #[tokio::test]
    async fn rejected_send_leaves_no_nonce_gap() {
        let h = harness().await;
        let pol = ChainCode::new("POL");
        h.transport.push(
            "eth_sendRawTransaction",
            Err(rpc_error("rpc", "insufficient funds for gas * price + value")),
        );

        assert!(h.sender.submit(wrap_request()).await.is_err());
        assert_eq!(h.state.read_u64(&h.state.nonce_path(&pol)).await.unwrap(), Some(2));

        let outcome = h.sender.submit(wrap_request()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted { nonce: 3, .. }));
        assert_eq!(load_pending(&h.state, &pol).await.unwrap()[0].nonce, 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let h = harness().await;
        h.transport.on("eth_sendRawTransaction", |_| {
            Err(rpc_error("rpc", "transaction underpriced"))
        });

        let err = h.sender.submit(wrap_request()).await.unwrap_err();
        assert!(matches!(err, RelayerError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(h.transport.calls_to("eth_sendRawTransaction"), 3);

        // The exhausted nonce is reused by the next submission
        h.transport.push(
            "eth_sendRawTransaction",
            Ok(serde_json::json!(H256::from_low_u64_be(0xabc))),
        );
        let outcome = h.sender.submit(wrap_request()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted { nonce: 3, .. }));
    }

    #[tokio::test]
    async fn timed_out_send_found_in_mempool_counts_as_sent() {
        let h = harness().await;
        h.transport.on("eth_sendRawTransaction", |_| {
            Err(rpc_error("rpc", "503 service unavailable"))
        });
        h.transport.set(
            "eth_getTransactionByHash",
            serde_json::json!({ "blockNumber": null }),
        );

        let outcome = h.sender.submit(wrap_request()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted { nonce: 3, .. }));
        let pol = ChainCode::new("POL");
        assert_eq!(load_pending(&h.state, &pol).await.unwrap().len(), 1);
        assert_eq!(h.state.read_u64(&h.state.nonce_path(&pol)).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn concurrent_submissions_get_distinct_nonces() {
        let h = harness().await;
        let mut first = wrap_request();
        first.obt_id = "1".into();
        let mut second = wrap_request();
        second.obt_id = "2".into();

        let (a, b) = tokio::join!(h.sender.submit(first), h.sender.submit(second));
        let mut nonces = vec![a.unwrap(), b.unwrap()]
            .into_iter()
            .map(|outcome| match outcome {
                SubmitOutcome::Submitted { nonce, .. } => nonce,
                SubmitOutcome::AlreadyCompleted => panic!("unexpected completion"),
            })
            .collect::<Vec<_>>();
        nonces.sort();
        assert_eq!(nonces, vec![3, 4]);
        assert_eq!(load_pending(&h.state, &ChainCode::new("POL")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn already_known_transaction_is_treated_as_sent() {
        let h = harness().await;
        h.transport
            .push("eth_sendRawTransaction", Err(rpc_error("rpc", "already known")));
        h.transport
            .push("eth_getTransactionByHash", Ok(serde_json::json!({ "blockNumber": null })));

        let outcome = h.sender.submit(wrap_request()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted { nonce: 3, .. }));
        assert_eq!(h.transport.calls_to("eth_sendRawTransaction"), 1);
    }
}
