//! Discovery of new relay work on both sides of the bridge

use crate::chain::ChainRegistry;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{names, CachedEvent, EventCache, EventQuery};
use crate::fio::FioLedger;
use crate::jobs::JobQueue;
use crate::state::StateManager;
use crate::types::{ActionType, AssetType, ChainCode, OracleLedgerItem, Payload, QueueItem};

use ethers::types::{Address, U256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reads the oracle ledger and queues new wraps per chain and asset
pub struct WrapPoller {
    ledger: Arc<dyn FioLedger>,
    registry: Arc<ChainRegistry>,
    state: Arc<StateManager>,
    queue: Arc<JobQueue>,
}

impl WrapPoller {
    pub fn new(
        ledger: Arc<dyn FioLedger>,
        registry: Arc<ChainRegistry>,
        state: Arc<StateManager>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            ledger,
            registry,
            state,
            queue,
        }
    }

    /// One pass over the ledger. Returns the number of items queued.
    ///
    /// Without a persisted cursor the pass only records the current highest
    /// id; older rows are left to the reconciler.
    pub async fn poll(&self) -> RelayerResult<usize> {
        let rows = self.ledger.oracle_ledger().await?;
        let mut queued = 0;

        for chain in self.registry.chains() {
            for asset in self.registry.assets(&chain) {
                queued += self.poll_slice(&rows, &chain, asset).await?;
            }
        }
        Ok(queued)
    }

    async fn poll_slice(
        &self,
        rows: &[OracleLedgerItem],
        chain: &ChainCode,
        asset: AssetType,
    ) -> RelayerResult<usize> {
        let cursor_path = self.state.ledger_cursor_path(chain, asset);
        let mut slice: Vec<&OracleLedgerItem> = rows
            .iter()
            .filter(|row| ChainCode::new(&row.chaincode) == *chain && row.asset() == asset)
            .collect();
        slice.sort_by_key(|row| row.id);
        let Some(highest) = slice.last().map(|row| row.id) else {
            return Ok(0);
        };

        let Some(cursor) = self.state.read_u64(&cursor_path).await? else {
            info!(chain = %chain, asset = %asset, "Starting wrap cursor at ledger id {}", highest);
            self.state.write_u64(&cursor_path, highest).await?;
            return Ok(0);
        };

        let mut queued = 0;
        for row in slice.into_iter().filter(|row| row.id > cursor) {
            match row.to_queue_item() {
                Some(item) => {
                    if self.queue.enqueue(&item).await? {
                        queued += 1;
                    }
                }
                None => warn!(chain = %chain, "Ledger row {} carries no amount or domain", row.id),
            }
        }

        if highest > cursor {
            self.state.write_u64(&cursor_path, highest).await?;
        }
        Ok(queued)
    }
}

/// Unwrap item for an `unwrapped` event; the chain transaction hash is the obt id
pub fn unwrap_item(
    chain: &ChainCode,
    asset: AssetType,
    event: &CachedEvent,
) -> RelayerResult<QueueItem> {
    let malformed = |field: &str| {
        RelayerError::EventParsing(format!(
            "unwrapped event {} without {}",
            event.transaction_hash, field
        ))
    };
    let fio_address = event
        .value_str("fioaddress")
        .ok_or_else(|| malformed("fioaddress"))?
        .to_string();

    let payload = match asset {
        AssetType::Tokens => {
            let raw = event.value_str("amount").ok_or_else(|| malformed("amount"))?;
            Payload::Tokens {
                amount: U256::from_dec_str(raw).map_err(|_| malformed("a decimal amount"))?,
                target_address: fio_address,
            }
        }
        AssetType::Nft => Payload::Nft {
            name: event.value_str("domain").ok_or_else(|| malformed("domain"))?.to_string(),
            target_address: fio_address,
        },
    };

    Ok(QueueItem {
        obt_id: event.transaction_hash.to_ascii_lowercase(),
        chain_code: chain.clone(),
        action: ActionType::Unwrap,
        asset,
        payload,
    })
}

/// Turns cached `unwrapped` events into unwrap queue items
pub struct UnwrapPoller {
    events: Arc<EventCache>,
    state: Arc<StateManager>,
    queue: Arc<JobQueue>,
}

impl UnwrapPoller {
    pub fn new(events: Arc<EventCache>, state: Arc<StateManager>, queue: Arc<JobQueue>) -> Self {
        Self { events, state, queue }
    }

    pub async fn poll(&self, chain: &ChainCode, asset: AssetType) -> RelayerResult<usize> {
        let cursor_path = self.state.unwrap_block_path(chain, asset);
        let cursor = self.state.read_u64(&cursor_path).await?;

        let mut fresh: Vec<CachedEvent> = self
            .events
            .get_cached_events(chain, asset, &EventQuery::named(names::UNWRAPPED))
            .into_iter()
            .filter(|e| cursor.map_or(true, |c| e.block_number > c))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        fresh.sort_by_key(|e| (e.block_number, e.log_index));

        let mut queued = 0;
        let mut highest = cursor.unwrap_or_default();
        for event in &fresh {
            match unwrap_item(chain, asset, event) {
                Ok(item) => {
                    if self.queue.enqueue(&item).await? {
                        queued += 1;
                    }
                }
                Err(e) => warn!(chain = %chain, asset = %asset, "Skipping unwrap: {}", e),
            }
            highest = highest.max(event.block_number);
        }

        self.state.write_u64(&cursor_path, highest).await?;
        debug!(chain = %chain, asset = %asset, "Unwrap cursor at block {}", highest);
        Ok(queued)
    }
}

/// Queues burns for wrapped domains that expired past the grace period
pub struct BurnPoller {
    ledger: Arc<dyn FioLedger>,
    registry: Arc<ChainRegistry>,
    queue: Arc<JobQueue>,
    /// Address used for view calls
    oracle: Address,
    grace_secs: i64,
}

impl BurnPoller {
    pub fn new(
        ledger: Arc<dyn FioLedger>,
        registry: Arc<ChainRegistry>,
        queue: Arc<JobQueue>,
        oracle: Address,
        grace_secs: i64,
    ) -> Self {
        Self {
            ledger,
            registry,
            queue,
            oracle,
            grace_secs,
        }
    }

    pub async fn poll(&self, now: i64) -> RelayerResult<usize> {
        let expired: Vec<_> = self
            .ledger
            .wrapped_domains()
            .await?
            .into_iter()
            .filter(|d| d.expiration + self.grace_secs < now)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        debug!("{} wrapped domains past the burn grace period", expired.len());

        let mut queued = 0;
        for chain in self.registry.chains() {
            let Ok(contract) = self.registry.contract(&chain, AssetType::Nft) else {
                continue;
            };
            let provider = self.registry.provider(&chain)?;

            for domain in &expired {
                let data = contract.token_id_calldata(&domain.name)?;
                let output = provider.call(self.oracle, contract.address(), &data).await?;
                let token_id = contract.decode_token_id(&output)?;
                if token_id.is_zero() {
                    continue;
                }

                let item = QueueItem {
                    obt_id: domain.id.to_string(),
                    chain_code: chain.clone(),
                    action: ActionType::Burn,
                    asset: AssetType::Nft,
                    payload: Payload::Burn {
                        token_id,
                        name: domain.name.clone(),
                    },
                };
                if self.queue.enqueue(&item).await? {
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fio::{DomainRecord, MockFioLedger};
    use crate::jobs::QueueKey;
    use crate::test_utils::{chain_config, registry_with, ScriptedTransport};
    use ethers::abi::{encode, Token};
    use serde_json::json;

    struct Env {
        _dir: tempfile::TempDir,
        state: Arc<StateManager>,
        queue: Arc<JobQueue>,
        registry: Arc<ChainRegistry>,
        transport: Arc<ScriptedTransport>,
    }

    async fn env() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateManager::new(dir.path()).await.unwrap());
        let transport = ScriptedTransport::new("rpc");
        Env {
            queue: Arc::new(JobQueue::new(state.clone())),
            registry: registry_with(chain_config("POL", true), transport.clone()),
            _dir: dir,
            state,
            transport,
        }
    }

    fn row(id: u64, chain: &str, amount: Option<u64>, nft: Option<&str>) -> OracleLedgerItem {
        OracleLedgerItem {
            id,
            chaincode: chain.into(),
            pubaddress: "0x00000000000000000000000000000000000000aa".into(),
            amount,
            nftname: nft.map(str::to_string),
            timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn wrap_poller_queues_rows_past_the_cursor() {
        let e = env().await;
        let pol = ChainCode::new("POL");
        e.state
            .write_u64(&e.state.ledger_cursor_path(&pol, AssetType::Tokens), 10)
            .await
            .unwrap();
        let mut ledger = MockFioLedger::new();
        ledger.expect_oracle_ledger().returning(|| {
            Ok(vec![
                row(9, "POL", Some(1), None),
                row(11, "POL", Some(500), None),
                row(12, "ETH", Some(7), None),
                row(13, "pol", Some(8), None),
            ])
        });
        let poller = WrapPoller::new(
            Arc::new(ledger),
            e.registry.clone(),
            e.state.clone(),
            e.queue.clone(),
        );

        assert_eq!(poller.poll().await.unwrap(), 2);
        let key = QueueKey::new(&pol, ActionType::Wrap, AssetType::Tokens);
        assert_eq!(e.queue.depth(&key).await.unwrap(), 2);
        assert_eq!(
            e.state
                .read_u64(&e.state.ledger_cursor_path(&pol, AssetType::Tokens))
                .await
                .unwrap(),
            Some(13)
        );

        // A second pass over the same ledger adds nothing
        assert_eq!(poller.poll().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wrap_poller_starts_at_the_ledger_head() {
        let e = env().await;
        let mut ledger = MockFioLedger::new();
        ledger
            .expect_oracle_ledger()
            .returning(|| Ok(vec![row(5, "POL", None, Some("dapp"))]));
        let poller = WrapPoller::new(
            Arc::new(ledger),
            e.registry.clone(),
            e.state.clone(),
            e.queue.clone(),
        );

        assert_eq!(poller.poll().await.unwrap(), 0);
        let pol = ChainCode::new("POL");
        assert_eq!(
            e.state
                .read_u64(&e.state.ledger_cursor_path(&pol, AssetType::Nft))
                .await
                .unwrap(),
            Some(5)
        );
    }

    #[test]
    fn unwrapped_event_becomes_unwrap_item() {
        let event = crate::events::sample_event(
            names::UNWRAPPED,
            120,
            json!({ "fioaddress": "alice@fiotestnet", "amount": "500" }),
            0,
        );
        let item = unwrap_item(&ChainCode::new("POL"), AssetType::Tokens, &event).unwrap();
        assert_eq!(item.obt_id, event.transaction_hash);
        assert_eq!(item.action, ActionType::Unwrap);
        assert_eq!(
            item.payload,
            Payload::Tokens {
                amount: U256::from(500u64),
                target_address: "alice@fiotestnet".into()
            }
        );

        let broken =
            crate::events::sample_event(names::UNWRAPPED, 121, json!({ "amount": "5" }), 0);
        assert!(unwrap_item(&ChainCode::new("POL"), AssetType::Tokens, &broken).is_err());
    }

    #[tokio::test]
    async fn burn_poller_resolves_token_ids() {
        let e = env().await;
        e.transport.on("eth_call", |params| {
            let data = params[0]["data"].as_str().unwrap_or_default().to_string();
            // "dapp" is wrapped as token 77, "gone" no longer exists on chain
            let id = if data.contains(&hex::encode("dapp")) { 77u64 } else { 0 };
            Ok(json!(format!("0x{}", hex::encode(encode(&[Token::Uint(U256::from(id))])))))
        });
        let mut ledger = MockFioLedger::new();
        ledger.expect_wrapped_domains().returning(|| {
            let domain = |id: u64, name: &str, expiration: i64| DomainRecord {
                id,
                name: name.into(),
                account: "fio.oracle".into(),
                expiration,
            };
            Ok(vec![
                domain(3, "dapp", 100),
                domain(4, "gone", 100),
                domain(5, "live", 10_000),
            ])
        });
        let poller = BurnPoller::new(
            Arc::new(ledger),
            e.registry.clone(),
            e.queue.clone(),
            Address::zero(),
            1000,
        );

        assert_eq!(poller.poll(5_000).await.unwrap(), 1);
        assert_eq!(e.transport.calls_to("eth_call"), 2);

        let key = QueueKey::new(&ChainCode::new("POL"), ActionType::Burn, AssetType::Nft);
        let head = e
            .state
            .head_line(&e.state.queue_path(&key.chain, key.action, key.asset))
            .await
            .unwrap()
            .unwrap();
        let item = QueueItem::from_line(&head).unwrap();
        assert_eq!(item.obt_id, "3");
        assert_eq!(
            item.payload,
            Payload::Burn { token_id: U256::from(77u64), name: "dapp".into() }
        );
    }
}
