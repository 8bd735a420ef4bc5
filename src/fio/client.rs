//! HTTP client for the native ledger API servers

use super::consensus::{majority_count, trusted_servers, ServerStatus};
use super::{
    actions, ActionRequest, DomainRecord, FioLedger, LedgerAction, LedgerSigner, UnwrapAction,
};
use crate::config::FioConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::tx::classify::collect_error_text;
use crate::types::OracleLedgerItem;

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ORACLE_TABLE: &str = "oracleldgrs";
const ADDRESS_CONTRACT: &str = "fio.address";
const DOMAINS_TABLE: &str = "domains";

fn http_client(timeout: Duration) -> RelayerResult<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(16)
        .connect_timeout(Duration::from_secs(5))
        .timeout(timeout)
        .build()
        .map_err(|e| RelayerError::Config(format!("Failed to build HTTP client: {}", e)))
}

async fn post_json(http: &reqwest::Client, url: &str, body: &Value) -> RelayerResult<Value> {
    let response = http
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| RelayerError::Ledger(format!("{}: {}", url, e)))?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|e| {
            RelayerError::Ledger(format!(
                "{} returned {} with unreadable body: {}",
                url, status, e
            ))
        })?;

    if !status.is_success() {
        return Err(RelayerError::Ledger(format!(
            "{} returned {}: {}",
            url,
            status,
            collect_error_text(&payload)
        )));
    }
    Ok(payload)
}

/// Parse a ledger timestamp such as `2024-03-01T12:00:00.500`, always UTC
pub fn parse_block_time(raw: &str) -> RelayerResult<i64> {
    NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| Utc.from_utc_datetime(&t).timestamp())
        .map_err(|e| RelayerError::Ledger(format!("bad block time {}: {}", raw, e)))
}

/// Integers arrive as JSON numbers or, when large, as strings
fn as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Oracle ledger rows use `""` and `0` for the unused asset column
fn ledger_item_from_row(row: &Value) -> RelayerResult<OracleLedgerItem> {
    let malformed = || RelayerError::Ledger(format!("malformed oracle ledger row {}", row));
    let nftname = row["nftname"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let amount = as_u64(&row["amount"]).filter(|a| *a > 0 && nftname.is_none());

    Ok(OracleLedgerItem {
        id: as_u64(&row["id"]).ok_or_else(malformed)?,
        chaincode: row["chaincode"].as_str().ok_or_else(malformed)?.to_string(),
        pubaddress: row["pubaddress"].as_str().ok_or_else(malformed)?.to_string(),
        amount,
        nftname,
        timestamp: as_i64(&row["timestamp"]).ok_or_else(malformed)?,
    })
}

fn domain_from_row(row: &Value) -> RelayerResult<DomainRecord> {
    let malformed = || RelayerError::Ledger(format!("malformed domain row {}", row));
    Ok(DomainRecord {
        id: as_u64(&row["id"]).ok_or_else(malformed)?,
        name: row["name"].as_str().ok_or_else(malformed)?.to_string(),
        account: row["account"].as_str().ok_or_else(malformed)?.to_string(),
        expiration: as_i64(&row["expiration"]).ok_or_else(malformed)?,
    })
}

/// Unwrap action from a history entry, if it is one of ours
fn unwrap_from_history(entry: &Value, oracle_contract: &str, actor: &str) -> Option<LedgerAction> {
    let act = &entry["action_trace"]["act"];
    let name = act["name"].as_str()?;
    if act["account"].as_str()? != oracle_contract
        || (name != actions::UNWRAP_TOKENS && name != actions::UNWRAP_DOMAIN)
    {
        return None;
    }
    let data = &act["data"];
    if data["actor"].as_str()? != actor {
        return None;
    }

    Some(LedgerAction {
        name: name.to_string(),
        obt_id: data["obt_id"].as_str()?.to_string(),
        amount: as_u64(&data["amount"]),
        fio_domain: data["fio_domain"].as_str().map(str::to_string),
        block_time: entry["block_time"]
            .as_str()
            .and_then(|t| parse_block_time(t).ok())
            .unwrap_or_default(),
    })
}

/// Dataset reported by the agreeing majority of servers
pub fn select_majority(results: Vec<(String, Vec<Value>)>) -> RelayerResult<Vec<Value>> {
    let counts: Vec<(String, usize)> = results
        .iter()
        .map(|(url, rows)| (url.clone(), rows.len()))
        .collect();
    let agreed = majority_count(&counts)?;
    results
        .into_iter()
        .find(|(_, rows)| rows.len() == agreed)
        .map(|(_, rows)| rows)
        .ok_or_else(|| RelayerError::ConsensusFailure("no dataset of agreed size".into()))
}

#[derive(Debug, Clone, Default)]
struct TableQuery {
    code: String,
    scope: String,
    table: String,
    index_position: Option<String>,
    key_type: Option<String>,
    lower_bound: Option<String>,
    upper_bound: Option<String>,
}

/// Multi-server native ledger client
pub struct FioHttpClient {
    http: reqwest::Client,
    config: FioConfig,
    signer: Arc<dyn LedgerSigner>,
}

impl FioHttpClient {
    pub fn new(config: &FioConfig, signer: Arc<dyn LedgerSigner>) -> RelayerResult<Self> {
        if config.servers.is_empty() {
            return Err(RelayerError::Config("No FIO API servers configured".into()));
        }
        Ok(Self {
            http: http_client(Duration::from_secs(config.request_timeout_secs))?,
            config: config.clone(),
            signer,
        })
    }

    fn url(server: &str, path: &str) -> String {
        format!("{}{}", server.trim_end_matches('/'), path)
    }

    pub async fn get_info(&self, server: &str) -> RelayerResult<ServerStatus> {
        let info =
            post_json(&self.http, &Self::url(server, "/v1/chain/get_info"), &json!({})).await?;
        let head_block_num = as_u64(&info["head_block_num"]).ok_or_else(|| {
            RelayerError::Ledger(format!("{} get_info without head_block_num", server))
        })?;
        let head_block_time =
            parse_block_time(info["head_block_time"].as_str().unwrap_or_default())?;
        Ok(ServerStatus {
            url: server.to_string(),
            head_block_num,
            head_block_time,
        })
    }

    /// Servers whose reads may be used right now
    pub async fn trusted(&self) -> RelayerResult<Vec<ServerStatus>> {
        let results = join_all(self.config.servers.iter().map(|s| self.get_info(s))).await;
        let statuses: Vec<ServerStatus> = results
            .into_iter()
            .filter_map(|r| match r {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("FIO server unavailable: {}", e);
                    None
                }
            })
            .collect();

        let trusted = trusted_servers(
            &statuses,
            Utc::now().timestamp(),
            self.config.max_head_block_age_secs,
            self.config.sync_tolerance_blocks,
        );
        if trusted.is_empty() {
            return Err(RelayerError::ConsensusFailure(
                "no FIO server is fresh or in sync".into(),
            ));
        }
        debug!("Trusted FIO servers: {:?}", trusted.iter().map(|s| &s.url).collect::<Vec<_>>());
        Ok(trusted)
    }

    async fn get_table_rows_all(
        &self,
        server: &str,
        query: &TableQuery,
    ) -> RelayerResult<Vec<Value>> {
        let url = Self::url(server, "/v1/chain/get_table_rows");
        let mut rows = Vec::new();
        let mut lower = query.lower_bound.clone().unwrap_or_default();

        loop {
            let mut body = json!({
                "code": query.code,
                "scope": query.scope,
                "table": query.table,
                "json": true,
                "limit": self.config.table_page_size,
                "lower_bound": lower,
                "upper_bound": query.upper_bound.clone().unwrap_or_default(),
                "reverse": false,
            });
            if let (Some(index), Some(key_type)) = (&query.index_position, &query.key_type) {
                body["index_position"] = json!(index);
                body["key_type"] = json!(key_type);
            }

            let page = post_json(&self.http, &url, &body).await?;
            let page_rows = page["rows"].as_array().cloned().unwrap_or_default();
            let last_id = page_rows.last().and_then(|r| as_u64(&r["id"]));
            let fetched = page_rows.len();
            rows.extend(page_rows);

            let more = match &page["more"] {
                Value::Bool(b) => *b,
                Value::String(s) => !s.is_empty(),
                _ => false,
            };
            if !more || fetched == 0 {
                break;
            }

            lower = match page["next_key"].as_str().filter(|k| !k.is_empty()) {
                Some(next) => next.to_string(),
                None => match last_id {
                    Some(id) => (id + 1).to_string(),
                    None => break,
                },
            };
        }

        Ok(rows)
    }

    /// Read the same table from every trusted server and keep the majority answer
    async fn with_consensus<F, Fut>(&self, what: &str, fetch: F) -> RelayerResult<Vec<Value>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = RelayerResult<Vec<Value>>>,
    {
        let trusted = self.trusted().await?;
        let fetched = join_all(trusted.iter().map(|s| {
            let url = s.url.clone();
            let fut = fetch(url.clone());
            async move { (url, fut.await) }
        }))
        .await;

        let mut results = Vec::new();
        for (url, result) in fetched {
            match result {
                Ok(rows) => results.push((url, rows)),
                Err(e) => warn!("Reading {} from {} failed: {}", what, url, e),
            }
        }

        select_majority(results).map_err(|e| {
            crate::metrics::record_consensus_failure(what);
            e
        })
    }

    async fn history_page(&self, server: &str, pos: i64, offset: i64) -> RelayerResult<Vec<Value>> {
        let body = json!({
            "account_name": self.config.oracle_account,
            "pos": pos,
            "offset": offset,
        });
        let page =
            post_json(&self.http, &Self::url(server, "/v1/history/get_actions"), &body).await?;
        Ok(page["actions"].as_array().cloned().unwrap_or_default())
    }

    /// Walk the oracle account history backwards until `since`
    async fn history_since(&self, server: &str, since: i64) -> RelayerResult<Vec<Value>> {
        let page = i64::from(self.config.history_page_size.max(1));
        let mut pos = -1;
        let mut offset = -page;
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        loop {
            let entries = self.history_page(server, pos, offset).await?;
            if entries.is_empty() {
                break;
            }

            let mut lowest_seq = i64::MAX;
            let mut reached_cutoff = false;
            for entry in entries {
                let seq = as_i64(&entry["account_action_seq"]).unwrap_or_default();
                lowest_seq = lowest_seq.min(seq);
                let time = entry["block_time"]
                    .as_str()
                    .and_then(|t| parse_block_time(t).ok())
                    .unwrap_or_default();
                if time < since {
                    reached_cutoff = true;
                    continue;
                }
                if seen.insert(seq) {
                    out.push(entry);
                }
            }

            if reached_cutoff || lowest_seq <= 0 {
                break;
            }
            pos = lowest_seq - 1;
            offset = -(page - 1);
        }

        Ok(out)
    }
}

#[async_trait]
impl FioLedger for FioHttpClient {
    async fn oracle_ledger(&self) -> RelayerResult<Vec<OracleLedgerItem>> {
        let query = TableQuery {
            code: self.config.oracle_contract.clone(),
            scope: self.config.oracle_contract.clone(),
            table: ORACLE_TABLE.into(),
            ..Default::default()
        };
        let rows = self
            .with_consensus("oracle ledger", |server| {
                let query = query.clone();
                async move { self.get_table_rows_all(&server, &query).await }
            })
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            match ledger_item_from_row(row) {
                Ok(item) => items.push(item),
                Err(e) => warn!("{}", e),
            }
        }
        Ok(items)
    }

    async fn wrapped_domains(&self) -> RelayerResult<Vec<DomainRecord>> {
        let custodian = self.config.domain_custodian.clone();
        let query = TableQuery {
            code: ADDRESS_CONTRACT.into(),
            scope: ADDRESS_CONTRACT.into(),
            table: DOMAINS_TABLE.into(),
            index_position: Some("2".into()),
            key_type: Some("name".into()),
            lower_bound: Some(custodian.clone()),
            upper_bound: Some(custodian.clone()),
        };
        let rows = self
            .with_consensus("wrapped domains", |server| {
                let query = query.clone();
                async move { self.get_table_rows_all(&server, &query).await }
            })
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| domain_from_row(row).ok())
            .filter(|d| d.account == custodian)
            .collect())
    }

    async fn unwrap_actions(&self, since: i64) -> RelayerResult<Vec<LedgerAction>> {
        let mut last_error = None;
        let servers = if self.config.history_servers.is_empty() {
            &self.config.servers
        } else {
            &self.config.history_servers
        };

        for server in servers {
            match self.history_since(server, since).await {
                Ok(entries) => {
                    let mut seen = HashSet::new();
                    return Ok(entries
                        .iter()
                        .filter_map(|e| {
                            unwrap_from_history(
                                e,
                                &self.config.oracle_contract,
                                &self.config.oracle_account,
                            )
                        })
                        .filter(|a| seen.insert((a.name.clone(), a.obt_id.clone())))
                        .collect());
                }
                Err(e) => {
                    warn!("History server {} failed: {}", server, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RelayerError::Ledger("no history servers configured".into())))
    }

    async fn push_unwrap(&self, action: &UnwrapAction) -> RelayerResult<String> {
        let trusted = self.trusted().await?;
        let server = trusted
            .iter()
            .max_by_key(|s| s.head_block_num)
            .map(|s| s.url.clone())
            .ok_or_else(|| RelayerError::ConsensusFailure("no FIO server available".into()))?;

        let request = ActionRequest {
            contract: self.config.oracle_contract.clone(),
            action: action.name().to_string(),
            actor: self.config.oracle_account.clone(),
            permission: self.config.permission.clone(),
            data: action.data(&self.config.oracle_account),
        };
        let response = self.signer.sign_and_push(&server, &request).await?;
        let tx_id = response["transaction_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                RelayerError::Ledger(format!("push without transaction id: {}", response))
            })?;

        info!(obt_id = %action.obt_id(), "Pushed {} as {}", action.name(), tx_id);
        Ok(tx_id)
    }

    async fn health_check(&self) -> bool {
        match self.trusted().await {
            Ok(_) => true,
            Err(e) => {
                warn!("FIO health check failed: {}", e);
                false
            }
        }
    }
}

/// Delegates signing and broadcast to an external signing service.
///
/// The service receives the target API server and the action, and answers
/// with the ledger's `push_transaction` response.
pub struct SigningServiceClient {
    http: reqwest::Client,
    url: String,
}

impl SigningServiceClient {
    pub fn new(url: &str, timeout: Duration) -> RelayerResult<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LedgerSigner for SigningServiceClient {
    async fn sign_and_push(&self, server: &str, request: &ActionRequest) -> RelayerResult<Value> {
        let body = json!({
            "api_endpoint": server,
            "account": request.contract,
            "name": request.action,
            "authorization": [{ "actor": request.actor, "permission": request.permission }],
            "data": request.data,
        });
        post_json(&self.http, &format!("{}/v1/sign_and_push", self.url), &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_time_is_utc() {
        assert_eq!(parse_block_time("2023-11-14T22:13:20.000").unwrap(), 1_700_000_000);
        assert_eq!(parse_block_time("2023-11-14T22:13:20").unwrap(), 1_700_000_000);
        assert!(parse_block_time("yesterday").is_err());
    }

    #[test]
    fn ledger_rows_are_normalized() {
        let tokens = ledger_item_from_row(&json!({
            "id": 42, "actor": "qbxn5zhw2ypw", "chaincode": "POL",
            "pubaddress": "0xabc", "nftname": "", "amount": "500", "timestamp": 1700000000
        }))
        .unwrap();
        assert_eq!(tokens.amount, Some(500));
        assert_eq!(tokens.nftname, None);

        let nft = ledger_item_from_row(&json!({
            "id": 43, "chaincode": "ETH", "pubaddress": "0xabc",
            "nftname": "dapp", "amount": 0, "timestamp": 1700000000
        }))
        .unwrap();
        assert_eq!(nft.amount, None);
        assert_eq!(nft.nftname.as_deref(), Some("dapp"));

        assert!(ledger_item_from_row(&json!({ "id": 1 })).is_err());
    }

    #[test]
    fn only_our_unwraps_are_read_from_history() {
        let entry = |actor: &str, name: &str| {
            json!({
                "account_action_seq": 7,
                "block_time": "2023-11-14T22:13:20.000",
                "action_trace": { "act": {
                    "account": "fio.oracle",
                    "name": name,
                    "data": {
                        "amount": 500,
                        "obt_id": "0xdead",
                        "fio_address": "a@b",
                        "actor": actor
                    }
                }}
            })
        };

        let oracle = "qbxn5zhw2ypw";
        let ours =
            unwrap_from_history(&entry(oracle, "unwraptokens"), "fio.oracle", oracle).unwrap();
        assert_eq!(ours.obt_id, "0xdead");
        assert_eq!(ours.amount, Some(500));
        assert_eq!(ours.block_time, 1_700_000_000);

        assert!(
            unwrap_from_history(&entry("someoneelse", "unwraptokens"), "fio.oracle", oracle)
                .is_none()
        );
        assert!(
            unwrap_from_history(&entry(oracle, "regaddress"), "fio.oracle", oracle).is_none()
        );
    }

    #[test]
    fn majority_dataset_is_selected() {
        let rows = |n: usize| (0..n).map(|i| json!({ "id": i })).collect::<Vec<_>>();
        let picked = select_majority(vec![
            ("a".into(), rows(120)),
            ("b".into(), rows(120)),
            ("c".into(), rows(85)),
        ])
        .unwrap();
        assert_eq!(picked.len(), 120);

        assert!(select_majority(vec![("a".into(), rows(120)), ("b".into(), rows(90))]).is_err());
    }
}
