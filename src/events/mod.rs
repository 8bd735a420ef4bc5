//! Bridge contract events and the shared event cache
//!
//! Every consumer of chain logs (unwrap poller, reconciler) reads from the
//! cache. The cache is the only place that issues `eth_getLogs`.

mod cache;

pub use cache::{EventCache, EventQuery};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event names emitted by the bridge contracts
pub mod names {
    pub const WRAPPED: &str = "wrapped";
    pub const UNWRAPPED: &str = "unwrapped";
    pub const CONSENSUS_ACTIVITY: &str = "consensus_activity";
}

/// A decoded contract event as stored in memory and on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEvent {
    pub event_name: String,
    pub block_number: u64,
    pub transaction_hash: String,
    #[serde(default)]
    pub log_index: u64,
    /// Decoded parameters: addresses as lowercase hex, integers as decimal strings
    pub return_values: Map<String, Value>,
    /// Unix seconds at which this relayer first saw the event
    pub observed_at: i64,
}

impl CachedEvent {
    pub fn value_str(&self, key: &str) -> Option<&str> {
        self.return_values.get(key).and_then(Value::as_str)
    }

    /// Identity of the log within the chain
    pub fn key(&self) -> (String, u64) {
        (self.transaction_hash.to_ascii_lowercase(), self.log_index)
    }

    pub fn obt_id(&self) -> Option<&str> {
        self.value_str("obtid")
    }
}

#[cfg(test)]
pub(crate) fn sample_event(name: &str, block: u64, values: Value, observed_at: i64) -> CachedEvent {
    CachedEvent {
        event_name: name.to_string(),
        block_number: block,
        transaction_hash: format!("0x{:064x}", block),
        log_index: 0,
        return_values: values.as_object().cloned().unwrap_or_default(),
        observed_at,
    }
}
