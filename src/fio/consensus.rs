//! Trust and agreement rules across native-ledger API servers

use crate::error::{RelayerError, RelayerResult};

use std::collections::HashMap;

/// Head block reported by one server's `get_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub url: String,
    pub head_block_num: u64,
    /// Unix seconds of the head block
    pub head_block_time: i64,
}

impl ServerStatus {
    pub fn is_fresh(&self, now: i64, max_age_secs: i64) -> bool {
        now - self.head_block_time < max_age_secs
    }
}

/// Servers whose data may be used.
///
/// Fresh servers are trusted, as are stale servers whose head is within
/// `tolerance` blocks of the highest fresh head. With no fresh server, the
/// servers within `tolerance` of the highest head overall are trusted.
pub fn trusted_servers(
    statuses: &[ServerStatus],
    now: i64,
    max_age_secs: i64,
    tolerance: u64,
) -> Vec<ServerStatus> {
    let highest_fresh = statuses
        .iter()
        .filter(|s| s.is_fresh(now, max_age_secs))
        .map(|s| s.head_block_num)
        .max();

    match highest_fresh {
        Some(reference) => statuses
            .iter()
            .filter(|s| {
                s.is_fresh(now, max_age_secs)
                    || s.head_block_num.saturating_add(tolerance) >= reference
            })
            .cloned()
            .collect(),
        None => {
            let Some(reference) = statuses.iter().map(|s| s.head_block_num).max() else {
                return Vec::new();
            };
            statuses
                .iter()
                .filter(|s| s.head_block_num.saturating_add(tolerance) >= reference)
                .cloned()
                .collect()
        }
    }
}

/// Pick the dataset size a strict majority of at least two servers agree on
pub fn majority_count(counts: &[(String, usize)]) -> RelayerResult<usize> {
    let mut tally: HashMap<usize, usize> = HashMap::new();
    for (_, count) in counts {
        *tally.entry(*count).or_default() += 1;
    }

    let best = tally.iter().max_by_key(|(_, votes)| **votes);
    match best {
        Some((count, votes)) if *votes >= 2 && *votes * 2 > counts.len() => Ok(*count),
        _ => Err(RelayerError::ConsensusFailure(format!(
            "servers disagree on result size: {}",
            counts
                .iter()
                .map(|(url, count)| format!("{}={}", url, count))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}
