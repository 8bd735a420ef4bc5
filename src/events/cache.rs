//! In-process event cache backed by an append-only JSON-lines file

use super::CachedEvent;
use crate::chain::ChainRegistry;
use crate::error::RelayerResult;
use crate::state::StateManager;
use crate::types::{AssetType, ChainCode};

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Filter for [`EventCache::get_cached_events`]. Block bounds apply to
/// `block_number`, time bounds to `observed_at`; all bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct EventQuery<'a> {
    pub event_name: Option<&'a str>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub observed_from: Option<i64>,
    pub observed_to: Option<i64>,
}

impl<'a> EventQuery<'a> {
    pub fn named(event_name: &'a str) -> Self {
        Self {
            event_name: Some(event_name),
            ..Default::default()
        }
    }

    pub fn blocks(mut self, from: u64, to: u64) -> Self {
        self.from_block = Some(from);
        self.to_block = Some(to);
        self
    }

    pub fn between(mut self, from: i64, to: i64) -> Self {
        self.observed_from = Some(from);
        self.observed_to = Some(to);
        self
    }

    fn matches(&self, event: &CachedEvent) -> bool {
        self.event_name.map_or(true, |n| event.event_name == n)
            && self.from_block.map_or(true, |from| event.block_number >= from)
            && self.to_block.map_or(true, |to| event.block_number <= to)
            && self.observed_from.map_or(true, |from| event.observed_at >= from)
            && self.observed_to.map_or(true, |to| event.observed_at <= to)
    }
}

/// Shared cache of decoded bridge events per chain and asset type
pub struct EventCache {
    registry: Arc<ChainRegistry>,
    state: Arc<StateManager>,
    /// Seconds an event stays cached after it was observed
    retention_secs: i64,
    events: DashMap<(ChainCode, AssetType), Vec<CachedEvent>>,
}

impl EventCache {
    pub fn new(
        registry: Arc<ChainRegistry>,
        state: Arc<StateManager>,
        retention_secs: u64,
    ) -> Self {
        Self {
            registry,
            state,
            retention_secs: retention_secs as i64,
            events: DashMap::new(),
        }
    }

    /// Populate memory from disk for every registered chain and asset
    pub async fn load(&self) -> RelayerResult<()> {
        for chain in self.registry.chains() {
            for asset in self.registry.assets(&chain) {
                let events = self.read_disk_events(&chain, asset).await?;
                info!(chain = %chain, asset = %asset, "Loaded {} cached events", events.len());
                self.events.insert((chain.clone(), asset), events);
                self.prune(&chain, asset).await?;
            }
        }
        Ok(())
    }

    /// Pull new logs up to the safe head into the cache.
    ///
    /// Covers `[lastCachedBlock + 1, head - safetyOffset]`; the block marker is
    /// advanced after each window so an interrupted refresh resumes where it
    /// stopped. Returns the number of events added.
    pub async fn refresh(&self, chain: &ChainCode, asset: AssetType) -> RelayerResult<usize> {
        let provider = self.registry.provider(chain)?;
        let contract = self.registry.contract(chain, asset)?;
        let config = self.registry.config(chain)?;

        let head = provider.block_number().await?;
        let safe_head = head.saturating_sub(config.block_safety_offset);

        let marker_path = self.state.cache_block_path(chain, asset);
        let from = match self.state.read_u64(&marker_path).await? {
            Some(last) => last + 1,
            None => safe_head.saturating_sub(config.initial_lookback_blocks),
        };
        if from > safe_head {
            debug!(chain = %chain, asset = %asset, "Event cache up to date at block {}", safe_head);
            return Ok(0);
        }

        let cache_path = self.state.event_cache_path(chain, asset);
        let mut known: HashSet<(String, u64)> = self
            .events
            .get(&(chain.clone(), asset))
            .map(|e| e.iter().map(CachedEvent::key).collect())
            .unwrap_or_default();
        let mut added = 0;

        for (start, end) in provider.split_range_by_provider(from, safe_head) {
            let logs = provider.get_logs(contract.address(), start, end).await?;
            let observed_at = Utc::now().timestamp();

            let mut fresh = Vec::new();
            for log in &logs {
                match contract.decode_log(log, observed_at) {
                    Ok(Some(event)) if known.insert(event.key()) => fresh.push(event),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(chain = %chain, asset = %asset, "Skipping undecodable log: {}", e)
                    }
                }
            }

            let lines = fresh
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;
            self.state.append_lines(&cache_path, &lines).await?;
            added += fresh.len();
            self.events
                .entry((chain.clone(), asset))
                .or_default()
                .extend(fresh);

            self.state.write_u64(&marker_path, end).await?;
        }

        crate::metrics::record_events_cached(chain.as_str(), asset.as_str(), added);
        if added > 0 {
            info!(
                chain = %chain,
                asset = %asset,
                "Cached {} new events up to block {}",
                added,
                safe_head
            );
        }

        self.prune(chain, asset).await?;
        Ok(added)
    }

    /// In-memory events for one chain and asset matching `query`
    pub fn get_cached_events(
        &self,
        chain: &ChainCode,
        asset: AssetType,
        query: &EventQuery<'_>,
    ) -> Vec<CachedEvent> {
        self.events
            .get(&(chain.clone(), asset))
            .map(|events| events.iter().filter(|e| query.matches(e)).cloned().collect())
            .unwrap_or_default()
    }

    /// Every event still present in the durable log
    pub async fn read_disk_events(
        &self,
        chain: &ChainCode,
        asset: AssetType,
    ) -> RelayerResult<Vec<CachedEvent>> {
        let path = self.state.event_cache_path(chain, asset);
        let mut events = Vec::new();
        for line in self.state.read_lines(&path).await? {
            match serde_json::from_str::<CachedEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(path = %path.display(), "Skipping malformed cache line: {}", e),
            }
        }
        Ok(events)
    }

    /// Drop events older than the retention window from memory and disk
    pub async fn prune(&self, chain: &ChainCode, asset: AssetType) -> RelayerResult<usize> {
        self.prune_at(chain, asset, Utc::now().timestamp()).await
    }

    pub async fn prune_at(
        &self,
        chain: &ChainCode,
        asset: AssetType,
        now: i64,
    ) -> RelayerResult<usize> {
        let cutoff = now - self.retention_secs;

        if let Some(mut events) = self.events.get_mut(&(chain.clone(), asset)) {
            events.retain(|e| e.observed_at >= cutoff);
        }

        let path = self.state.event_cache_path(chain, asset);
        let lines = self.state.read_lines(&path).await?;
        let total = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| {
                serde_json::from_str::<CachedEvent>(line)
                    .map(|e| e.observed_at >= cutoff)
                    .unwrap_or(false)
            })
            .collect();

        let removed = total - kept.len();
        if removed > 0 {
            self.state.write_lines(&path, &kept).await?;
            debug!(chain = %chain, asset = %asset, "Pruned {} cached events", removed);
        }
        Ok(removed)
    }
}
