//! TTL-protected exclusive locks for pipeline jobs

use crate::types::{ActionType, AssetType, ChainCode};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Poll,
    Drain,
    Reconcile,
    CacheRefresh,
    PendingSweep,
}

/// Identity of one exclusive job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub kind: JobKind,
    pub chain: ChainCode,
    pub action: Option<ActionType>,
    pub asset: Option<AssetType>,
}

impl LockKey {
    pub fn new(
        kind: JobKind,
        chain: &ChainCode,
        action: Option<ActionType>,
        asset: Option<AssetType>,
    ) -> Self {
        Self {
            kind,
            chain: chain.clone(),
            action,
            asset,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.chain)?;
        if let Some(action) = self.action {
            write!(f, ":{}", action)?;
        }
        if let Some(asset) = self.asset {
            write!(f, ":{}", asset)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: Uuid,
    held_until: Instant,
}

/// Lock table. A lock whose TTL has passed may be taken over.
#[derive(Clone)]
pub struct JobLocks {
    ttl: Duration,
    held: Arc<DashMap<LockKey, Holder>>,
}

impl JobLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Arc::new(DashMap::new()),
        }
    }

    /// Take the lock if it is free or expired
    pub fn acquire(&self, key: LockKey) -> Option<JobLockGuard> {
        let now = Instant::now();
        let holder = Holder {
            token: Uuid::new_v4(),
            held_until: now + self.ttl,
        };

        match self.held.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().held_until > now {
                    debug!(lock = %key, "Lock busy");
                    crate::metrics::record_lock_contention(&key.to_string());
                    return None;
                }
                warn!(lock = %key, "Taking over expired lock");
                existing.insert(holder);
            }
            Entry::Vacant(slot) => {
                slot.insert(holder);
            }
        }

        Some(JobLockGuard {
            key,
            token: holder.token,
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held
            .get(key)
            .map(|h| h.held_until > Instant::now())
            .unwrap_or(false)
    }
}

/// Releases its lock when dropped, unless the lock has since been taken
/// over by another holder.
pub struct JobLockGuard {
    key: LockKey,
    token: Uuid,
    held: Arc<DashMap<LockKey, Holder>>,
}

impl JobLockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn release(self) {}
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        let token = self.token;
        self.held.remove_if(&self.key, |_, h| h.token == token);
    }
}
