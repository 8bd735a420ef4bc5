//! Persistent FIFO queues, one file per chain, action and asset type

use super::lock::JobLockGuard;
use crate::error::{RelayerError, RelayerResult};
use crate::state::StateManager;
use crate::types::{ActionType, AssetType, ChainCode, QueueItem};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Executes one queue item
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, item: &QueueItem) -> RelayerResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub chain: ChainCode,
    pub action: ActionType,
    pub asset: AssetType,
}

impl QueueKey {
    pub fn new(chain: &ChainCode, action: ActionType, asset: AssetType) -> Self {
        Self {
            chain: chain.clone(),
            action,
            asset,
        }
    }

    pub fn of(item: &QueueItem) -> Self {
        Self::new(&item.chain_code, item.action, item.asset)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    /// A transient failure left the head item in place for the next pass
    pub deferred: bool,
}

pub struct JobQueue {
    state: Arc<StateManager>,
}

impl JobQueue {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    async fn holds(&self, path: &std::path::Path, obt_id: &str) -> RelayerResult<bool> {
        let prefix = format!("{} ", obt_id);
        Ok(self
            .state
            .read_lines(path)
            .await?
            .iter()
            .any(|line| line.starts_with(&prefix)))
    }

    /// Append an item unless one with the same obt id is already waiting.
    /// Returns whether it was added.
    pub async fn enqueue(&self, item: &QueueItem) -> RelayerResult<bool> {
        let key = QueueKey::of(item);
        let path = self.state.queue_path(&key.chain, key.action, key.asset);

        if self.holds(&path, &item.obt_id).await? {
            debug!(chain = %key.chain, obt_id = %item.obt_id, "Already queued");
            return Ok(false);
        }

        self.state.append_line(&path, &item.to_line()?).await?;
        crate::metrics::record_item_enqueued(
            key.chain.as_str(),
            key.action.as_str(),
            key.asset.as_str(),
        );
        info!(
            chain = %key.chain,
            obt_id = %item.obt_id,
            "Enqueued {} {}",
            key.action,
            key.asset
        );
        Ok(true)
    }

    /// Whether the item is waiting in its queue or parked in the error queue
    pub async fn is_tracked(&self, item: &QueueItem) -> RelayerResult<bool> {
        let key = QueueKey::of(item);
        let path = self.state.queue_path(&key.chain, key.action, key.asset);
        let error_path = self.state.error_queue_path(&key.chain, key.action, key.asset);
        Ok(self.holds(&path, &item.obt_id).await? || self.holds(&error_path, &item.obt_id).await?)
    }

    pub async fn depth(&self, key: &QueueKey) -> RelayerResult<usize> {
        self.state
            .line_count(&self.state.queue_path(&key.chain, key.action, key.asset))
            .await
    }

    pub async fn error_depth(&self, key: &QueueKey) -> RelayerResult<usize> {
        self.state
            .line_count(&self.state.error_queue_path(&key.chain, key.action, key.asset))
            .await
    }

    /// Process the queue head to tail while holding `lock`.
    ///
    /// Each item is popped once handled. A terminal failure copies the line to
    /// the error queue and the error log first. A transient failure stops the
    /// drain with the item still at the head.
    pub async fn drain(
        &self,
        lock: JobLockGuard,
        key: &QueueKey,
        handler: &dyn QueueHandler,
    ) -> RelayerResult<DrainReport> {
        let path = self.state.queue_path(&key.chain, key.action, key.asset);
        let error_path = self.state.error_queue_path(&key.chain, key.action, key.asset);
        let context = format!("{} {} {}", key.action, key.asset, key.chain);
        let mut report = DrainReport::default();

        while let Some(line) = self.state.head_line(&path).await? {
            let result = match QueueItem::from_line(&line) {
                Ok(item) => handler.handle(&item).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    report.processed += 1;
                    crate::metrics::record_item_processed(key.chain.as_str(), key.action.as_str());
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        chain = %key.chain,
                        "Deferring {} after transient failure: {}",
                        context,
                        e
                    );
                    report.deferred = true;
                    break;
                }
                Err(e) => {
                    error!(
                        chain = %key.chain,
                        "Moving failed item to error queue ({}): {}",
                        context,
                        e
                    );
                    self.fail(&error_path, &context, &line, &e).await?;
                    report.failed += 1;
                    crate::metrics::record_item_failed(key.chain.as_str(), key.action.as_str());
                }
            }

            self.state.pop_head(&path).await?;
        }

        if report.processed + report.failed > 0 {
            info!(
                chain = %key.chain,
                "Drained {}: {} processed, {} failed",
                context,
                report.processed,
                report.failed
            );
        }
        drop(lock);
        Ok(report)
    }

    async fn fail(
        &self,
        error_path: &std::path::Path,
        context: &str,
        line: &str,
        e: &RelayerError,
    ) -> RelayerResult<()> {
        self.state.append_line(error_path, line).await?;
        self.state.record_error(context, Some(line), e).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::lock::{JobKind, JobLocks, LockKey};
    use crate::types::Payload;
    use ethers::types::U256;
    use std::sync::Mutex;
    use std::time::Duration;

    fn item(id: &str) -> QueueItem {
        QueueItem {
            obt_id: id.into(),
            chain_code: ChainCode::new("POL"),
            action: ActionType::Wrap,
            asset: AssetType::Tokens,
            payload: Payload::Tokens {
                amount: U256::from(500u64),
                target_address: "0x00000000000000000000000000000000000000aa".into(),
            },
        }
    }

    /// Records handled ids and fails the ones it is told to
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: Vec<&'static str>,
        transient: Vec<&'static str>,
    }

    #[async_trait]
    impl QueueHandler for Recorder {
        async fn handle(&self, item: &QueueItem) -> RelayerResult<()> {
            self.seen.lock().unwrap().push(item.obt_id.clone());
            if self.transient.contains(&item.obt_id.as_str()) {
                return Err(RelayerError::AllProvidersFailed {
                    chain: "POL".into(),
                    last: "down".into(),
                });
            }
            if self.fail.contains(&item.obt_id.as_str()) {
                return Err(RelayerError::Transaction("rejected".into()));
            }
            Ok(())
        }
    }

    async fn setup() -> (tempfile::TempDir, Arc<StateManager>, JobQueue, JobLocks) {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateManager::new(dir.path()).await.unwrap());
        let queue = JobQueue::new(state.clone());
        (dir, state, queue, JobLocks::new(Duration::from_secs(60)))
    }

    fn lock_key() -> LockKey {
        LockKey::new(
            JobKind::Drain,
            &ChainCode::new("POL"),
            Some(ActionType::Wrap),
            Some(AssetType::Tokens),
        )
    }

    #[tokio::test]
    async fn items_are_processed_in_fifo_order() {
        let (_dir, _state, queue, locks) = setup().await;
        for id in ["1", "2", "3"] {
            assert!(queue.enqueue(&item(id)).await.unwrap());
        }
        let handler = Recorder {
            seen: Mutex::new(Vec::new()),
            fail: vec![],
            transient: vec![],
        };
        let key = QueueKey::of(&item("1"));

        let report = queue
            .drain(locks.acquire(lock_key()).unwrap(), &key, &handler)
            .await
            .unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["1", "2", "3"]);
        assert_eq!(queue.depth(&key).await.unwrap(), 0);
        assert!(!locks.is_held(&lock_key()));
    }

    #[tokio::test]
    async fn duplicate_obt_id_is_not_enqueued_twice() {
        let (_dir, _state, queue, _locks) = setup().await;
        assert!(queue.enqueue(&item("42")).await.unwrap());
        assert!(!queue.enqueue(&item("42")).await.unwrap());
        assert_eq!(queue.depth(&QueueKey::of(&item("42"))).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tracked_covers_queue_and_error_queue() {
        let (_dir, state, queue, _locks) = setup().await;
        let key = QueueKey::of(&item("1"));
        queue.enqueue(&item("1")).await.unwrap();
        state
            .append_line(
                &state.error_queue_path(&key.chain, key.action, key.asset),
                &item("2").to_line().unwrap(),
            )
            .await
            .unwrap();

        assert!(queue.is_tracked(&item("1")).await.unwrap());
        assert!(queue.is_tracked(&item("2")).await.unwrap());
        // "1" must not match "12"
        assert!(!queue.is_tracked(&item("12")).await.unwrap());
    }

    #[tokio::test]
    async fn failed_item_goes_to_error_queue_and_queue_advances() {
        let (_dir, state, queue, locks) = setup().await;
        for id in ["1", "2", "3"] {
            queue.enqueue(&item(id)).await.unwrap();
        }
        let handler = Recorder {
            seen: Mutex::new(Vec::new()),
            fail: vec!["2"],
            transient: vec![],
        };
        let key = QueueKey::of(&item("1"));

        let report = queue
            .drain(locks.acquire(lock_key()).unwrap(), &key, &handler)
            .await
            .unwrap();
        assert_eq!((report.processed, report.failed), (2, 1));
        assert_eq!(queue.depth(&key).await.unwrap(), 0);

        let errors = state
            .read_lines(&state.error_queue_path(&key.chain, key.action, key.asset))
            .await
            .unwrap();
        assert_eq!(errors, vec![item("2").to_line().unwrap()]);
        assert_eq!(state.line_count(&state.error_log_path()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transient_failure_keeps_item_at_head() {
        let (_dir, _state, queue, locks) = setup().await;
        for id in ["1", "2"] {
            queue.enqueue(&item(id)).await.unwrap();
        }
        let handler = Recorder {
            seen: Mutex::new(Vec::new()),
            fail: vec![],
            transient: vec!["1"],
        };
        let key = QueueKey::of(&item("1"));

        let report = queue
            .drain(locks.acquire(lock_key()).unwrap(), &key, &handler)
            .await
            .unwrap();
        assert!(report.deferred);
        assert_eq!(queue.depth(&key).await.unwrap(), 2);
        assert_eq!(queue.error_depth(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_line_is_moved_aside() {
        let (_dir, state, queue, locks) = setup().await;
        let key = QueueKey::of(&item("1"));
        let path = state.queue_path(&key.chain, key.action, key.asset);
        state.append_line(&path, "garbage").await.unwrap();
        queue.enqueue(&item("1")).await.unwrap();
        let handler = Recorder {
            seen: Mutex::new(Vec::new()),
            fail: vec![],
            transient: vec![],
        };

        let report = queue
            .drain(locks.acquire(lock_key()).unwrap(), &key, &handler)
            .await
            .unwrap();
        assert_eq!((report.processed, report.failed), (1, 1));
        assert_eq!(queue.error_depth(&key).await.unwrap(), 1);
    }
}
