//! File-backed state manager
//!
//! Every file is either appended to or rewritten whole. Writers are expected to
//! hold the job lock for the pipeline that owns the file. Files shared between
//! pipelines are guarded with [`StateManager::lock_file`] instead.

use crate::error::{RelayerError, RelayerResult};
use crate::types::{ActionType, AssetType, ChainCode};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// State manager for the on-disk relay state
#[derive(Debug, Clone)]
pub struct StateManager {
    root: PathBuf,
    file_locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl StateManager {
    /// Create a new state manager rooted at `root`
    pub async fn new(root: impl Into<PathBuf>) -> RelayerResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| RelayerError::storage(&root, e))?;
        info!("State directory ready at {}", root.display());
        Ok(Self {
            root,
            file_locks: Arc::new(DashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chain_dir(&self, chain: &ChainCode) -> PathBuf {
        self.root.join(chain.as_str().to_ascii_lowercase())
    }

    pub fn queue_path(&self, chain: &ChainCode, action: ActionType, asset: AssetType) -> PathBuf {
        self.chain_dir(chain).join(format!("{}-{}.queue", action, asset))
    }

    pub fn error_queue_path(
        &self,
        chain: &ChainCode,
        action: ActionType,
        asset: AssetType,
    ) -> PathBuf {
        self.chain_dir(chain).join(format!("{}-{}.errors", action, asset))
    }

    pub fn pending_path(&self, chain: &ChainCode) -> PathBuf {
        self.chain_dir(chain).join("pending-transactions.log")
    }

    pub fn tx_log_path(&self, chain: &ChainCode) -> PathBuf {
        self.chain_dir(chain).join("transactions.log")
    }

    pub fn nonce_path(&self, chain: &ChainCode) -> PathBuf {
        self.chain_dir(chain).join("nonce")
    }

    pub fn event_cache_path(&self, chain: &ChainCode, asset: AssetType) -> PathBuf {
        self.chain_dir(chain).join(format!("{}-events.jsonl", asset))
    }

    /// Last block pulled into the event cache
    pub fn cache_block_path(&self, chain: &ChainCode, asset: AssetType) -> PathBuf {
        self.chain_dir(chain).join(format!("{}-cache-block", asset))
    }

    /// Last block whose unwrap events were enqueued
    pub fn unwrap_block_path(&self, chain: &ChainCode, asset: AssetType) -> PathBuf {
        self.chain_dir(chain).join(format!("{}-unwrap-block", asset))
    }

    /// Highest oracle ledger id already enqueued
    pub fn ledger_cursor_path(&self, chain: &ChainCode, asset: AssetType) -> PathBuf {
        self.chain_dir(chain).join(format!("{}-ledger-id", asset))
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.root.join("errors.log")
    }

    /// Read every non-empty line. A missing file reads as empty.
    pub async fn read_lines(&self, path: &Path) -> RelayerResult<Vec<String>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayerError::storage(path, e)),
        };

        Ok(content
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn append_line(&self, path: &Path, line: &str) -> RelayerResult<()> {
        self.append_lines(path, std::slice::from_ref(&line.to_string()))
            .await
    }

    pub async fn append_lines(&self, path: &Path, lines: &[String]) -> RelayerResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        ensure_parent(path).await?;

        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| RelayerError::storage(path, e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| RelayerError::storage(path, e))?;
        file.flush().await.map_err(|e| RelayerError::storage(path, e))
    }

    /// Replace the whole file. Written to a sibling and renamed into place.
    pub async fn write_lines(&self, path: &Path, lines: &[String]) -> RelayerResult<()> {
        ensure_parent(path).await?;

        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{}.tmp", file_name));
        fs::write(&tmp, buf.as_bytes())
            .await
            .map_err(|e| RelayerError::storage(&tmp, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| RelayerError::storage(path, e))
    }

    /// Serialize read-modify-write cycles on one file within this process
    pub async fn lock_file(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = self
            .file_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Delete a file. A missing file is not an error.
    pub async fn remove_file(&self, path: &Path) -> RelayerResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayerError::storage(path, e)),
        }
    }

    pub async fn head_line(&self, path: &Path) -> RelayerResult<Option<String>> {
        Ok(self.read_lines(path).await?.into_iter().next())
    }

    /// Remove and return the oldest line.
    pub async fn pop_head(&self, path: &Path) -> RelayerResult<Option<String>> {
        let mut lines = self.read_lines(path).await?;
        if lines.is_empty() {
            return Ok(None);
        }
        let head = lines.remove(0);
        self.write_lines(path, &lines).await?;
        debug!("Popped head of {}", path.display());
        Ok(Some(head))
    }

    pub async fn line_count(&self, path: &Path) -> RelayerResult<usize> {
        Ok(self.read_lines(path).await?.len())
    }

    /// Read a bare integer file
    pub async fn read_u64(&self, path: &Path) -> RelayerResult<Option<u64>> {
        match self.read_lines(path).await?.first() {
            Some(line) => line
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| RelayerError::MalformedEntry(format!("{}: {}", path.display(), e))),
            None => Ok(None),
        }
    }

    pub async fn write_u64(&self, path: &Path, value: u64) -> RelayerResult<()> {
        self.write_lines(path, &[value.to_string()]).await
    }

    /// Append a structured, timestamped entry to the terminal error log
    pub async fn record_error(
        &self,
        context: &str,
        entry: Option<&str>,
        error: &RelayerError,
    ) -> RelayerResult<()> {
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "context": context,
            "entry": entry,
            "error": error.to_string(),
        });
        self.append_line(&self.error_log_path(), &line.to_string())
            .await
    }
}

async fn ensure_parent(path: &Path) -> RelayerResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| RelayerError::storage(parent, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn lines_round_trip_through_append_and_pop() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(dir.path()).await.unwrap();
        let path = state.queue_path(&ChainCode::new("eth"), ActionType::Wrap, AssetType::Tokens);

        assert_ok!(state.append_line(&path, "a").await);
        assert_ok!(state.append_line(&path, "b").await);
        assert_eq!(state.pop_head(&path).await.unwrap().as_deref(), Some("a"));
        assert_eq!(state.read_lines(&path).await.unwrap(), vec!["b".to_string()]);
        assert_eq!(state.pop_head(&path).await.unwrap().as_deref(), Some("b"));
        assert_eq!(state.pop_head(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn crlf_and_blank_lines_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(dir.path()).await.unwrap();
        let path = dir.path().join("mixed");
        tokio::fs::write(&path, "one\r\n\r\ntwo\n\n").await.unwrap();

        assert_eq!(
            state.read_lines(&path).await.unwrap(),
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[tokio::test]
    async fn integer_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(dir.path()).await.unwrap();
        let path = state.nonce_path(&ChainCode::new("POL"));

        assert_eq!(state.read_u64(&path).await.unwrap(), None);
        state.write_u64(&path, 17).await.unwrap();
        assert_eq!(state.read_u64(&path).await.unwrap(), Some(17));
    }

    #[tokio::test]
    async fn error_log_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::new(dir.path()).await.unwrap();
        state
            .record_error("wrap POL", Some("42 {}"), &RelayerError::Transaction("boom".into()))
            .await
            .unwrap();

        let lines = state.read_lines(&state.error_log_path()).await.unwrap();
        let entry: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(entry["context"], "wrap POL");
        assert_eq!(entry["error"], "Transaction error: boom");
    }

    #[tokio::test]
    async fn file_lock_serializes_updates() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateManager::new(dir.path()).await.unwrap());
        let path = dir.path().join("counter");

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let state = state.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    let _guard = state.lock_file(&path).await;
                    let current = state.read_u64(&path).await.unwrap().unwrap_or(0);
                    tokio::task::yield_now().await;
                    state.write_u64(&path, current + 1).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(state.read_u64(&path).await.unwrap(), Some(10));
        assert_ok!(state.remove_file(&path).await);
        assert_ok!(state.remove_file(&path).await);
        assert_eq!(state.read_u64(&path).await.unwrap(), None);
    }
}
