//! Job coordination: TTL locks and the persistent FIFO queues they protect

mod lock;
mod queue;

pub use lock::{JobKind, JobLockGuard, JobLocks, LockKey};
pub use queue::{DrainReport, JobQueue, QueueHandler, QueueKey};
