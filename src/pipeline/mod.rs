//! Relay pipelines: pollers find work, executors carry it out, the engine
//! schedules both per chain and asset type

mod engine;
mod executors;
mod pollers;

pub use engine::{ChainStatus, HealthReport, PassReport, QueueStatus, RelayEngine};
pub use executors::{unwrap_action, ChainExecutor, UnwrapExecutor};
pub use pollers::{unwrap_item, BurnPoller, UnwrapPoller, WrapPoller};

#[cfg(test)]
pub(crate) use engine::tests::engine_with;
