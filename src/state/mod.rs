//! Durable relay state kept in line-oriented files
//!
//! Handles:
//! - Queue and error-queue files per (chain, action, asset)
//! - Pending and submitted transaction logs per chain
//! - Nonce, block and ledger cursors
//! - The structured error log

mod manager;

pub use manager::StateManager;
