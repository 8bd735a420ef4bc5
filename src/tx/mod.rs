//! Transaction lifecycle: nonce and gas policy, submission, pending sweep

pub mod classify;
mod gas;
mod nonce;
mod pending;
mod sender;

pub use classify::ErrorClass;
pub use gas::{GasPolicy, GasPriceSource, RpcGasPriceSource};
pub use nonce::NonceManager;
pub use pending::{
    has_pending, load_pending, record_pending, PendingMonitor, PendingTransactionRecord,
    SweepReport,
};
pub use sender::{load_wallet, SubmitOutcome, SubmitRequest, TransactionSender};

#[cfg(test)]
pub(crate) use sender::tests::{harness, Harness};
