//! Error types for the FIO oracle relayer

use std::fmt;
use thiserror::Error;

/// Failure reported by a single JSON-RPC provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// DNS, connection reset, refused connection
    Network,
    /// Request-level timeout
    Timeout,
    /// HTTP 5xx or an unparseable gateway page
    Server,
    /// HTTP 429 or a provider-specific throttling error
    RateLimited,
    /// Rejected credentials or exhausted plan
    Auth,
    /// The node answered with a JSON-RPC error body
    Rpc { code: i64, data: Option<String> },
    /// The node answered with something we could not decode
    Decode,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Errors that another provider might not have. Business errors returned by
    /// the node itself are never retryable across providers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Network
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Server
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::Auth
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == ProviderErrorKind::RateLimited
    }

    pub fn is_auth_failure(&self) -> bool {
        self.kind == ProviderErrorKind::Auth
    }

    /// Full text of the error including any JSON-RPC `data` payload.
    pub fn full_text(&self) -> String {
        match &self.kind {
            ProviderErrorKind::Rpc { data: Some(data), .. } => format!("{} {}", self.message, data),
            _ => self.message.clone(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ProviderErrorKind::Rpc { code, .. } => {
                write!(f, "{} rpc error {}: {}", self.provider, code, self.full_text())
            }
            kind => write!(f, "{} {:?}: {}", self.provider, kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error on {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provider error on chain {chain}: {source}")]
    Provider {
        chain: String,
        #[source]
        source: ProviderError,
    },

    #[error("All providers failed for chain {chain}: {last}")]
    AllProvidersFailed { chain: String, last: String },

    #[error("Chain {chain} not configured")]
    ChainNotFound { chain: String },

    #[error("No {asset} contract configured on chain {chain}")]
    ContractNotFound { chain: String, asset: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for chain {chain}: {message}")]
    Nonce { chain: String, message: String },

    #[error("Gas price unavailable for chain {chain}")]
    GasPriceUnavailable { chain: String },

    #[error("Retry limit of {attempts} reached for {operation}: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    #[error("Event decoding error: {0}")]
    EventParsing(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Native ledger error: {0}")]
    Ledger(String),

    #[error("Consensus failure: {0}")]
    ConsensusFailure(String),

    #[error("Malformed queue entry: {0}")]
    MalformedEntry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::Provider { source, .. } => source.is_retryable(),
            RelayerError::AllProvidersFailed { .. } | RelayerError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::ConsensusFailure(_)
                | RelayerError::Wallet(_)
                | RelayerError::GasPriceUnavailable { .. }
                | RelayerError::AllProvidersFailed { .. }
        )
    }

    pub fn storage(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        RelayerError::Storage {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Text used by the error classifier. Provider errors expose their
    /// JSON-RPC data payload as well as the message.
    pub fn classification_text(&self) -> String {
        match self {
            RelayerError::Provider { source, .. } => source.full_text(),
            other => other.to_string(),
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
