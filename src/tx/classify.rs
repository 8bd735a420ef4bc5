//! Central classification of chain and provider error messages
//!
//! Every place that needs to react to what a node said about a request goes
//! through [`classify`] or [`classify_text`]. Nothing else matches on message
//! strings.

use crate::error::{ProviderErrorKind, RelayerError};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The contract already holds the outcome we wanted
    AlreadyCompleted,
    NonceConflict,
    Underpriced,
    Reverted,
    RateLimited,
    AuthFailure,
    BlockRangeTooLarge,
    Network,
    ServerError,
    NonRetryable,
    Unknown,
}

impl ErrorClass {
    /// Whether the lifecycle manager retries the submission with raised gas
    pub fn raises_gas(&self) -> bool {
        matches!(self, ErrorClass::Underpriced | ErrorClass::Reverted)
    }
}

lazy_static! {
    static ref NONCE_CONFLICT: Regex = Regex::new(concat!(
        r"(?i)nonce too low|already known|nonce has already been used|",
        r"nonce is too low|known transaction|invalid nonce",
    ))
    .expect("valid regex");
    static ref UNDERPRICED: Regex = Regex::new(concat!(
        r"(?i)underpriced|gas price too low|fee too low|",
        r"max fee per gas less than block base fee|intrinsic gas too low",
    ))
    .expect("valid regex");
    static ref ALREADY_COMPLETED: Regex = Regex::new(concat!(
        r"(?i)already (approved|complete|completed|wrapped|unwrapped|burned|burnt|",
        r"minted|processed|executed)|obtid already|token already exists",
    ))
    .expect("valid regex");
    static ref BLOCK_RANGE: Regex = Regex::new(concat!(
        r"(?i)block range|exceed(s|ed)? maximum block|range is too large|",
        r"too many blocks|query returned more than|block range too large|",
        r"response size exceeded",
    ))
    .expect("valid regex");
    static ref RATE_LIMITED: Regex = Regex::new(concat!(
        r"(?i)rate.?limit|too many requests|\b429\b|request limit|",
        r"exceeded .*capacity|daily request count exceeded",
    ))
    .expect("valid regex");
    static ref AUTH: Regex = Regex::new(concat!(
        r"(?i)\b401\b|\b403\b|invalid api key|invalid project id|unauthorized|",
        r"forbidden|must be authenticated",
    ))
    .expect("valid regex");
    static ref NON_RETRYABLE: Regex = Regex::new(concat!(
        r"(?i)insufficient funds|only .*oracle|not an oracle|invalid address|",
        r"not registered|missing required authority|invalid obtid",
    ))
    .expect("valid regex");
    static ref REVERTED: Regex =
        Regex::new(r"(?i)execution reverted|revert|out of gas|transaction failed")
            .expect("valid regex");
    static ref NETWORK: Regex = Regex::new(concat!(
        r"(?i)timed? ?out|timeout|connection (reset|refused|closed)|econnreset|",
        r"econnrefused|enotfound|socket hang up|network error|dns error",
    ))
    .expect("valid regex");
    static ref SERVER: Regex = Regex::new(concat!(
        r"(?i)\b50[0-9]\b|bad gateway|service unavailable|internal server error|",
        r"gateway time-?out",
    ))
    .expect("valid regex");
}

/// Classify a free-form error text. Order matters: a revert that says the
/// obtid is already complete is a success, not a revert.
pub fn classify_text(text: &str) -> ErrorClass {
    if NONCE_CONFLICT.is_match(text) {
        ErrorClass::NonceConflict
    } else if UNDERPRICED.is_match(text) {
        ErrorClass::Underpriced
    } else if ALREADY_COMPLETED.is_match(text) {
        ErrorClass::AlreadyCompleted
    } else if BLOCK_RANGE.is_match(text) {
        ErrorClass::BlockRangeTooLarge
    } else if RATE_LIMITED.is_match(text) {
        ErrorClass::RateLimited
    } else if AUTH.is_match(text) {
        ErrorClass::AuthFailure
    } else if NON_RETRYABLE.is_match(text) {
        ErrorClass::NonRetryable
    } else if REVERTED.is_match(text) {
        ErrorClass::Reverted
    } else if NETWORK.is_match(text) {
        ErrorClass::Network
    } else if SERVER.is_match(text) {
        ErrorClass::ServerError
    } else {
        ErrorClass::Unknown
    }
}

/// Classify a relayer error, taking transport-level facts into account first.
pub fn classify(err: &RelayerError) -> ErrorClass {
    match err {
        RelayerError::Provider { source, .. } => match source.kind {
            ProviderErrorKind::RateLimited => ErrorClass::RateLimited,
            ProviderErrorKind::Auth => ErrorClass::AuthFailure,
            ProviderErrorKind::Network | ProviderErrorKind::Timeout => ErrorClass::Network,
            ProviderErrorKind::Server => ErrorClass::ServerError,
            _ => classify_text(&err.classification_text()),
        },
        RelayerError::AllProvidersFailed { .. } | RelayerError::Timeout { .. } => {
            ErrorClass::Network
        }
        _ => classify_text(&err.classification_text()),
    }
}

/// Flatten every string found in a JSON error body (message, reason, data,
/// cause, nested error arrays) into one space-separated text.
pub fn collect_error_text(value: &Value) -> String {
    let mut parts = Vec::new();
    collect_into(value, &mut parts);
    parts.join(" ")
}

fn collect_into(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            // Revert data is hex; decode Error(string) payloads when present
            if let Some(reason) = decode_revert_reason(s) {
                parts.push(reason);
            }
            parts.push(s.clone());
        }
        Value::Array(items) => items.iter().for_each(|v| collect_into(v, parts)),
        Value::Object(map) => map.values().for_each(|v| collect_into(v, parts)),
        Value::Number(n) => parts.push(n.to_string()),
        Value::Bool(_) | Value::Null => {}
    }
}

/// Decode an ABI-encoded `Error(string)` revert payload
fn decode_revert_reason(data: &str) -> Option<String> {
    let hex_data = data.strip_prefix("0x")?;
    let bytes = hex::decode(hex_data).ok()?;
    // selector of Error(string)
    if bytes.len() < 4 + 64 || bytes[..4] != [0x08, 0xc3, 0x79, 0xa0] {
        return None;
    }
    let decoded = ethers::abi::decode(&[ethers::abi::ParamType::String], &bytes[4..]).ok()?;
    decoded.into_iter().next()?.into_string()
}
