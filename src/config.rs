//! Configuration management for the FIO oracle relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub storage: StorageConfig,
    pub rpc: RpcConfig,
    pub transactions: TransactionConfig,
    pub gas: GasConfig,
    pub reconciler: ReconcilerConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    pub fio: FioConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub wrap_interval_secs: u64,
    pub unwrap_interval_secs: u64,
    pub burn_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub event_cache_interval_secs: u64,
    pub pending_sweep_interval_secs: u64,
    /// Delay between starting successive chains within one pass
    pub chain_stagger_ms: u64,
    pub lock_ttl_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
    #[serde(default = "default_retention")]
    pub event_retention_secs: u64,
}

fn default_retention() -> u64 {
    3600
}

/// Throttle and timeout settings shared by every outbound JSON-RPC call
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub request_spacing_ms: u64,
    pub request_timeout_secs: u64,
    pub rate_limit_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub cooldown_after_retry_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub confirmation_poll_ms: u64,
    /// A transaction missing from the mempool for this long counts as dropped
    pub drop_timeout_secs: u64,
    /// Pending transactions older than this are replaced unconditionally
    pub max_pending_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceMode {
    Api,
    Fixed,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GasTier {
    Low,
    Average,
    High,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    pub mode: GasPriceMode,
    pub tier: GasTier,
    pub fixed_gwei: Option<u64>,
    pub low_multiplier: f64,
    pub average_multiplier: f64,
    pub high_multiplier: f64,
    pub retry_multiplier: f64,
    pub replacement_multiplier: f64,
}

impl GasConfig {
    pub fn tier_multiplier(&self) -> f64 {
        match self.tier {
            GasTier::Low => self.low_multiplier,
            GasTier::Average => self.average_multiplier,
            GasTier::High => self.high_multiplier,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Ledger items younger than this are left to the regular pipeline
    pub min_age_secs: u64,
    pub max_age_secs: u64,
    pub item_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FioConfig {
    pub servers: Vec<String>,
    pub history_servers: Vec<String>,
    pub max_head_block_age_secs: i64,
    pub sync_tolerance_blocks: u64,
    pub oracle_contract: String,
    pub oracle_account: String,
    pub permission: String,
    /// Account that holds wrapped domains on the native ledger
    pub domain_custodian: String,
    pub burn_grace_secs: i64,
    pub table_page_size: u32,
    pub history_page_size: u32,
    pub request_timeout_secs: u64,
    /// Service that signs and pushes native-ledger actions
    #[serde(default)]
    pub signer_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
    pub priority: u32,
    pub logs_priority: Option<u32>,
    pub max_logs_block_span: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Short code used in queue files and ledger rows, e.g. `POL`
    pub code: String,
    pub chain_id: u64,
    pub providers: Vec<ProviderConfig>,
    pub token_contract: String,
    pub nft_contract: Option<String>,
    pub block_safety_offset: u64,
    pub initial_lookback_blocks: u64,
    pub wrap_gas_limit: u64,
    pub burn_gas_limit: u64,
    pub enabled: bool,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("FIO_ORACLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.fio.servers.is_empty() {
            anyhow::bail!("At least one FIO server must be configured");
        }

        for (name, chain) in &self.chains {
            if !chain.enabled {
                continue;
            }
            if chain.providers.is_empty() {
                anyhow::bail!("Chain {} has no RPC providers configured", name);
            }
            if chain.token_contract.is_empty() {
                anyhow::bail!("Chain {} has no token contract address", name);
            }
            if chain.nft_contract.is_none() {
                tracing::warn!("Chain {} has no NFT contract - NFT pipelines disabled", name);
            }

            let mut general = HashSet::new();
            let mut logs = HashSet::new();
            for provider in &chain.providers {
                if !general.insert(provider.priority) {
                    anyhow::bail!(
                        "Chain {} has duplicate provider priority {}",
                        name,
                        provider.priority
                    );
                }
                if let Some(p) = provider.logs_priority {
                    if !logs.insert(p) {
                        anyhow::bail!("Chain {} has duplicate logs priority {}", name, p);
                    }
                }
            }
        }

        if self.gas.mode == GasPriceMode::Fixed && self.gas.fixed_gwei.unwrap_or(0) == 0 {
            anyhow::bail!("Fixed gas mode requires a positive gas.fixed_gwei");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by its short code
    pub fn get_chain_by_code(&self, code: &str) -> Option<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.code.eq_ignore_ascii_case(code))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
