use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

use crate::errors::{OracleError, OracleResult};

/// Supported chain network types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Private,
}

/// Network-specific configuration for the chain submission layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub network_type: NetworkType,
    /// Expected block time in seconds, used to pace receipt polling.
    pub block_time: u64,
    pub required_confirmations: u64,
    /// Hard ceiling for gas prices, in wei.
    pub max_gas_price: u128,
    /// Priority fee in wei.
    pub priority_fee: u128,
    #[serde(default = "default_nonce_cache_age")]
    pub max_nonce_cache_age: u64,
    #[serde(default = "default_gas_update_interval")]
    pub gas_price_update_interval: u64,
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout: u64,
}

fn default_nonce_cache_age() -> u64 {
    300
}

fn default_gas_update_interval() -> u64 {
    60
}

fn default_transaction_timeout() -> u64 {
    600
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 31337,
            network_type: NetworkType::Private,
            block_time: 12,
            required_confirmations: 2,
            max_gas_price: 500_000_000_000,
            priority_fee: 1_500_000_000,
            max_nonce_cache_age: default_nonce_cache_age(),
            gas_price_update_interval: default_gas_update_interval(),
            transaction_timeout: default_transaction_timeout(),
        }
    }
}

/// Scheduler timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Node heartbeat cadence in seconds.
    pub heartbeat_interval: u64,
    /// Heartbeats older than this are evicted during cleanup.
    pub node_expiry: u64,
    /// Execution garbage collection cadence in seconds.
    pub gc_interval: u64,
    /// Missed fires within this window coalesce into one execution.
    pub grace_time: u64,
    /// Terminal executions are retained at least this long.
    pub execution_retention: u64,
    /// Running or pending executions older than this are forced Failed.
    pub stale_execution_cutoff: u64,
    /// Dispatch loop poll cadence in seconds.
    pub tick_interval: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 60,
            node_expiry: 300,
            gc_interval: 3600,
            grace_time: 300,
            execution_retention: 7 * 24 * 3600,
            stale_execution_cutoff: 3600,
            tick_interval: 1,
        }
    }
}

/// Validation pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Historical data window in seconds.
    pub history_window: u64,
    pub min_history_points: usize,
    pub confidence_threshold: f64,
    pub max_source_deviation: f64,
    pub rapid_change_threshold: f64,
    pub min_consensus_sources: usize,
    /// Z-score bound used by the aggregator's outlier filter.
    pub outlier_threshold: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            history_window: 3600,
            min_history_points: 10,
            confidence_threshold: 0.8,
            max_source_deviation: 0.1,
            rapid_change_threshold: 0.05,
            min_consensus_sources: 3,
            outlier_threshold: 2.0,
        }
    }
}

/// Backing storage for tasks, executions and coordination records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum StoreConfig {
    Memory,
    File { data_dir: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OracleConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Stable scheduler node identity; generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,
}

impl OracleConfig {
    /// Load configuration from a YAML file with environment overrides.
    ///
    /// Environment variables take priority over file values so deployments
    /// can keep endpoints and chain ids out of checked-in config.
    pub fn load(path: Option<&Path>) -> OracleResult<Self> {
        let mut config = match path {
            Some(p) => {
                let content = fs::read_to_string(p).map_err(|e| {
                    OracleError::Configuration(format!(
                        "Failed to read config file {}: {}",
                        p.display(),
                        e
                    ))
                })?;
                serde_yaml::from_str(&content).map_err(|e| {
                    OracleError::Configuration(format!("Failed to parse config file: {}", e))
                })?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(rpc_url) = env::var("ORACLE_RPC_URL") {
            self.network.rpc_url = rpc_url;
        }
        if let Ok(chain_id) = env::var("ORACLE_CHAIN_ID") {
            if let Ok(parsed) = chain_id.parse() {
                self.network.chain_id = parsed;
            }
        }
        if let Ok(node_id) = env::var("ORACLE_NODE_ID") {
            self.node_id = Some(node_id);
        }
        if let Ok(data_dir) = env::var("ORACLE_DATA_DIR") {
            self.store = StoreConfig::File { data_dir };
        }
    }

    /// Read the signing key for chain submission. Environment only, never
    /// from the config file.
    pub fn private_key() -> Option<String> {
        env::var("ORACLE_PRIVATE_KEY").ok()
    }

    fn validate(&self) -> OracleResult<()> {
        if self.network.rpc_url.is_empty() {
            return Err(OracleError::Configuration(
                "RPC URL must not be empty".to_string(),
            ));
        }
        if self.validator.confidence_threshold < 0.0 || self.validator.confidence_threshold > 1.0 {
            return Err(OracleError::Configuration(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.validator.confidence_threshold
            )));
        }
        if self.validator.min_consensus_sources == 0 {
            return Err(OracleError::Configuration(
                "min_consensus_sources must be at least 1".to_string(),
            ));
        }
        if self.scheduler.grace_time == 0 {
            return Err(OracleError::Configuration(
                "grace_time must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
