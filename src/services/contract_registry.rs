use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::NetworkType;
use crate::errors::{OracleError, OracleResult};
use crate::services::metrics_service::MetricsService;

/// Types of oracle contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractType {
    BasicOracle,
    Aggregator,
    Proxy,
    Consumer,
    Registry,
    AccessControl,
}

/// Contract template with parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractTemplate {
    pub name: String,
    pub contract_type: ContractType,
    pub source_code: String,
    pub parameters: HashMap<String, String>,
    pub description: String,
    pub default_config: serde_json::Value,
}

/// Contract version information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractVersion {
    pub version_id: Uuid,
    pub contract_id: Uuid,
    pub version: String,
    pub source_code: String,
    pub bytecode: String,
    pub abi: serde_json::Value,
    pub compiler_version: String,
    pub created_at: DateTime<Utc>,
    pub security_score: f64,
}

/// Contract instance metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractMetadata {
    pub contract_id: Uuid,
    pub name: String,
    pub contract_type: ContractType,
    pub network: NetworkType,
    /// Zero until the first deployment binds a real address.
    pub address: Address,
    pub current_version: Uuid,
    pub admin_address: Address,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub data_sources: Vec<String>,
    /// Target update interval in seconds.
    pub update_frequency: u64,
    pub min_responses: u32,
    pub consumers: HashSet<Address>,
    pub is_active: bool,
}

/// In-memory catalogue of oracle contract instances, versions and
/// templates. Reads share the lock; mutations hold it briefly.
pub struct ContractRegistry {
    contracts: RwLock<HashMap<Uuid, ContractMetadata>>,
    versions: RwLock<HashMap<Uuid, ContractVersion>>,
    templates: RwLock<HashMap<String, ContractTemplate>>,
    metrics: Option<Arc<MetricsService>>,
}

impl ContractRegistry {
    pub fn new(metrics: Option<Arc<MetricsService>>) -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();

        Self {
            contracts: RwLock::new(HashMap::new()),
            versions: RwLock::new(HashMap::new()),
            templates: RwLock::new(templates),
            metrics,
        }
    }

    /// Register a new contract version. Versions must exist before any
    /// contract metadata can point at them.
    pub async fn register_version(&self, version: ContractVersion) {
        if let Some(metrics) = &self.metrics {
            metrics
                .contract_security_score
                .with_label_values(&[&version.contract_id.to_string()])
                .set(version.security_score);
        }
        let mut versions = self.versions.write().await;
        versions.insert(version.version_id, version);
    }

    /// Register contract metadata. The referenced current version must
    /// already be registered.
    pub async fn register_contract(&self, metadata: ContractMetadata) -> OracleResult<()> {
        {
            let versions = self.versions.read().await;
            if !versions.contains_key(&metadata.current_version) {
                return Err(OracleError::Configuration(format!(
                    "Contract {} references unknown version {}",
                    metadata.contract_id, metadata.current_version
                )));
            }
        }

        info!(
            "Registering contract {} ({:?}) on {:?}",
            metadata.name, metadata.contract_type, metadata.network
        );
        let mut contracts = self.contracts.write().await;
        contracts.insert(metadata.contract_id, metadata);
        Ok(())
    }

    pub async fn get_contract(&self, contract_id: &Uuid) -> Option<ContractMetadata> {
        let contracts = self.contracts.read().await;
        contracts.get(contract_id).cloned()
    }

    pub async fn get_version(&self, version_id: &Uuid) -> Option<ContractVersion> {
        let versions = self.versions.read().await;
        versions.get(version_id).cloned()
    }

    pub async fn get_contracts_by_type(&self, contract_type: ContractType) -> Vec<ContractMetadata> {
        let contracts = self.contracts.read().await;
        contracts
            .values()
            .filter(|c| c.contract_type == contract_type)
            .cloned()
            .collect()
    }

    pub async fn get_contracts_by_network(&self, network: NetworkType) -> Vec<ContractMetadata> {
        let contracts = self.contracts.read().await;
        contracts
            .values()
            .filter(|c| c.network == network)
            .cloned()
            .collect()
    }

    /// All versions registered for a contract, newest first.
    pub async fn get_contract_versions(&self, contract_id: &Uuid) -> Vec<ContractVersion> {
        let versions = self.versions.read().await;
        let mut found: Vec<ContractVersion> = versions
            .values()
            .filter(|v| v.contract_id == *contract_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    /// Bind the on-chain address after deployment. The address mutates from
    /// the zero placeholder exactly once.
    pub async fn mark_deployed(&self, contract_id: &Uuid, address: Address) -> OracleResult<()> {
        let mut contracts = self.contracts.write().await;
        let metadata = contracts.get_mut(contract_id).ok_or_else(|| {
            OracleError::Configuration(format!("Contract not found: {}", contract_id))
        })?;

        if metadata.address != Address::zero() {
            return Err(OracleError::Configuration(format!(
                "Contract {} is already deployed at {:?}",
                contract_id, metadata.address
            )));
        }
        if address == Address::zero() {
            return Err(OracleError::Configuration(
                "Cannot deploy to the zero address".to_string(),
            ));
        }

        metadata.address = address;
        metadata.last_updated = Utc::now();
        info!("Contract {} deployed at {:?}", contract_id, address);
        Ok(())
    }

    /// Record a successful oracle update against the contract.
    pub async fn mark_updated(&self, contract_id: &Uuid) {
        let mut contracts = self.contracts.write().await;
        if let Some(metadata) = contracts.get_mut(contract_id) {
            metadata.last_updated = Utc::now();
        }
    }

    pub async fn add_consumer(&self, contract_id: &Uuid, consumer: Address) -> OracleResult<()> {
        let mut contracts = self.contracts.write().await;
        let metadata = contracts.get_mut(contract_id).ok_or_else(|| {
            OracleError::Configuration(format!("Contract not found: {}", contract_id))
        })?;
        metadata.consumers.insert(consumer);
        metadata.last_updated = Utc::now();
        Ok(())
    }

    pub async fn remove_consumer(&self, contract_id: &Uuid, consumer: &Address) -> OracleResult<()> {
        let mut contracts = self.contracts.write().await;
        let metadata = contracts.get_mut(contract_id).ok_or_else(|| {
            OracleError::Configuration(format!("Contract not found: {}", contract_id))
        })?;
        metadata.consumers.remove(consumer);
        metadata.last_updated = Utc::now();
        Ok(())
    }

    pub async fn get_template(&self, name: &str) -> Option<ContractTemplate> {
        let templates = self.templates.read().await;
        templates.get(name).cloned()
    }

    pub async fn list_templates(&self) -> Vec<ContractTemplate> {
        let templates = self.templates.read().await;
        templates.values().cloned().collect()
    }

    pub async fn register_template(&self, template: ContractTemplate) {
        let mut templates = self.templates.write().await;
        templates.insert(template.name.clone(), template);
    }
}

fn builtin_templates() -> Vec<ContractTemplate> {
    vec![
        ContractTemplate {
            name: "BasicOracle".to_string(),
            contract_type: ContractType::BasicOracle,
            source_code: r#"// SPDX-License-Identifier: Apache-2.0
pragma solidity ^0.8.0;

contract BasicOracle {
    uint256 public latestValue;
    uint256 public latestTimestamp;
    uint256 public immutable minResponses;
    uint256 public immutable updateInterval;
    uint256 public immutable deviationThreshold;

    constructor(uint256 _minResponses, uint256 _updateInterval, uint256 _deviationThreshold) {
        minResponses = _minResponses;
        updateInterval = _updateInterval;
        deviationThreshold = _deviationThreshold;
    }

    function updateOracleData(uint256 value, uint256 timestamp, bytes calldata signature) external {
        latestValue = value;
        latestTimestamp = timestamp;
    }

    function getLatestValue() external view returns (uint256, uint256) {
        return (latestValue, latestTimestamp);
    }
}
"#
            .to_string(),
            parameters: [
                (
                    "min_responses".to_string(),
                    "Minimum number of data sources required".to_string(),
                ),
                (
                    "update_interval".to_string(),
                    "Update interval in seconds".to_string(),
                ),
                (
                    "deviation_threshold".to_string(),
                    "Maximum allowed deviation percentage".to_string(),
                ),
            ]
            .into_iter()
            .collect(),
            description: "Basic oracle contract for single data point reporting".to_string(),
            default_config: serde_json::json!({
                "min_responses": 3,
                "update_interval": 60,
                "deviation_threshold": 100,
            }),
        },
        ContractTemplate {
            name: "AggregatorOracle".to_string(),
            contract_type: ContractType::Aggregator,
            source_code: r#"// SPDX-License-Identifier: Apache-2.0
pragma solidity ^0.8.0;

contract AggregatorOracle {
    address[] private _sources;
    uint8 public immutable aggregationMethod;
    uint256 public immutable heartbeatPeriod;
    uint256 public latestValue;
    uint256 public latestTimestamp;

    constructor(address[] memory sources_, uint8 _aggregationMethod, uint256 _heartbeatPeriod) {
        _sources = sources_;
        aggregationMethod = _aggregationMethod;
        heartbeatPeriod = _heartbeatPeriod;
    }

    function sources() external view returns (address[] memory) {
        return _sources;
    }

    function updateOracleData(uint256 value, uint256 timestamp, bytes calldata signature) external {
        require(timestamp > latestTimestamp + heartbeatPeriod, "heartbeat not due");
        latestValue = value;
        latestTimestamp = timestamp;
    }

    function getLatestValue() external view returns (uint256, uint256) {
        return (latestValue, latestTimestamp);
    }
}
"#
            .to_string(),
            parameters: [
                (
                    "sources".to_string(),
                    "List of source oracle addresses".to_string(),
                ),
                (
                    "aggregation_method".to_string(),
                    "Method to aggregate values (median/mean)".to_string(),
                ),
                (
                    "heartbeat_period".to_string(),
                    "Maximum time between updates".to_string(),
                ),
            ]
            .into_iter()
            .collect(),
            description: "Aggregator contract that combines multiple data sources".to_string(),
            default_config: serde_json::json!({
                "aggregation_method": 1,
                "heartbeat_period": 3600,
            }),
        },
    ]
}
