use chrono::Utc;
use ethers::abi::{parse_abi, Function, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{TransactionRequest, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{create_adapter, CircuitBreaker, DataPoint, SourceAdapter};
use crate::errors::{OracleError, OracleResult};
use crate::scheduler::types::TaskDefinition;
use crate::services::contract_registry::ContractRegistry;
use crate::services::eth_service::{EthereumService, TransactionParams};
use crate::services::metrics_service::MetricsService;
use crate::services::signing_service::{SignedValue, SigningService};
use crate::validation::{Aggregator, Validator};

/// Fixed-point decimals used when encoding values on-chain.
const VALUE_DECIMALS: u32 = 8;

/// Gas estimates get a 20% buffer before submission.
const GAS_BUFFER_NUM: u64 = 12;
const GAS_BUFFER_DEN: u64 = 10;

/// Confirmation wait per oracle update submission, in seconds.
const SUBMIT_WAIT_SECS: u64 = 300;

/// Result of one completed tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub data_points: Vec<DataPoint>,
    pub signed: SignedValue,
    pub tx_hashes: Vec<H256>,
    pub stage_timings: HashMap<String, f64>,
}

/// Orchestrates one oracle update cycle: fan-out fetch through circuit
/// breakers, validation, aggregation, signing and chain submission.
pub struct OracleService {
    validator: Arc<Validator>,
    aggregator: Aggregator,
    signer: Arc<SigningService>,
    eth_service: Arc<EthereumService>,
    registry: Arc<ContractRegistry>,
    update_function: Function,
    confidence_threshold: f64,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: Option<Arc<MetricsService>>,
}

impl OracleService {
    pub fn new(
        validator: Arc<Validator>,
        aggregator: Aggregator,
        signer: Arc<SigningService>,
        eth_service: Arc<EthereumService>,
        registry: Arc<ContractRegistry>,
        confidence_threshold: f64,
        metrics: Option<Arc<MetricsService>>,
    ) -> OracleResult<Self> {
        let abi = parse_abi(&[
            "function updateOracleData(uint256 value, uint256 timestamp, bytes signature)",
        ])
        .map_err(|e| OracleError::Configuration(format!("Oracle ABI parse failed: {}", e)))?;
        let update_function = abi
            .function("updateOracleData")
            .map_err(|e| OracleError::Configuration(format!("Oracle ABI missing function: {}", e)))?
            .clone();

        Ok(Self {
            validator,
            aggregator,
            signer,
            eth_service,
            registry,
            update_function,
            confidence_threshold,
            breakers: RwLock::new(HashMap::new()),
            metrics,
        })
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    /// Run a single update cycle for a task. Produces at most one signed
    /// value and one submission per contract.
    pub async fn execute_update(&self, task: &TaskDefinition) -> OracleResult<TickOutcome> {
        let mut stage_timings = HashMap::new();

        // Fan out adapter fetches.
        let fetch_start = Instant::now();
        let raw_points = self.fetch_all_sources(task).await?;
        stage_timings.insert("fetch".to_string(), fetch_start.elapsed().as_secs_f64());

        if raw_points.is_empty() {
            return Err(OracleError::DataSource(
                "No data points fetched from any source".to_string(),
            ));
        }

        // Validate each point through the pipeline.
        let validate_start = Instant::now();
        let mut accepted = Vec::new();
        for point in raw_points {
            let (is_valid, findings) = self.validator.validate_data_point(&point).await;
            if is_valid {
                accepted.push(point);
            } else {
                debug!(
                    "Point from {} rejected with {} findings",
                    point.source_id,
                    findings.len()
                );
            }
        }
        stage_timings.insert(
            "validate".to_string(),
            validate_start.elapsed().as_secs_f64(),
        );

        if accepted.is_empty() {
            return Err(OracleError::Validation(
                "No valid data points in update cycle".to_string(),
            ));
        }

        // Aggregate with reputation-derived weights.
        let aggregate_start = Instant::now();
        let mut weights = Vec::with_capacity(accepted.len());
        for point in &accepted {
            weights.push(self.validator.source_confidence(&point.source_id).await);
        }
        let aggregated = self.aggregator.aggregate(&accepted, &weights)?;
        stage_timings.insert(
            "aggregate".to_string(),
            aggregate_start.elapsed().as_secs_f64(),
        );

        if aggregated.num_sources < task.min_sources {
            return Err(OracleError::Validation(format!(
                "Low confidence aggregate: {} sources, {} required",
                aggregated.num_sources, task.min_sources
            )));
        }
        if aggregated.confidence < self.confidence_threshold {
            return Err(OracleError::Validation(format!(
                "Low confidence aggregate: confidence {:.3} below threshold {:.3}",
                aggregated.confidence, self.confidence_threshold
            )));
        }

        // Sign exactly once per tick.
        let signed = self.signer.sign(&aggregated, Utc::now());

        // Submit to every contract attached to the task.
        let submit_start = Instant::now();
        let tx_hashes = self.submit_to_contracts(&task.contracts, &signed).await?;
        stage_timings.insert("submit".to_string(), submit_start.elapsed().as_secs_f64());

        Ok(TickOutcome {
            data_points: accepted,
            signed,
            tx_hashes,
            stage_timings,
        })
    }

    async fn breaker_for(&self, source_id: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(source_id) {
                return Arc::clone(breaker);
            }
        }
        let mut breakers = self.breakers.write().await;
        Arc::clone(
            breakers
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::default())),
        )
    }

    /// Fetch from all task sources concurrently; failed sources are logged
    /// and skipped, survivors flow into validation.
    async fn fetch_all_sources(&self, task: &TaskDefinition) -> OracleResult<Vec<DataPoint>> {
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::with_capacity(task.data_sources.len());
        for config in &task.data_sources {
            adapters.push(create_adapter(config.clone(), self.metrics.clone())?);
        }

        let fetches = adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            async move {
                let source_id = adapter.config().source_id.clone();
                let breaker = self.breaker_for(&source_id).await;
                let result = breaker
                    .guard(&source_id, || {
                        let adapter = Arc::clone(&adapter);
                        async move { adapter.fetch().await }
                    })
                    .await;
                (source_id, result)
            }
        });

        let results = futures::future::join_all(fetches).await;

        let mut points = Vec::new();
        for (source_id, result) in results {
            match result {
                Ok(point) => points.push(point),
                Err(e) => warn!("Source {} failed: {}", source_id, e),
            }
        }

        // Sockets, pools and receivers are released before validation runs.
        for adapter in &adapters {
            if let Err(e) = adapter.disconnect().await {
                debug!("Adapter disconnect failed: {}", e);
            }
        }

        Ok(points)
    }

    async fn submit_to_contracts(
        &self,
        contracts: &[Uuid],
        signed: &SignedValue,
    ) -> OracleResult<Vec<H256>> {
        let mut tx_hashes = Vec::new();

        for contract_id in contracts {
            let update_start = Instant::now();
            match self.submit_single(contract_id, signed).await {
                Ok(Some(tx_hash)) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_oracle_update(
                            &contract_id.to_string(),
                            "success",
                            update_start.elapsed().as_secs_f64(),
                        );
                    }
                    tx_hashes.push(tx_hash);
                }
                Ok(None) => {}
                Err(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_oracle_update(
                            &contract_id.to_string(),
                            "failed",
                            update_start.elapsed().as_secs_f64(),
                        );
                        metrics
                            .contract_operation_errors
                            .with_label_values(&["update_oracle_data", e.metric_label()])
                            .inc();
                    }
                    return Err(e);
                }
            }
        }

        Ok(tx_hashes)
    }

    async fn submit_single(
        &self,
        contract_id: &Uuid,
        signed: &SignedValue,
    ) -> OracleResult<Option<H256>> {
        let metadata = match self.registry.get_contract(contract_id).await {
            Some(metadata) => metadata,
            None => {
                warn!("Contract not found for id {}", contract_id);
                return Ok(None);
            }
        };
        if !metadata.is_active || metadata.address == ethers::types::Address::zero() {
            debug!("Skipping inactive or undeployed contract {}", contract_id);
            return Ok(None);
        }

        let scaled = scale_value(signed.aggregated.value)?;
        let timestamp = U256::from(signed.produced_at.timestamp().max(0) as u64);
        let data = self
            .update_function
            .encode_input(&[
                Token::Uint(scaled),
                Token::Uint(timestamp),
                Token::Bytes(signed.signature.clone()),
            ])
            .map_err(|e| OracleError::Serialization(format!("ABI encoding failed: {}", e)))?;

        let mut request = TransactionRequest::new()
            .to(metadata.address)
            .value(U256::zero())
            .data(data.clone());
        if let Some(from) = self.eth_service.signer_address() {
            request = request.from(from);
        }
        let typed: TypedTransaction = request.into();
        let gas_estimate = self.eth_service.estimate_gas(&typed).await?;
        let gas = gas_estimate * GAS_BUFFER_NUM / GAS_BUFFER_DEN;

        let tx_hash = self
            .eth_service
            .send_transaction(TransactionParams {
                to: metadata.address,
                value: U256::zero(),
                data: data.into(),
                gas: Some(gas),
                nonce: None,
                gas_price: None,
            })
            .await?;

        let receipt = self
            .eth_service
            .wait_for_transaction(tx_hash, Some(SUBMIT_WAIT_SECS), None)
            .await?;
        if receipt.status.map(|s| s.as_u64()) != Some(1) {
            return Err(OracleError::Blockchain(format!(
                "Transaction reverted: {:?}",
                tx_hash
            )));
        }

        self.registry.mark_updated(contract_id).await;
        info!(
            "Oracle data submitted to contract {:?}, tx {:?}",
            metadata.address, tx_hash
        );
        Ok(Some(tx_hash))
    }
}

/// Encode a floating point value as a fixed-point uint with
/// `VALUE_DECIMALS` decimals.
fn scale_value(value: f64) -> OracleResult<U256> {
    if !value.is_finite() || value < 0.0 {
        return Err(OracleError::Validation(format!(
            "Value {} cannot be encoded on-chain",
            value
        )));
    }
    let scaled = value * 10f64.powi(VALUE_DECIMALS as i32);
    Ok(U256::from(scaled.round() as u128))
}
