use std::sync::Arc;

use crate::config::{OracleConfig, StoreConfig};
use crate::errors::{OracleError, OracleResult};
use crate::scheduler::store::{FileStore, KeyedStore, MemoryStore};
use crate::scheduler::TaskScheduler;
use crate::services::contract_registry::ContractRegistry;
use crate::services::eth_service::EthereumService;
use crate::services::metrics_service::MetricsService;
use crate::services::oracle_service::OracleService;
use crate::services::signing_service::SigningService;
use crate::validation::{Aggregator, Validator};

/// Composition root wiring configuration into the running services.
///
/// All process-wide singletons live here and are passed by reference;
/// nothing is looked up from ambient context.
pub struct OracleApp {
    pub config: OracleConfig,
    pub metrics_registry: prometheus::Registry,
    pub metrics: Arc<MetricsService>,
    pub registry: Arc<ContractRegistry>,
    pub eth_service: Arc<EthereumService>,
    pub signer: Arc<SigningService>,
    pub scheduler: Arc<TaskScheduler>,
}

impl OracleApp {
    pub fn version() -> String {
        format!(
            "{} ({})",
            env!("CARGO_PKG_VERSION"),
            option_env!("BUILD_SHA")
                .or(option_env!("GITHUB_SHA"))
                .unwrap_or("dev")
        )
    }

    pub async fn build(config: OracleConfig) -> OracleResult<Self> {
        let metrics_registry = prometheus::Registry::new();
        let metrics = Arc::new(
            MetricsService::new(&metrics_registry)
                .map_err(|e| OracleError::Configuration(format!("Metrics setup failed: {}", e)))?,
        );

        let store: Arc<dyn KeyedStore> = match &config.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::File { data_dir } => Arc::new(FileStore::new(data_dir.clone())),
        };

        let registry = Arc::new(ContractRegistry::new(Some(Arc::clone(&metrics))));
        let eth_service = Arc::new(EthereumService::new(
            config.network.clone(),
            OracleConfig::private_key(),
            Some(Arc::clone(&metrics)),
        )?);
        let signer = Arc::new(SigningService::generate()?);
        let validator = Arc::new(Validator::new(config.validator.clone()));
        let aggregator = Aggregator::new(config.validator.outlier_threshold);

        let oracle = Arc::new(OracleService::new(
            validator,
            aggregator,
            Arc::clone(&signer),
            Arc::clone(&eth_service),
            Arc::clone(&registry),
            config.validator.confidence_threshold,
            Some(Arc::clone(&metrics)),
        )?);

        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler.clone(),
            config.node_id.clone(),
            store,
            oracle,
            Some(Arc::clone(&metrics)),
        ));

        Ok(Self {
            config,
            metrics_registry,
            metrics,
            registry,
            eth_service,
            signer,
            scheduler,
        })
    }

    /// Load persisted state and start the background loops.
    pub async fn start(&self) -> OracleResult<()> {
        self.scheduler.initialize().await?;
        self.scheduler.start().await;
        self.eth_service.start_monitoring().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.eth_service.shutdown().await;
    }
}
