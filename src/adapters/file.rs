use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use async_trait::async_trait;

use super::{
    process_payload, with_retries, AdapterConfig, DataPoint, RateLimiter, ResponseCache,
    SourceAdapter,
};
use crate::errors::{OracleError, OracleResult};
use crate::services::metrics_service::MetricsService;

/// Adapter for local filesystem sources. The file content is JSON or a
/// plain decimal literal.
pub struct FileAdapter {
    config: AdapterConfig,
    rate_limiter: Option<RateLimiter>,
    cache: ResponseCache,
    metrics: Option<Arc<MetricsService>>,
}

impl FileAdapter {
    pub fn new(config: AdapterConfig, metrics: Option<Arc<MetricsService>>) -> Self {
        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(|rl| RateLimiter::new(rl.calls, Duration::from_secs(rl.period)));
        let cache = ResponseCache::new(Duration::from_secs(config.cache_ttl));

        Self {
            config,
            rate_limiter,
            cache,
            metrics,
        }
    }

    async fn read_file(&self) -> OracleResult<DataPoint> {
        let content = tokio::fs::read_to_string(&self.config.endpoint)
            .await
            .map_err(|e| {
                OracleError::DataSource(format!(
                    "Failed to read {}: {}",
                    self.config.endpoint, e
                ))
            })?;

        let trimmed = content.trim();
        let payload = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => value,
            Err(_) => {
                let number: f64 = trimmed.parse().map_err(|_| {
                    OracleError::DataSource(format!(
                        "File {} is neither JSON nor a decimal literal",
                        self.config.endpoint
                    ))
                })?;
                serde_json::json!(number)
            }
        };

        process_payload(&self.config, payload)
    }
}

#[async_trait]
impl SourceAdapter for FileAdapter {
    async fn connect(&self) -> OracleResult<()> {
        if !Path::new(&self.config.endpoint).exists() {
            return Err(OracleError::DataSource(format!(
                "File not found: {}",
                self.config.endpoint
            )));
        }
        Ok(())
    }

    async fn disconnect(&self) -> OracleResult<()> {
        Ok(())
    }

    async fn fetch(&self) -> OracleResult<DataPoint> {
        if let Some(cached) = self.cache.get(&self.config.endpoint).await {
            debug!("Returning cached value for {}", self.config.source_id);
            return Ok(cached);
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let start = Instant::now();
        let result = with_retries(&self.config.retry, || self.read_file()).await;

        match result {
            Ok(point) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_source_latency(
                        &self.config.source_id,
                        "fetch",
                        self.config.source_type.as_str(),
                        start.elapsed().as_secs_f64(),
                    );
                    if let Some(v) = point.value.as_f64() {
                        metrics.record_source_value(
                            &self.config.source_id,
                            self.config.source_type.as_str(),
                            v,
                        );
                    }
                }
                self.cache.set(&self.config.endpoint, point.clone()).await;
                Ok(point)
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_source_error(&self.config.source_id, err.metric_label());
                }
                Err(err)
            }
        }
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }
}
