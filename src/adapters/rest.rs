use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use async_trait::async_trait;

use super::{
    process_payload, with_retries, AdapterConfig, AuthHandler, DataPoint, RateLimiter,
    ResponseCache, SourceAdapter,
};
use crate::errors::{OracleError, OracleResult};
use crate::services::metrics_service::MetricsService;

/// Adapter for REST API data sources
pub struct RestAdapter {
    config: AdapterConfig,
    http_client: reqwest::Client,
    auth: Option<AuthHandler>,
    rate_limiter: Option<RateLimiter>,
    cache: ResponseCache,
    metrics: Option<Arc<MetricsService>>,
}

impl RestAdapter {
    pub fn new(config: AdapterConfig, metrics: Option<Arc<MetricsService>>) -> OracleResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| OracleError::Network(e.to_string()))?;

        let auth = config.auth.clone().map(AuthHandler::new);
        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(|rl| RateLimiter::new(rl.calls, Duration::from_secs(rl.period)));
        let cache = ResponseCache::new(Duration::from_secs(config.cache_ttl));

        Ok(Self {
            config,
            http_client,
            auth,
            rate_limiter,
            cache,
            metrics,
        })
    }

    async fn request_once(&self, headers: &[(String, String)]) -> OracleResult<DataPoint> {
        let mut request = self.http_client.get(&self.config.endpoint);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OracleError::DataSource(format!(
                "API request failed with status {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OracleError::DataSource(format!("Malformed JSON response: {}", e)))?;

        process_payload(&self.config, payload)
    }
}

#[async_trait]
impl SourceAdapter for RestAdapter {
    async fn connect(&self) -> OracleResult<()> {
        // The HTTP client pools connections lazily; nothing to establish.
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

        let headers = match &self.auth {
            Some(auth) => auth.auth_headers().await?,
            None => Vec::new(),
        };

        let start = Instant::now();
        let result = with_retries(&self.config.retry, || self.request_once(&headers)).await;

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
