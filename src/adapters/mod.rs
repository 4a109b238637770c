use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::errors::{OracleError, OracleResult};
use crate::services::metrics_service::MetricsService;

pub mod auth;
pub mod cache;
pub mod circuit_breaker;
pub mod file;
pub mod rate_limiter;
pub mod rest;
pub mod sql;
pub mod websocket;

pub use auth::{AuthConfig, AuthHandler};
pub use cache::ResponseCache;
pub use circuit_breaker::CircuitBreaker;
pub use rate_limiter::RateLimiter;

/// Kind tag selecting the concrete adapter implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rest,
    #[serde(rename = "ws")]
    WebSocket,
    Sql,
    File,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rest => "rest",
            SourceKind::WebSocket => "ws",
            SourceKind::Sql => "sql",
            SourceKind::File => "file",
        }
    }
}

/// Rate limit window definition: `calls` requests per `period` seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub calls: usize,
    pub period: u64,
}

/// Request-level retry settings applied inside a single fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Value-level validation applied inside the adapter before a point is
/// handed to the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ValueRule {
    Numeric {
        min: Option<f64>,
        max: Option<f64>,
    },
    Categorical {
        allowed_values: Vec<String>,
    },
    Binary,
}

impl ValueRule {
    pub fn check(&self, value: &DataValue) -> bool {
        match (self, value) {
            (ValueRule::Numeric { min, max }, DataValue::Numeric(v)) => {
                min.map_or(true, |m| *v >= m) && max.map_or(true, |m| *v <= m)
            }
            (ValueRule::Categorical { allowed_values }, DataValue::Categorical(v)) => {
                allowed_values.iter().any(|a| a == v)
            }
            (ValueRule::Binary, DataValue::Boolean(_)) => true,
            _ => false,
        }
    }
}

/// Normalization applied after validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum NormalizationRule {
    Numeric {
        scale: Option<f64>,
        decimals: Option<u32>,
    },
    Categorical {
        mapping: HashMap<String, String>,
    },
}

impl NormalizationRule {
    pub fn apply(&self, value: DataValue) -> DataValue {
        match (self, value) {
            (NormalizationRule::Numeric { scale, decimals }, DataValue::Numeric(mut v)) => {
                if let Some(scale) = scale {
                    v *= scale;
                }
                if let Some(decimals) = decimals {
                    let factor = 10f64.powi(*decimals as i32);
                    v = (v * factor).round() / factor;
                }
                DataValue::Numeric(v)
            }
            (NormalizationRule::Categorical { mapping }, DataValue::Categorical(v)) => {
                // Identity when the lookup has no entry.
                match mapping.get(&v) {
                    Some(mapped) => DataValue::Categorical(mapped.clone()),
                    None => DataValue::Categorical(v),
                }
            }
            (_, other) => other,
        }
    }
}

/// Configuration for a single data source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub source_id: String,
    pub source_type: SourceKind,
    /// REST/WS URL, SQL connection URL, or filesystem path.
    pub endpoint: String,
    /// SQL statement for `sql` sources; unused elsewhere.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub validation: Option<ValueRule>,
    #[serde(default)]
    pub normalization: Option<NormalizationRule>,
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_timeout() -> u64 {
    30
}

/// A sampled value from one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Boolean(bool),
    Numeric(f64),
    Categorical(String),
}

impl DataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataValue::Numeric(v) => write!(f, "{}", v),
            DataValue::Categorical(s) => write!(f, "{}", s),
            DataValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// One sample produced by an adapter fetch and consumed once by the
/// validation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub source_id: String,
    pub source_type: SourceKind,
    pub value: DataValue,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

/// Uniform fetch contract over heterogeneous sources.
///
/// `fetch` is idempotent from the caller's perspective: repeated calls
/// within `cache_ttl` return the same point without hitting the source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn connect(&self) -> OracleResult<()>;
    async fn disconnect(&self) -> OracleResult<()>;
    async fn fetch(&self) -> OracleResult<DataPoint>;
    fn config(&self) -> &AdapterConfig;
}

/// Create an adapter instance based on the configured source kind.
pub fn create_adapter(
    config: AdapterConfig,
    metrics: Option<Arc<MetricsService>>,
) -> OracleResult<Arc<dyn SourceAdapter>> {
    match config.source_type {
        SourceKind::Rest => Ok(Arc::new(rest::RestAdapter::new(config, metrics)?)),
        SourceKind::WebSocket => Ok(Arc::new(websocket::WebSocketAdapter::new(config, metrics))),
        SourceKind::Sql => Ok(Arc::new(sql::SqlAdapter::new(config, metrics)?)),
        SourceKind::File => Ok(Arc::new(file::FileAdapter::new(config, metrics))),
    }
}

/// Run a request closure with bounded retries and exponential backoff.
///
/// Rate-limit acquisition is the caller's responsibility and happens once
/// per fetch, not per attempt.
pub(crate) async fn with_retries<T, F, Fut>(retry: &RetryConfig, mut request: F) -> OracleResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OracleResult<T>>,
{
    let mut attempt = 0u32;
    let mut delay = Duration::from_millis(retry.initial_delay_ms);

    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= retry.max_attempts {
                    return Err(err);
                }
                sleep(delay).await;
                delay = delay.mul_f64(retry.backoff_multiplier);
            }
        }
    }
}

/// Turn a raw JSON payload into a validated, normalized data point.
///
/// Primitive payloads are wrapped as `{value: payload}`; object payloads
/// must carry a `value` field, with the remaining fields kept as metadata.
pub(crate) fn process_payload(
    config: &AdapterConfig,
    payload: serde_json::Value,
) -> OracleResult<DataPoint> {
    let (raw_value, metadata) = match payload {
        serde_json::Value::Object(mut map) => {
            let value = map.remove("value").ok_or_else(|| {
                OracleError::DataSource(format!(
                    "Response from {} has no value field",
                    config.source_id
                ))
            })?;
            (value, map.into_iter().collect())
        }
        primitive => (primitive, HashMap::new()),
    };

    let value = match raw_value {
        serde_json::Value::Number(n) => {
            let v = n.as_f64().ok_or_else(|| {
                OracleError::DataSource(format!("Non-finite numeric value from {}", config.source_id))
            })?;
            DataValue::Numeric(v)
        }
        serde_json::Value::Bool(b) => DataValue::Boolean(b),
        serde_json::Value::String(s) => DataValue::Categorical(s),
        other => {
            return Err(OracleError::DataSource(format!(
                "Unsupported value type from {}: {}",
                config.source_id, other
            )))
        }
    };

    if let Some(rule) = &config.validation {
        if !rule.check(&value) {
            return Err(OracleError::DataSource(format!(
                "Value from {} failed adapter validation",
                config.source_id
            )));
        }
    }

    let value = match &config.normalization {
        Some(rule) => rule.apply(value),
        None => value,
    };

    Ok(DataPoint {
        source_id: config.source_id.clone(),
        source_type: config.source_type,
        value,
        timestamp: Utc::now(),
        metadata,
        signature: None,
    })
}
