use serde::{Deserialize, Serialize};

/// Convenience alias used throughout the crate.
pub type OracleResult<T> = std::result::Result<T, OracleError>;

/// Custom error types for oracle operations
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Blockchain error: {0}")]
    Blockchain(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Circuit breaker is open for source {0}")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout error: operation timed out after {0}s")]
    Timeout(u64),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Categorized failure classes used by retry policies to decide whether a
/// failed execution is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Network,
    DataSource,
    Validation,
    Blockchain,
    Auth,
    Resource,
    Unknown,
}

impl OracleError {
    /// Map an error to its failure class for retry routing.
    ///
    /// CircuitOpen routes like a data source failure but is never counted
    /// toward the breaker itself.
    pub fn kind(&self) -> FailureKind {
        match self {
            OracleError::Network(_) => FailureKind::Network,
            OracleError::DataSource(_) => FailureKind::DataSource,
            OracleError::CircuitOpen(_) => FailureKind::DataSource,
            OracleError::Serialization(_) => FailureKind::DataSource,
            OracleError::Validation(_) => FailureKind::Validation,
            OracleError::Blockchain(_) => FailureKind::Blockchain,
            OracleError::Auth(_) => FailureKind::Auth,
            OracleError::Resource(_) => FailureKind::Resource,
            OracleError::Timeout(_) => FailureKind::Resource,
            OracleError::Storage(_) => FailureKind::Resource,
            OracleError::Configuration(_) => FailureKind::Unknown,
            OracleError::Unknown(_) => FailureKind::Unknown,
        }
    }

    /// Short label used in `source_errors{error_kind}` metric samples.
    pub fn metric_label(&self) -> &'static str {
        match self.kind() {
            FailureKind::Network => "network",
            FailureKind::DataSource => "data_source",
            FailureKind::Validation => "validation",
            FailureKind::Blockchain => "blockchain",
            FailureKind::Auth => "auth",
            FailureKind::Resource => "resource",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            OracleError::Network(err.to_string())
        } else {
            OracleError::DataSource(err.to_string())
        }
    }
}

impl From<serde_json::Error> for OracleError {
    fn from(err: serde_json::Error) -> Self {
        OracleError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for OracleError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => OracleError::Network(e.to_string()),
            sqlx::Error::PoolTimedOut => OracleError::Network(err.to_string()),
            other => OracleError::DataSource(other.to_string()),
        }
    }
}

impl From<ethers::providers::ProviderError> for OracleError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        OracleError::Blockchain(err.to_string())
    }
}
