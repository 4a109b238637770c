use prometheus::{
    register_gauge_vec_with_registry, register_gauge_with_registry,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, Gauge, GaugeVec,
    HistogramVec, IntCounterVec, Registry,
};

/// Push-style metrics sink shared by every component.
///
/// Counters are monotone with label sets, gauges are float snapshots, and
/// histograms collect duration observations. The registry is owned by the
/// caller so embedders can expose it however they like.
pub struct MetricsService {
    pub oracle_updates: IntCounterVec,
    pub source_errors: IntCounterVec,
    pub task_executions: IntCounterVec,
    pub contract_operation_errors: IntCounterVec,
    pub oracle_update_duration: HistogramVec,
    pub source_latency: HistogramVec,
    pub task_duration: HistogramVec,
    pub blockchain_operation_duration: HistogramVec,
    pub system_memory: Gauge,
    pub system_cpu: Gauge,
    pub pending_transactions: GaugeVec,
    pub current_block_number: GaugeVec,
    pub contract_security_score: GaugeVec,
    pub source_value: GaugeVec,
}

impl MetricsService {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            oracle_updates: register_int_counter_vec_with_registry!(
                "oracle_updates",
                "Oracle value submissions by contract and status",
                &["contract_id", "status"],
                registry
            )?,
            source_errors: register_int_counter_vec_with_registry!(
                "source_errors",
                "Data source failures by source and error kind",
                &["source_id", "error_kind"],
                registry
            )?,
            task_executions: register_int_counter_vec_with_registry!(
                "task_executions",
                "Task execution outcomes by task and status",
                &["task_id", "status"],
                registry
            )?,
            contract_operation_errors: register_int_counter_vec_with_registry!(
                "contract_operation_error",
                "Contract registry and submission failures",
                &["operation", "error_kind"],
                registry
            )?,
            oracle_update_duration: register_histogram_vec_with_registry!(
                "oracle_update_duration",
                "End-to-end oracle update duration in seconds",
                &["contract_id"],
                registry
            )?,
            source_latency: register_histogram_vec_with_registry!(
                "source_latency",
                "Source operation latency in seconds",
                &["source_id", "operation", "source_type"],
                registry
            )?,
            task_duration: register_histogram_vec_with_registry!(
                "task_duration",
                "Task execution duration in seconds",
                &["task_id", "status"],
                registry
            )?,
            blockchain_operation_duration: register_histogram_vec_with_registry!(
                "blockchain_operation_duration",
                "Blockchain RPC operation duration in seconds",
                &["operation"],
                registry
            )?,
            system_memory: register_gauge_with_registry!(
                "system_memory",
                "Resident memory in bytes",
                registry
            )?,
            system_cpu: register_gauge_with_registry!(
                "system_cpu",
                "CPU utilisation percentage",
                registry
            )?,
            pending_transactions: register_gauge_vec_with_registry!(
                "pending_transactions",
                "Transactions tracked as pending",
                &["network"],
                registry
            )?,
            current_block_number: register_gauge_vec_with_registry!(
                "current_block_number",
                "Latest observed block number",
                &["network"],
                registry
            )?,
            contract_security_score: register_gauge_vec_with_registry!(
                "contract_security_score",
                "Security score of registered contract versions",
                &["contract_id"],
                registry
            )?,
            source_value: register_gauge_vec_with_registry!(
                "source_value",
                "Latest numeric value observed per source",
                &["source_id", "source_type"],
                registry
            )?,
        })
    }

    pub fn record_source_latency(
        &self,
        source_id: &str,
        operation: &str,
        source_type: &str,
        seconds: f64,
    ) {
        self.source_latency
            .with_label_values(&[source_id, operation, source_type])
            .observe(seconds);
    }

    pub fn record_source_error(&self, source_id: &str, error_kind: &str) {
        self.source_errors
            .with_label_values(&[source_id, error_kind])
            .inc();
    }

    pub fn record_source_value(&self, source_id: &str, source_type: &str, value: f64) {
        self.source_value
            .with_label_values(&[source_id, source_type])
            .set(value);
    }

    pub fn record_task_execution(&self, task_id: &str, status: &str, duration_secs: f64) {
        self.task_executions
            .with_label_values(&[task_id, status])
            .inc();
        self.task_duration
            .with_label_values(&[task_id, status])
            .observe(duration_secs);
    }

    pub fn record_missed_fire(&self, task_id: &str) {
        self.task_executions
            .with_label_values(&[task_id, "missed"])
            .inc();
    }

    pub fn record_oracle_update(&self, contract_id: &str, status: &str, duration_secs: f64) {
        self.oracle_updates
            .with_label_values(&[contract_id, status])
            .inc();
        self.oracle_update_duration
            .with_label_values(&[contract_id])
            .observe(duration_secs);
    }
}
