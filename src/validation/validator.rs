use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rsa::pss::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use super::rules::{
    default_rules, AnomalyType, RuleContext, ValidationFinding, ValidationRule,
    ValidationSeverity, ValidationStage,
};
use crate::adapters::DataPoint;
use crate::config::ValidatorConfig;
use crate::services::signing_service::canonical_source_message;

/// Rolling statistics for one source, recomputed after each accepted point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub last_update: DateTime<Utc>,
    /// Mean interval between accepted points, in seconds.
    pub update_frequency: f64,
    pub confidence_score: f64,
}

/// Multi-stage validation pipeline.
///
/// State is partitioned by source id: history, stats, keys and findings for
/// one source are written behind the service locks while reads of other
/// sources proceed independently.
pub struct Validator {
    config: ValidatorConfig,
    rules: RwLock<HashMap<Uuid, ValidationRule>>,
    historical_data: RwLock<HashMap<String, Vec<(DateTime<Utc>, f64)>>>,
    source_stats: RwLock<HashMap<String, SourceStats>>,
    source_keys: RwLock<HashMap<String, RsaPublicKey>>,
    findings: RwLock<Vec<ValidationFinding>>,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        let rules = default_rules()
            .into_iter()
            .map(|r| (r.rule_id, r))
            .collect();

        Self {
            config,
            rules: RwLock::new(rules),
            historical_data: RwLock::new(HashMap::new()),
            source_stats: RwLock::new(HashMap::new()),
            source_keys: RwLock::new(HashMap::new()),
            findings: RwLock::new(Vec::new()),
        }
    }

    /// Validate a single data point through all applicable stages.
    ///
    /// Returns acceptance plus the findings produced along the way. On
    /// acceptance the point is appended to the source history and the
    /// source statistics are recomputed.
    pub async fn validate_data_point(&self, point: &DataPoint) -> (bool, Vec<ValidationFinding>) {
        let mut findings = Vec::new();
        let numeric = point.value.as_f64();

        let source_ok = self.validate_source(point, numeric, &mut findings).await;
        if !source_ok {
            self.store_findings(&findings).await;
            return (false, findings);
        }

        if let Some(value) = numeric {
            if !self.validate_cross_source(point, value, &mut findings).await {
                self.store_findings(&findings).await;
                return (false, findings);
            }
            if !self.validate_temporal(point, value, &mut findings).await {
                self.store_findings(&findings).await;
                return (false, findings);
            }
            if !self.validate_consensus(point, value, &mut findings).await {
                self.store_findings(&findings).await;
                return (false, findings);
            }
        }

        if point.signature.is_some() {
            if !self.validate_cryptographic(point, &mut findings).await {
                self.store_findings(&findings).await;
                return (false, findings);
            }
        }

        if let Some(value) = numeric {
            self.record_accepted(&point.source_id, value, point.timestamp)
                .await;
        }

        self.store_findings(&findings).await;
        (true, findings)
    }

    async fn validate_source(
        &self,
        point: &DataPoint,
        numeric: Option<f64>,
        findings: &mut Vec<ValidationFinding>,
    ) -> bool {
        let value = match numeric {
            Some(v) => v,
            // Rule conditions are numeric; non-numeric points pass this
            // stage unless a cryptographic or adapter-level check rejects
            // them.
            None => return true,
        };

        let rules = self.rules.read().await;
        let stats = self.source_stats.read().await;
        let history = self.historical_data.read().await;

        let previous = history
            .get(&point.source_id)
            .and_then(|h| h.last())
            .map(|(_, v)| *v);

        let mut is_valid = true;
        for rule in rules.values() {
            if !rule.enabled
                || rule.stage != ValidationStage::Source
                || !rule.applies_to(point.source_type.as_str())
            {
                continue;
            }

            let ctx = RuleContext {
                value,
                stats: stats.get(&point.source_id),
                previous,
                consensus: None,
            };

            if !rule.condition.holds(&ctx) {
                findings.push(ValidationFinding {
                    finding_id: Uuid::new_v4(),
                    rule_id: Some(rule.rule_id),
                    source_id: point.source_id.clone(),
                    stage: ValidationStage::Source,
                    severity: rule.severity,
                    anomaly_type: Some(AnomalyType::StatisticalOutlier),
                    message: format!("Source validation failed: {}", rule.description),
                    details: serde_json::json!({ "value": value, "rule": rule.name }),
                    timestamp: Utc::now(),
                });
                if rule.severity.blocks() {
                    is_valid = false;
                }
            }
        }

        is_valid
    }

    async fn validate_cross_source(
        &self,
        point: &DataPoint,
        value: f64,
        findings: &mut Vec<ValidationFinding>,
    ) -> bool {
        let stats = self.source_stats.read().await;
        if stats.len() < 2 {
            return true;
        }

        let mut values: Vec<f64> = stats
            .iter()
            .filter(|(sid, _)| sid.as_str() != point.source_id)
            .map(|(_, s)| s.mean)
            .collect();
        values.push(value);

        let mean = mean(&values);
        let std = population_std(&values, mean);

        if std > 0.0 {
            let z_score = ((value - mean) / std).abs();
            if z_score > 3.0 {
                findings.push(ValidationFinding {
                    finding_id: Uuid::new_v4(),
                    rule_id: None,
                    source_id: point.source_id.clone(),
                    stage: ValidationStage::CrossSource,
                    severity: ValidationSeverity::High,
                    anomaly_type: Some(AnomalyType::ConsensusDeviation),
                    message: "Significant deviation from other sources".to_string(),
                    details: serde_json::json!({
                        "value": value,
                        "mean": mean,
                        "std": std,
                        "z_score": z_score,
                    }),
                    timestamp: Utc::now(),
                });
                return false;
            }
        }

        true
    }

    async fn validate_temporal(
        &self,
        point: &DataPoint,
        value: f64,
        findings: &mut Vec<ValidationFinding>,
    ) -> bool {
        let history = self.historical_data.read().await;
        let series = match history.get(&point.source_id) {
            Some(series) if series.len() >= self.config.min_history_points => series,
            _ => return true,
        };

        let mut is_valid = true;

        if let Some(&(last_ts, last_value)) = series.last() {
            let time_diff = (point.timestamp - last_ts).num_milliseconds() as f64 / 1000.0;
            if time_diff > 0.0 {
                let change_rate = (value - last_value).abs() / (last_value * time_diff);
                if change_rate > self.config.rapid_change_threshold {
                    findings.push(ValidationFinding {
                        finding_id: Uuid::new_v4(),
                        rule_id: None,
                        source_id: point.source_id.clone(),
                        stage: ValidationStage::Temporal,
                        severity: ValidationSeverity::High,
                        anomaly_type: Some(AnomalyType::RapidChange),
                        message: "Suspicious rapid value change".to_string(),
                        details: serde_json::json!({
                            "value": value,
                            "last_value": last_value,
                            "change_rate": change_rate,
                            "time_diff": time_diff,
                        }),
                        timestamp: Utc::now(),
                    });
                    is_valid = false;
                }
            }
        }

        // Pattern break against historical volatility, informational only.
        if series.len() >= 30 {
            let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
            let log_returns: Vec<f64> = values
                .windows(2)
                .filter(|w| w[0] > 0.0 && w[1] > 0.0)
                .map(|w| (w[1] / w[0]).ln())
                .collect();

            if log_returns.len() >= 2 {
                let volatility = {
                    let m = mean(&log_returns);
                    population_std(&log_returns, m)
                };
                if let Some(&(_, last_value)) = series.last() {
                    if last_value > 0.0 && value > 0.0 {
                        let current_return = (value / last_value).ln();
                        if volatility > 0.0 && current_return.abs() > 3.0 * volatility {
                            findings.push(ValidationFinding {
                                finding_id: Uuid::new_v4(),
                                rule_id: None,
                                source_id: point.source_id.clone(),
                                stage: ValidationStage::Temporal,
                                severity: ValidationSeverity::Medium,
                                anomaly_type: Some(AnomalyType::PatternBreak),
                                message: "Break in historical pattern detected".to_string(),
                                details: serde_json::json!({
                                    "value": value,
                                    "volatility": volatility,
                                    "return": current_return,
                                }),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                }
            }
        }

        is_valid
    }

    async fn validate_consensus(
        &self,
        point: &DataPoint,
        value: f64,
        findings: &mut Vec<ValidationFinding>,
    ) -> bool {
        let stats = self.source_stats.read().await;
        if stats.len() < self.config.min_consensus_sources {
            return true;
        }

        let means: Vec<f64> = stats.values().map(|s| s.mean).collect();
        let consensus_median = median(&means);
        let deviations: Vec<f64> = means
            .iter()
            .map(|m| (m - consensus_median).abs())
            .collect();
        let mad = median(&deviations);

        if mad > 0.0 {
            let deviation = (value - consensus_median).abs() / mad;
            if deviation > 3.0 {
                findings.push(ValidationFinding {
                    finding_id: Uuid::new_v4(),
                    rule_id: None,
                    source_id: point.source_id.clone(),
                    stage: ValidationStage::Consensus,
                    severity: ValidationSeverity::High,
                    anomaly_type: Some(AnomalyType::ConsensusDeviation),
                    message: "Significant deviation from consensus".to_string(),
                    details: serde_json::json!({
                        "value": value,
                        "median": consensus_median,
                        "mad": mad,
                        "deviation": deviation,
                    }),
                    timestamp: Utc::now(),
                });
                return false;
            }
        }

        true
    }

    async fn validate_cryptographic(
        &self,
        point: &DataPoint,
        findings: &mut Vec<ValidationFinding>,
    ) -> bool {
        let keys = self.source_keys.read().await;
        let public_key = match keys.get(&point.source_id) {
            Some(key) => key,
            // No registered key means nothing to verify against.
            None => return true,
        };
        let signature_bytes = match &point.signature {
            Some(bytes) => bytes,
            None => return true,
        };

        let message = canonical_source_message(&point.source_id, &point.value, &point.timestamp);
        let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());

        let verified = Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| error!("Malformed signature from {}: {}", point.source_id, e))
            .ok()
            .and_then(|signature| {
                verifying_key
                    .verify(message.as_bytes(), &signature)
                    .map_err(|_| {
                        debug!("Signature verification failed for {}", point.source_id)
                    })
                    .ok()
            })
            .is_some();

        if !verified {
            findings.push(ValidationFinding {
                finding_id: Uuid::new_v4(),
                rule_id: None,
                source_id: point.source_id.clone(),
                stage: ValidationStage::Cryptographic,
                severity: ValidationSeverity::Critical,
                anomaly_type: None,
                message: "Invalid cryptographic signature".to_string(),
                details: serde_json::json!({ "timestamp": point.timestamp.to_rfc3339() }),
                timestamp: Utc::now(),
            });
            return false;
        }

        true
    }

    /// Append an accepted point to the source history, prune entries older
    /// than the history window and recompute the source statistics.
    async fn record_accepted(&self, source_id: &str, value: f64, timestamp: DateTime<Utc>) {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.history_window as i64);

        let series = {
            let mut history = self.historical_data.write().await;
            let series = history.entry(source_id.to_string()).or_default();
            series.push((timestamp, value));
            series.retain(|(ts, _)| *ts > cutoff);
            series.clone()
        };

        if series.len() < self.config.min_history_points {
            return;
        }

        let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
        let value_mean = mean(&values);
        let std_dev = population_std(&values, value_mean);
        let min_value = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_value = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let intervals: Vec<f64> = series
            .windows(2)
            .map(|w| (w[1].0 - w[0].0).num_milliseconds() as f64 / 1000.0)
            .collect();
        let update_frequency = if intervals.is_empty() {
            0.0
        } else {
            mean(&intervals)
        };

        let recency = 1.0;
        let consistency = if value_mean != 0.0 {
            1.0 - std_dev / value_mean
        } else {
            1.0
        };
        let update_regularity = if update_frequency > 0.0 {
            let interval_mean = mean(&intervals);
            1.0 - population_std(&intervals, interval_mean) / update_frequency
        } else {
            1.0
        };

        let confidence_score =
            ((recency + consistency + update_regularity) / 3.0).clamp(0.0, 1.0);

        let mut stats = self.source_stats.write().await;
        stats.insert(
            source_id.to_string(),
            SourceStats {
                mean: value_mean,
                std_dev,
                min_value,
                max_value,
                last_update: timestamp,
                update_frequency,
                confidence_score,
            },
        );
    }

    async fn store_findings(&self, findings: &[ValidationFinding]) {
        if findings.is_empty() {
            return;
        }
        let mut stored = self.findings.write().await;
        stored.extend_from_slice(findings);
    }

    /// Register a source public key for signature verification.
    pub async fn register_source_key(&self, source_id: &str, public_key: RsaPublicKey) {
        let mut keys = self.source_keys.write().await;
        keys.insert(source_id.to_string(), public_key);
    }

    pub async fn add_rule(&self, rule: ValidationRule) {
        let mut rules = self.rules.write().await;
        rules.insert(rule.rule_id, rule);
    }

    pub async fn has_rule(&self, rule_id: &Uuid) -> bool {
        let rules = self.rules.read().await;
        rules.contains_key(rule_id)
    }

    /// Rule ids currently registered, used to validate task references.
    pub async fn rule_ids(&self) -> Vec<Uuid> {
        let rules = self.rules.read().await;
        rules.keys().copied().collect()
    }

    pub async fn set_rule_enabled(&self, rule_id: Uuid, enabled: bool) {
        let mut rules = self.rules.write().await;
        if let Some(rule) = rules.get_mut(&rule_id) {
            rule.enabled = enabled;
        }
    }

    pub async fn get_source_stats(&self, source_id: &str) -> Option<SourceStats> {
        let stats = self.source_stats.read().await;
        stats.get(source_id).cloned()
    }

    /// Reputation weight for aggregation; sources without stats yet weigh 1.
    pub async fn source_confidence(&self, source_id: &str) -> f64 {
        let stats = self.source_stats.read().await;
        stats
            .get(source_id)
            .map(|s| s.confidence_score)
            .unwrap_or(1.0)
    }

    pub async fn history(&self, source_id: &str) -> Vec<(DateTime<Utc>, f64)> {
        let history = self.historical_data.read().await;
        history.get(source_id).cloned().unwrap_or_default()
    }

    /// Get filtered validation findings.
    pub async fn get_findings(
        &self,
        source_id: Option<&str>,
        severity: Option<ValidationSeverity>,
        stage: Option<ValidationStage>,
    ) -> Vec<ValidationFinding> {
        let findings = self.findings.read().await;
        findings
            .iter()
            .filter(|f| source_id.map_or(true, |sid| f.source_id == sid))
            .filter(|f| severity.map_or(true, |s| f.severity == s))
            .filter(|f| stage.map_or(true, |s| f.stage == s))
            .cloned()
            .collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
