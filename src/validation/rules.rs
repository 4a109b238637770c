use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::validator::SourceStats;

/// Validation pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationStage {
    /// Individual source validation
    Source,
    /// Cross-source comparison
    CrossSource,
    /// Time-based validation
    Temporal,
    /// Multi-source consensus
    Consensus,
    /// Signature verification
    Cryptographic,
    /// Declared but not wired into the pipeline.
    Formal,
}

/// Finding severity levels; Critical and High block acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ValidationSeverity {
    pub fn blocks(&self) -> bool {
        matches!(self, ValidationSeverity::Critical | ValidationSeverity::High)
    }
}

/// Types of data anomalies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyType {
    StatisticalOutlier,
    RapidChange,
    VolumeMismatch,
    ConsensusDeviation,
    PatternBreak,
    ManipulationSuspect,
}

/// Fixed rule condition language.
///
/// Conditions are tagged variants rather than free-form expressions; each
/// evaluates against the rule context and holds when the point passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "check")]
pub enum RuleCondition {
    /// `min <= value <= max`
    RangeCheck { min: f64, max: f64 },
    /// `|value - mean| / std <= threshold`, skipped without stats.
    ZScoreBound { threshold: f64 },
    /// `|value - previous| / previous <= threshold`, skipped without history.
    PctChangeBound { threshold: f64 },
    /// `|value - consensus| / consensus <= threshold`, skipped without a
    /// consensus value in context.
    ConsensusDeviationBound { threshold: f64 },
}

/// Evaluation context assembled by the validator for rule conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleContext<'a> {
    pub value: f64,
    pub stats: Option<&'a SourceStats>,
    pub previous: Option<f64>,
    pub consensus: Option<f64>,
}

impl RuleCondition {
    pub fn holds(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            RuleCondition::RangeCheck { min, max } => ctx.value >= *min && ctx.value <= *max,
            RuleCondition::ZScoreBound { threshold } => match ctx.stats {
                Some(stats) if stats.std_dev > 0.0 => {
                    ((ctx.value - stats.mean) / stats.std_dev).abs() <= *threshold
                }
                _ => true,
            },
            RuleCondition::PctChangeBound { threshold } => match ctx.previous {
                Some(prev) if prev != 0.0 => ((ctx.value - prev) / prev).abs() <= *threshold,
                _ => true,
            },
            RuleCondition::ConsensusDeviationBound { threshold } => match ctx.consensus {
                Some(consensus) if consensus != 0.0 => {
                    ((ctx.value - consensus) / consensus).abs() <= *threshold
                }
                _ => true,
            },
        }
    }
}

/// Validation rule definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    pub rule_id: Uuid,
    pub name: String,
    pub description: String,
    pub stage: ValidationStage,
    pub severity: ValidationSeverity,
    /// Applicable source kinds; the literal "all" matches everything.
    pub source_types: HashSet<String>,
    pub condition: RuleCondition,
    pub enabled: bool,
}

impl ValidationRule {
    pub fn applies_to(&self, source_type: &str) -> bool {
        self.source_types.contains("all") || self.source_types.contains(source_type)
    }
}

/// Validation finding details attached to a data point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub finding_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub source_id: String,
    pub stage: ValidationStage,
    pub severity: ValidationSeverity,
    pub anomaly_type: Option<AnomalyType>,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Built-in rules installed on validator start.
pub fn default_rules() -> Vec<ValidationRule> {
    let all: HashSet<String> = ["all".to_string()].into_iter().collect();

    vec![
        ValidationRule {
            rule_id: Uuid::new_v4(),
            name: "basic_range_check".to_string(),
            description: "Validate value within allowed range".to_string(),
            stage: ValidationStage::Source,
            severity: ValidationSeverity::Critical,
            source_types: all.clone(),
            condition: RuleCondition::RangeCheck {
                min: 0.0,
                max: f64::INFINITY,
            },
            enabled: true,
        },
        ValidationRule {
            rule_id: Uuid::new_v4(),
            name: "statistical_outlier".to_string(),
            description: "Detect statistical outliers".to_string(),
            stage: ValidationStage::Source,
            severity: ValidationSeverity::High,
            source_types: all.clone(),
            condition: RuleCondition::ZScoreBound { threshold: 3.0 },
            enabled: true,
        },
        ValidationRule {
            rule_id: Uuid::new_v4(),
            name: "rapid_change".to_string(),
            description: "Detect suspicious rapid changes".to_string(),
            stage: ValidationStage::Temporal,
            severity: ValidationSeverity::High,
            source_types: all.clone(),
            condition: RuleCondition::PctChangeBound { threshold: 0.05 },
            enabled: true,
        },
        ValidationRule {
            rule_id: Uuid::new_v4(),
            name: "consensus_check".to_string(),
            description: "Multi-source consensus validation".to_string(),
            stage: ValidationStage::Consensus,
            severity: ValidationSeverity::High,
            source_types: all,
            condition: RuleCondition::ConsensusDeviationBound { threshold: 0.1 },
            enabled: true,
        },
    ]
}
