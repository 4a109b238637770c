pub mod aggregator;
pub mod rules;
pub mod validator;

pub use aggregator::{AggregatedValue, Aggregator};
pub use rules::{
    AnomalyType, RuleCondition, ValidationFinding, ValidationRule, ValidationSeverity,
    ValidationStage,
};
pub use validator::{SourceStats, Validator};
