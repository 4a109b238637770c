use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::str::FromStr;

use super::types::TaskTrigger;
use crate::errors::{OracleError, OracleResult};

/// Parse a five- or six-field cron expression.
///
/// Five-field expressions get a zero seconds field prepended; six-field
/// expressions already carry seconds.
pub fn parse_cron(expression: &str) -> OracleResult<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression),
        6 | 7 => expression.to_string(),
        _ => {
            return Err(OracleError::Configuration(format!(
                "Cron expression must have 5 or 6 fields: {}",
                expression
            )))
        }
    };

    Schedule::from_str(&normalized).map_err(|e| {
        OracleError::Configuration(format!("Invalid cron expression '{}': {}", expression, e))
    })
}

/// Validate a trigger definition at task creation time.
pub fn validate_trigger(trigger: &TaskTrigger) -> OracleResult<()> {
    match trigger {
        TaskTrigger::Cron(expression) => {
            parse_cron(expression)?;
            Ok(())
        }
        TaskTrigger::Interval(seconds) if *seconds == 0 => Err(OracleError::Configuration(
            "Interval trigger must be positive".to_string(),
        )),
        TaskTrigger::Interval(_) => Ok(()),
    }
}

/// Deterministic next fire time strictly after `after`.
pub fn next_fire(trigger: &TaskTrigger, after: DateTime<Utc>) -> OracleResult<DateTime<Utc>> {
    match trigger {
        TaskTrigger::Interval(seconds) => Ok(after + ChronoDuration::seconds(*seconds as i64)),
        TaskTrigger::Cron(expression) => {
            let schedule = parse_cron(expression)?;
            schedule.after(&after).next().ok_or_else(|| {
                OracleError::Configuration(format!(
                    "Cron expression '{}' has no upcoming fire time",
                    expression
                ))
            })
        }
    }
}
