use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::adapters::{AdapterConfig, DataPoint};
use crate::errors::FailureKind;
use crate::validation::AggregatedValue;

/// Task priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Retry configuration applied per failure class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay in seconds.
    pub backoff_base: f64,
    pub backoff_multiplier: f64,
    /// Ceiling in seconds.
    pub max_delay: u64,
    pub failure_types: HashSet<FailureKind>,
}

impl RetryPolicy {
    /// Default policy derived from task priority.
    pub fn for_priority(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::Critical => Self {
                max_attempts: 5,
                backoff_base: 1.0,
                backoff_multiplier: 2.0,
                max_delay: 300,
                failure_types: [
                    FailureKind::Network,
                    FailureKind::DataSource,
                    FailureKind::Validation,
                    FailureKind::Blockchain,
                    FailureKind::Auth,
                    FailureKind::Resource,
                    FailureKind::Unknown,
                ]
                .into_iter()
                .collect(),
            },
            TaskPriority::High => Self {
                max_attempts: 3,
                backoff_base: 2.0,
                backoff_multiplier: 2.0,
                max_delay: 600,
                failure_types: [
                    FailureKind::Network,
                    FailureKind::DataSource,
                    FailureKind::Blockchain,
                ]
                .into_iter()
                .collect(),
            },
            TaskPriority::Medium => Self {
                max_attempts: 2,
                backoff_base: 5.0,
                backoff_multiplier: 2.0,
                max_delay: 1800,
                failure_types: [FailureKind::Network, FailureKind::DataSource]
                    .into_iter()
                    .collect(),
            },
            TaskPriority::Low => Self {
                max_attempts: 1,
                backoff_base: 10.0,
                backoff_multiplier: 2.0,
                max_delay: 3600,
                failure_types: [FailureKind::Network].into_iter().collect(),
            },
        }
    }

    pub fn retriable(&self, kind: FailureKind) -> bool {
        self.failure_types.contains(&kind)
    }

    /// Backoff delay in seconds for the given retry count,
    /// `min(base * multiplier^retry_count, max_delay)`.
    pub fn delay_secs(&self, retry_count: u32) -> u64 {
        let delay = self.backoff_base * self.backoff_multiplier.powi(retry_count as i32);
        (delay as u64).min(self.max_delay)
    }
}

/// Trigger model: cron expression or fixed interval in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskTrigger {
    Cron(String),
    Interval(u64),
}

/// Oracle update task definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: Uuid,
    pub name: String,
    pub priority: TaskPriority,
    pub trigger: TaskTrigger,
    pub data_sources: Vec<AdapterConfig>,
    /// Validator rules governing this task's sources; must reference
    /// registered rules.
    pub validation_rules: Vec<Uuid>,
    pub min_sources: usize,
    pub max_concurrent: usize,
    /// Execution deadline in seconds.
    pub timeout: u64,
    pub retry_policy: RetryPolicy,
    pub contracts: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_id: Option<Uuid>,
}

/// One execution attempt of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub node_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub data_points: Vec<DataPoint>,
    pub aggregated_value: Option<AggregatedValue>,
    pub error: Option<String>,
    pub retry_count: u32,
    /// Per-stage timings in seconds.
    pub performance_metrics: HashMap<String, f64>,
}

impl TaskExecution {
    pub fn new(task_id: Uuid, node_id: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            task_id,
            node_id: node_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: TaskStatus::Pending,
            data_points: Vec::new(),
            aggregated_value: None,
            error: None,
            retry_count: 0,
            performance_metrics: HashMap::new(),
        }
    }
}

/// Scheduled maintenance window; an empty task set affects every task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub window_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub description: String,
    pub affected_tasks: HashSet<Uuid>,
}

impl MaintenanceWindow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now <= self.end_time
    }

    pub fn covers(&self, task_id: &Uuid, now: DateTime<Utc>) -> bool {
        self.is_active(now) && (self.affected_tasks.is_empty() || self.affected_tasks.contains(task_id))
    }
}

/// Node liveness record written under `scheduler_nodes/{node_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub running_tasks: usize,
    pub total_tasks: usize,
    pub timestamp: DateTime<Utc>,
}

/// Store-level claim on a task held while a node executes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaim {
    pub node_id: String,
    pub claimed_at: DateTime<Utc>,
}
