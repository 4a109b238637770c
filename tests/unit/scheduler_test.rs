use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::io::Write;
use uuid::Uuid;

use oracle_control_plane::config::{SchedulerConfig, ValidatorConfig};
use oracle_control_plane::scheduler::store::{
    get_json, put_json, KeyedStore, EXECUTIONS_NS, NODES_NS,
};
use oracle_control_plane::scheduler::types::{
    NodeHeartbeat, TaskExecution, TaskPriority, TaskStatus, TaskTrigger,
};
use oracle_control_plane::scheduler::TaskSpec;

use crate::fixtures::{build_stack, file_source, scheduler_config};

fn temp_value_file(value: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "{}", value).expect("write");
    file
}

async fn stack_without_chain() -> crate::fixtures::TestStack {
    // Nothing listens on this endpoint; tasks in these tests carry no
    // contracts so the chain is never reached.
    build_stack(
        "http://127.0.0.1:1/",
        ValidatorConfig::default(),
        0.0,
        scheduler_config(),
    )
    .await
}

#[tokio::test]
async fn test_task_completes_and_records_history() {
    let stack = stack_without_chain().await;
    let file = temp_value_file("100.0");

    let mut spec = TaskSpec::new("file_feed", TaskTrigger::Interval(60));
    spec.data_sources = vec![file_source("file_src", file.path().to_str().unwrap())];
    let task = stack.scheduler.create_task(spec).await.expect("create task");

    let execution_id = stack
        .scheduler
        .run_execution(task.task_id, None)
        .await
        .expect("execution ran");

    let execution = stack
        .scheduler
        .get_execution(&execution_id)
        .await
        .expect("execution recorded");
    assert_eq!(execution.status, TaskStatus::Completed);
    assert_eq!(execution.data_points.len(), 1);
    let aggregated = execution.aggregated_value.expect("aggregated value");
    assert!((aggregated.value - 100.0).abs() < 1e-9);
    assert!(execution.performance_metrics.contains_key("fetch"));
    assert!(execution.performance_metrics.contains_key("duration"));

    let history = stack
        .scheduler
        .get_task_history(task.task_id, 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].execution_id, execution_id);
}

#[tokio::test]
async fn test_maintenance_window_skips_execution() {
    let stack = stack_without_chain().await;
    let file = temp_value_file("50.0");

    let mut spec = TaskSpec::new("gated", TaskTrigger::Interval(60));
    spec.data_sources = vec![file_source("file_src", file.path().to_str().unwrap())];
    let task = stack.scheduler.create_task(spec).await.expect("create task");

    let now = Utc::now();
    stack
        .scheduler
        .create_maintenance_window(
            now - ChronoDuration::minutes(1),
            now + ChronoDuration::minutes(5),
            "rollout",
            HashSet::new(),
        )
        .await
        .expect("window");

    // No execution record, no execution counter for this fire.
    assert!(stack
        .scheduler
        .run_execution(task.task_id, None)
        .await
        .is_none());
    assert!(stack
        .scheduler
        .get_task_history(task.task_id, 10)
        .await
        .expect("history")
        .is_empty());
    assert_eq!(
        stack
            .metrics
            .task_executions
            .with_label_values(&[&task.task_id.to_string(), "completed"])
            .get(),
        0
    );
}

#[tokio::test]
async fn test_scoped_maintenance_window_only_gates_listed_tasks() {
    let stack = stack_without_chain().await;
    let file = temp_value_file("10.0");

    let mut spec_a = TaskSpec::new("listed", TaskTrigger::Interval(60));
    spec_a.data_sources = vec![file_source("src_a", file.path().to_str().unwrap())];
    let task_a = stack
        .scheduler
        .create_task(spec_a)
        .await
        .expect("create task");

    let mut spec_b = TaskSpec::new("unlisted", TaskTrigger::Interval(60));
    spec_b.data_sources = vec![file_source("src_b", file.path().to_str().unwrap())];
    let task_b = stack
        .scheduler
        .create_task(spec_b)
        .await
        .expect("create task");

    let now = Utc::now();
    let mut affected = HashSet::new();
    affected.insert(task_a.task_id);
    stack
        .scheduler
        .create_maintenance_window(
            now - ChronoDuration::minutes(1),
            now + ChronoDuration::minutes(5),
            "partial rollout",
            affected,
        )
        .await
        .expect("window");

    assert!(stack
        .scheduler
        .run_execution(task_a.task_id, None)
        .await
        .is_none());
    assert!(stack
        .scheduler
        .run_execution(task_b.task_id, None)
        .await
        .is_some());
}

#[tokio::test]
async fn test_failed_source_schedules_retries_until_exhausted() {
    let stack = stack_without_chain().await;

    // Medium priority: DataSource failures retry, max_attempts = 2.
    let mut spec = TaskSpec::new("broken_feed", TaskTrigger::Interval(60));
    spec.priority = TaskPriority::Medium;
    spec.data_sources = vec![file_source("missing", "/nonexistent/oracle/feed.json")];
    let task = stack.scheduler.create_task(spec).await.expect("create task");

    let execution_id = stack
        .scheduler
        .run_execution(task.task_id, None)
        .await
        .expect("execution ran");

    let execution = stack
        .scheduler
        .get_execution(&execution_id)
        .await
        .expect("recorded");
    assert_eq!(execution.status, TaskStatus::Retrying);
    assert_eq!(execution.retry_count, 0);
    assert!(execution.error.is_some());

    // First retry fails again but stays under max_attempts.
    stack
        .scheduler
        .run_execution(task.task_id, Some(execution_id))
        .await
        .expect("retry ran");
    let execution = stack
        .scheduler
        .get_execution(&execution_id)
        .await
        .expect("recorded");
    assert_eq!(execution.status, TaskStatus::Retrying);
    assert_eq!(execution.retry_count, 1);

    // Second retry exhausts the policy and terminalizes.
    stack
        .scheduler
        .run_execution(task.task_id, Some(execution_id))
        .await
        .expect("retry ran");
    let execution = stack
        .scheduler
        .get_execution(&execution_id)
        .await
        .expect("recorded");
    assert_eq!(execution.status, TaskStatus::Failed);
    assert_eq!(execution.retry_count, 2);
}

#[tokio::test]
async fn test_validation_failure_is_not_retried_for_medium_priority() {
    let stack = stack_without_chain().await;
    // Negative value trips the default range rule: ValidationError.
    let file = temp_value_file("-5.0");

    let mut spec = TaskSpec::new("invalid_feed", TaskTrigger::Interval(60));
    spec.priority = TaskPriority::Medium;
    spec.data_sources = vec![file_source("neg_src", file.path().to_str().unwrap())];
    let task = stack.scheduler.create_task(spec).await.expect("create task");

    let execution_id = stack
        .scheduler
        .run_execution(task.task_id, None)
        .await
        .expect("execution ran");
    let execution = stack
        .scheduler
        .get_execution(&execution_id)
        .await
        .expect("recorded");
    assert_eq!(execution.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_cancel_execution() {
    let stack = stack_without_chain().await;

    let mut spec = TaskSpec::new("to_cancel", TaskTrigger::Interval(60));
    spec.priority = TaskPriority::Medium;
    spec.data_sources = vec![file_source("missing", "/nonexistent/oracle/feed.json")];
    let task = stack.scheduler.create_task(spec).await.expect("create task");

    let execution_id = stack
        .scheduler
        .run_execution(task.task_id, None)
        .await
        .expect("execution ran");

    stack
        .scheduler
        .cancel_execution(execution_id)
        .await
        .expect("cancel succeeds");
    let execution = stack
        .scheduler
        .get_execution(&execution_id)
        .await
        .expect("recorded");
    assert_eq!(execution.status, TaskStatus::Cancelled);

    // Terminal executions cannot be cancelled twice.
    assert!(stack.scheduler.cancel_execution(execution_id).await.is_err());
}

#[tokio::test]
async fn test_gc_drops_old_and_force_fails_stale() {
    let stack = stack_without_chain().await;
    let store: &dyn KeyedStore = stack.store.as_ref();

    // Terminal execution past retention.
    let mut old_execution = TaskExecution::new(Uuid::new_v4(), "test-node");
    old_execution.status = TaskStatus::Completed;
    old_execution.start_time = Utc::now() - ChronoDuration::days(9);
    old_execution.end_time = Some(Utc::now() - ChronoDuration::days(8));
    put_json(
        store,
        EXECUTIONS_NS,
        &old_execution.execution_id.to_string(),
        &old_execution,
    )
    .await
    .expect("seed old execution");

    // Stale running execution past the one hour cutoff.
    let mut stale_execution = TaskExecution::new(Uuid::new_v4(), "test-node");
    stale_execution.status = TaskStatus::Running;
    stale_execution.start_time = Utc::now() - ChronoDuration::hours(2);
    put_json(
        store,
        EXECUTIONS_NS,
        &stale_execution.execution_id.to_string(),
        &stale_execution,
    )
    .await
    .expect("seed stale execution");

    stack.scheduler.gc_once().await.expect("gc");

    assert!(store
        .get(EXECUTIONS_NS, &old_execution.execution_id.to_string())
        .await
        .expect("get")
        .is_none());

    let forced: TaskExecution = get_json(
        store,
        EXECUTIONS_NS,
        &stale_execution.execution_id.to_string(),
    )
    .await
    .expect("get")
    .expect("still present");
    assert_eq!(forced.status, TaskStatus::Failed);
    assert_eq!(forced.error.as_deref(), Some("Execution timed out"));
}

#[tokio::test]
async fn test_heartbeat_writes_and_evicts_stale_nodes() {
    let stack = stack_without_chain().await;
    let store: &dyn KeyedStore = stack.store.as_ref();

    // A node that disappeared ten minutes ago.
    let stale = NodeHeartbeat {
        node_id: "dead-node".to_string(),
        running_tasks: 0,
        total_tasks: 0,
        timestamp: Utc::now() - ChronoDuration::minutes(10),
    };
    put_json(store, NODES_NS, "dead-node", &stale)
        .await
        .expect("seed stale node");

    stack.scheduler.heartbeat_once().await.expect("heartbeat");

    let own: NodeHeartbeat = get_json(store, NODES_NS, "test-node")
        .await
        .expect("get")
        .expect("own heartbeat present");
    assert_eq!(own.node_id, "test-node");

    assert!(store
        .get(NODES_NS, "dead-node")
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn test_missed_fire_beyond_grace_is_dropped_and_counted() {
    let mut config = scheduler_config();
    config.grace_time = 1;
    let stack = build_stack(
        "http://127.0.0.1:1/",
        ValidatorConfig::default(),
        0.0,
        config,
    )
    .await;
    let file = temp_value_file("1.0");

    let mut spec = TaskSpec::new("late_task", TaskTrigger::Interval(1));
    spec.data_sources = vec![file_source("src", file.path().to_str().unwrap())];
    let task = stack.scheduler.create_task(spec).await.expect("create task");

    // Let the fire time drift past the grace window before dispatching.
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    stack.scheduler.dispatch_once().await;
    // Give any spuriously spawned execution a moment to land.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(
        stack
            .metrics
            .task_executions
            .with_label_values(&[&task.task_id.to_string(), "missed"])
            .get(),
        1
    );
    assert!(stack
        .scheduler
        .get_task_history(task.task_id, 10)
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn test_update_task_reschedules_and_rederives_policy() {
    let stack = stack_without_chain().await;
    let file = temp_value_file("1.0");

    let mut spec = TaskSpec::new("mutable", TaskTrigger::Interval(60));
    spec.priority = TaskPriority::Low;
    spec.data_sources = vec![file_source("src", file.path().to_str().unwrap())];
    let task = stack.scheduler.create_task(spec).await.expect("create task");
    assert_eq!(task.retry_policy.max_attempts, 1);

    let updated = stack
        .scheduler
        .update_task(
            task.task_id,
            Some(TaskTrigger::Cron("*/5 * * * *".to_string())),
            Some(TaskPriority::Critical),
        )
        .await
        .expect("update");

    assert_eq!(updated.priority, TaskPriority::Critical);
    assert_eq!(updated.retry_policy.max_attempts, 5);
    assert_eq!(
        updated.trigger,
        TaskTrigger::Cron("*/5 * * * *".to_string())
    );
    assert!(stack
        .scheduler
        .next_fire_time(&task.task_id)
        .await
        .is_some());
}
