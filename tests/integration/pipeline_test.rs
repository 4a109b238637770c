use ethers::types::U256;
use serde_json::json;
use std::io::Write;

use oracle_control_plane::config::ValidatorConfig;
use oracle_control_plane::scheduler::types::{TaskStatus, TaskTrigger};
use oracle_control_plane::scheduler::TaskSpec;

use crate::fixtures::{
    build_stack, file_source, register_deployed_contract, rest_source, scheduler_config,
};
use crate::helpers::{spawn_json_server, spawn_mock_chain};

/// Happy path: three REST sources agree, the weighted mean is signed and
/// submitted on-chain for the task's contract.
#[tokio::test]
async fn test_happy_path_three_rest_sources() {
    let chain = spawn_mock_chain(true).await;
    let stack = build_stack(
        &chain.url,
        ValidatorConfig::default(),
        0.5,
        scheduler_config(),
    )
    .await;
    let contract_id = register_deployed_contract(&stack.registry).await;

    let source_a = spawn_json_server(json!(100.0)).await;
    let source_b = spawn_json_server(json!(100.5)).await;
    let source_c = spawn_json_server(json!(99.5)).await;

    let mut spec = TaskSpec::new("eth_usd_feed", TaskTrigger::Interval(60));
    spec.data_sources = vec![
        rest_source("src_a", &source_a.url),
        rest_source("src_b", &source_b.url),
        rest_source("src_c", &source_c.url),
    ];
    spec.min_sources = 3;
    spec.contracts = vec![contract_id];
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
    assert_eq!(execution.status, TaskStatus::Completed, "{:?}", execution.error);

    let aggregated = execution.aggregated_value.expect("aggregated value");
    assert!((aggregated.value - 100.0).abs() < 1e-9);
    assert_eq!(aggregated.num_sources, 3);
    assert!(aggregated.confidence > 0.5);

    // One transaction submitted, carrying the scaled value in calldata.
    let sent = chain.sent_transactions().await;
    assert_eq!(sent.len(), 1);
    let input = &sent[0].1.input;
    assert!(input.len() >= 36);
    let encoded_value = U256::from_big_endian(&input[4..36]);
    assert_eq!(encoded_value, U256::from(10_000_000_000u64));

    for stage in ["fetch", "validate", "aggregate", "submit"] {
        assert!(execution.performance_metrics.contains_key(stage));
    }

    assert_eq!(
        stack
            .metrics
            .oracle_updates
            .with_label_values(&[&contract_id.to_string(), "success"])
            .get(),
        1
    );
}

/// One wild value among four is dropped by the aggregator's outlier filter.
#[tokio::test]
async fn test_outlier_source_is_excluded() {
    let stack = build_stack(
        "http://127.0.0.1:1/",
        ValidatorConfig::default(),
        0.0,
        scheduler_config(),
    )
    .await;

    let source_a = spawn_json_server(json!(100.0)).await;
    let source_b = spawn_json_server(json!(101.0)).await;
    let source_c = spawn_json_server(json!(99.0)).await;
    let source_d = spawn_json_server(json!(5000.0)).await;

    let mut spec = TaskSpec::new("outlier_feed", TaskTrigger::Interval(60));
    spec.data_sources = vec![
        rest_source("src_a", &source_a.url),
        rest_source("src_b", &source_b.url),
        rest_source("src_c", &source_c.url),
        rest_source("src_d", &source_d.url),
    ];
    spec.min_sources = 3;
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

    assert_eq!(execution.status, TaskStatus::Completed, "{:?}", execution.error);
    let aggregated = execution.aggregated_value.expect("aggregated value");
    assert_eq!(aggregated.num_sources, 3);
    assert!((aggregated.value - 100.0).abs() < 1.0);
}

/// A rapid change after sufficient history rejects the point; with a single
/// source the execution fails and nothing reaches the chain.
#[tokio::test]
async fn test_rapid_change_blocks_submission() {
    let chain = spawn_mock_chain(true).await;
    let validator_config = ValidatorConfig {
        min_history_points: 3,
        ..ValidatorConfig::default()
    };
    let stack = build_stack(&chain.url, validator_config, 0.0, scheduler_config()).await;
    let contract_id = register_deployed_contract(&stack.registry).await;

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "100.0").expect("write");
    let path = file.path().to_str().unwrap().to_string();

    let mut spec = TaskSpec::new("file_feed", TaskTrigger::Interval(60));
    spec.data_sources = vec![file_source("file_src", &path)];
    spec.contracts = vec![contract_id];
    let task = stack.scheduler.create_task(spec).await.expect("create task");

    // Three steady ticks build up history and submit normally.
    for _ in 0..3 {
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
        assert_eq!(execution.status, TaskStatus::Completed, "{:?}", execution.error);
    }
    let submitted_before = chain.sent_transactions().await.len();
    assert_eq!(submitted_before, 3);

    // A doubled value within a second trips the temporal stage.
    file.as_file_mut().set_len(0).expect("truncate");
    let mut handle = file.reopen().expect("reopen");
    write!(handle, "200.0").expect("write");
    // Make sure the new point lands on a later millisecond than the last.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

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
    assert!(execution
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("No valid data points"));
    assert_eq!(chain.sent_transactions().await.len(), submitted_before);
}

/// Low confidence below the configured threshold fails the tick.
#[tokio::test]
async fn test_low_confidence_fails_tick() {
    let stack = build_stack(
        "http://127.0.0.1:1/",
        ValidatorConfig::default(),
        0.9,
        scheduler_config(),
    )
    .await;

    let source = spawn_json_server(json!(100.0)).await;
    let mut spec = TaskSpec::new("single_source", TaskTrigger::Interval(60));
    spec.data_sources = vec![rest_source("solo", &source.url)];
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
    assert!(execution
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Low confidence"));
}

/// Fewer accepted sources than the task minimum fails the tick.
#[tokio::test]
async fn test_min_sources_enforced() {
    let stack = build_stack(
        "http://127.0.0.1:1/",
        ValidatorConfig::default(),
        0.0,
        scheduler_config(),
    )
    .await;

    let source = spawn_json_server(json!(100.0)).await;
    let mut spec = TaskSpec::new("under_provisioned", TaskTrigger::Interval(60));
    spec.data_sources = vec![rest_source("only_one", &source.url)];
    spec.min_sources = 3;
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
