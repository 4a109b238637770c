use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod store;
pub mod trigger;
pub mod types;

use crate::adapters::AdapterConfig;
use crate::config::SchedulerConfig;
use crate::errors::{OracleError, OracleResult};
use crate::services::metrics_service::MetricsService;
use crate::services::oracle_service::OracleService;
use store::{get_json, put_json, KeyedStore, CLAIMS_NS, EXECUTIONS_NS, NODES_NS, TASKS_NS, WINDOWS_NS};
use types::{
    MaintenanceWindow, NodeHeartbeat, RetryPolicy, TaskClaim, TaskDefinition, TaskExecution,
    TaskPriority, TaskStatus, TaskTrigger,
};

/// Parameters for creating a new oracle update task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub trigger: TaskTrigger,
    pub data_sources: Vec<AdapterConfig>,
    /// References into the validator's rule set.
    pub validation_rules: Vec<Uuid>,
    pub contracts: Vec<Uuid>,
    pub priority: TaskPriority,
    pub min_sources: usize,
    pub max_concurrent: usize,
    /// Execution deadline in seconds.
    pub timeout: u64,
    pub owner_id: Option<Uuid>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, trigger: TaskTrigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            data_sources: Vec::new(),
            validation_rules: Vec::new(),
            contracts: Vec::new(),
            priority: TaskPriority::Medium,
            min_sources: 1,
            max_concurrent: 1,
            timeout: 300,
            owner_id: None,
        }
    }
}

#[derive(Debug, Clone)]
struct RetryEntry {
    due: DateTime<Utc>,
    task_id: Uuid,
    execution_id: Uuid,
}

/// Distributed task scheduler for oracle updates.
///
/// Evaluates triggers, gates executions on maintenance windows, concurrency
/// limits and cross-node claims, runs the update pipeline with a deadline
/// and handles retries with exponential backoff. Node coordination happens
/// through the shared keyed store.
pub struct TaskScheduler {
    config: SchedulerConfig,
    node_id: String,
    store: Arc<dyn KeyedStore>,
    oracle: Arc<OracleService>,
    metrics: Option<Arc<MetricsService>>,
    tasks: RwLock<HashMap<Uuid, TaskDefinition>>,
    executions: RwLock<HashMap<Uuid, TaskExecution>>,
    windows: RwLock<HashMap<Uuid, MaintenanceWindow>>,
    next_fires: RwLock<HashMap<Uuid, DateTime<Utc>>>,
    retries: RwLock<Vec<RetryEntry>>,
    task_locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
    running: RwLock<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        node_id: Option<String>,
        store: Arc<dyn KeyedStore>,
        oracle: Arc<OracleService>,
        metrics: Option<Arc<MetricsService>>,
    ) -> Self {
        Self {
            config,
            node_id: node_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            store,
            oracle,
            metrics,
            tasks: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
            next_fires: RwLock::new(HashMap::new()),
            retries: RwLock::new(Vec::new()),
            task_locks: RwLock::new(HashMap::new()),
            running: RwLock::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Load persisted tasks and maintenance windows into memory and compute
    /// initial fire times.
    pub async fn initialize(&self) -> OracleResult<()> {
        let now = Utc::now();

        for (key, raw) in self.store.entries(TASKS_NS).await? {
            match serde_json::from_str::<TaskDefinition>(&raw) {
                Ok(task) => {
                    if let Ok(next) = trigger::next_fire(&task.trigger, now) {
                        self.next_fires.write().await.insert(task.task_id, next);
                    }
                    self.tasks.write().await.insert(task.task_id, task);
                }
                Err(e) => warn!("Skipping unreadable task record {}: {}", key, e),
            }
        }

        for (key, raw) in self.store.entries(WINDOWS_NS).await? {
            match serde_json::from_str::<MaintenanceWindow>(&raw) {
                Ok(window) if window.end_time > now => {
                    self.windows.write().await.insert(window.window_id, window);
                }
                Ok(_) => {
                    self.store.delete(WINDOWS_NS, &key).await.ok();
                }
                Err(e) => warn!("Skipping unreadable maintenance window {}: {}", key, e),
            }
        }

        info!(
            "Scheduler node {} initialized with {} tasks",
            self.node_id,
            self.tasks.read().await.len()
        );
        Ok(())
    }

    /// Start the dispatch, heartbeat and garbage collection loops.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let mut handles = self.handles.lock().await;

        let dispatcher = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(dispatcher.config.tick_interval.max(1)));
            while *dispatcher.running.read().await {
                ticker.tick().await;
                dispatcher.dispatch_once().await;
            }
        }));

        let heartbeat = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(heartbeat.config.heartbeat_interval));
            while *heartbeat.running.read().await {
                ticker.tick().await;
                if let Err(e) = heartbeat.heartbeat_once().await {
                    error!("Error in node health reporting: {}", e);
                }
            }
        }));

        let collector = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(collector.config.gc_interval));
            while *collector.running.read().await {
                ticker.tick().await;
                if let Err(e) = collector.gc_once().await {
                    error!("Error in execution cleanup: {}", e);
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    /// Create a new oracle update task. The retry policy derives from the
    /// priority; tasks persist in the store and are never silently deleted.
    pub async fn create_task(&self, spec: TaskSpec) -> OracleResult<TaskDefinition> {
        trigger::validate_trigger(&spec.trigger)?;
        if spec.name.is_empty() {
            return Err(OracleError::Configuration(
                "Task name must not be empty".to_string(),
            ));
        }
        for rule_id in &spec.validation_rules {
            if !self.oracle.validator().has_rule(rule_id).await {
                return Err(OracleError::Configuration(format!(
                    "Task references unknown validation rule {}",
                    rule_id
                )));
            }
        }

        let now = Utc::now();
        let task = TaskDefinition {
            task_id: Uuid::new_v4(),
            name: spec.name,
            priority: spec.priority,
            trigger: spec.trigger,
            data_sources: spec.data_sources,
            validation_rules: spec.validation_rules,
            min_sources: spec.min_sources,
            max_concurrent: spec.max_concurrent.max(1),
            timeout: spec.timeout,
            retry_policy: RetryPolicy::for_priority(spec.priority),
            contracts: spec.contracts,
            created_at: now,
            updated_at: now,
            owner_id: spec.owner_id,
        };

        put_json(self.store.as_ref(), TASKS_NS, &task.task_id.to_string(), &task).await?;
        let next = trigger::next_fire(&task.trigger, now)?;
        self.next_fires.write().await.insert(task.task_id, next);
        self.tasks.write().await.insert(task.task_id, task.clone());

        info!("Created task {} ({})", task.name, task.task_id);
        Ok(task)
    }

    /// Update task schedule or priority; a priority change re-derives the
    /// default retry policy.
    pub async fn update_task(
        &self,
        task_id: Uuid,
        trigger_update: Option<TaskTrigger>,
        priority: Option<TaskPriority>,
    ) -> OracleResult<TaskDefinition> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| OracleError::Configuration(format!("Task not found: {}", task_id)))?;

        if let Some(new_trigger) = trigger_update {
            trigger::validate_trigger(&new_trigger)?;
            task.trigger = new_trigger;
            let next = trigger::next_fire(&task.trigger, Utc::now())?;
            self.next_fires.write().await.insert(task_id, next);
        }
        if let Some(new_priority) = priority {
            task.priority = new_priority;
            task.retry_policy = RetryPolicy::for_priority(new_priority);
        }
        task.updated_at = Utc::now();

        let updated = task.clone();
        put_json(self.store.as_ref(), TASKS_NS, &task_id.to_string(), &updated).await?;
        Ok(updated)
    }

    pub async fn get_task(&self, task_id: &Uuid) -> Option<TaskDefinition> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Schedule a maintenance window. An empty task set affects all tasks.
    pub async fn create_maintenance_window(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        description: impl Into<String>,
        affected_tasks: std::collections::HashSet<Uuid>,
    ) -> OracleResult<MaintenanceWindow> {
        let window = MaintenanceWindow {
            window_id: Uuid::new_v4(),
            start_time,
            end_time,
            description: description.into(),
            affected_tasks,
        };

        put_json(
            self.store.as_ref(),
            WINDOWS_NS,
            &window.window_id.to_string(),
            &window,
        )
        .await?;
        self.windows
            .write()
            .await
            .insert(window.window_id, window.clone());
        Ok(window)
    }

    pub async fn cancel_execution(&self, execution_id: Uuid) -> OracleResult<()> {
        let mut executions = self.executions.write().await;
        let execution = executions.get_mut(&execution_id).ok_or_else(|| {
            OracleError::Configuration(format!("Execution not found: {}", execution_id))
        })?;

        if execution.status.is_terminal() {
            return Err(OracleError::Configuration(format!(
                "Execution {} is already {:?}",
                execution_id, execution.status
            )));
        }

        execution.status = TaskStatus::Cancelled;
        execution.end_time = Some(Utc::now());
        let record = execution.clone();
        drop(executions);

        put_json(
            self.store.as_ref(),
            EXECUTIONS_NS,
            &execution_id.to_string(),
            &record,
        )
        .await
    }

    pub async fn get_execution(&self, execution_id: &Uuid) -> Option<TaskExecution> {
        self.executions.read().await.get(execution_id).cloned()
    }

    /// Execution history for a task from the store, newest first.
    pub async fn get_task_history(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> OracleResult<Vec<TaskExecution>> {
        let mut executions: Vec<TaskExecution> = self
            .store
            .entries(EXECUTIONS_NS)
            .await?
            .into_iter()
            .filter_map(|(_, raw)| serde_json::from_str::<TaskExecution>(&raw).ok())
            .filter(|e| e.task_id == task_id)
            .collect();

        executions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        executions.truncate(limit);
        Ok(executions)
    }

    /// One dispatch pass: fire due tasks, coalescing misses inside the
    /// grace window into one execution and dropping older ones, then drain
    /// due retries.
    pub async fn dispatch_once(self: &Arc<Self>) {
        let now = Utc::now();
        let grace = ChronoDuration::seconds(self.config.grace_time as i64);

        let due: Vec<(Uuid, DateTime<Utc>)> = {
            let next_fires = self.next_fires.read().await;
            next_fires
                .iter()
                .filter(|(_, fire)| **fire <= now)
                .map(|(id, fire)| (*id, *fire))
                .collect()
        };

        for (task_id, fire_time) in due {
            let trigger_def = match self.tasks.read().await.get(&task_id) {
                Some(task) => task.trigger.clone(),
                None => {
                    self.next_fires.write().await.remove(&task_id);
                    continue;
                }
            };

            match trigger::next_fire(&trigger_def, now) {
                Ok(next) => {
                    self.next_fires.write().await.insert(task_id, next);
                }
                Err(e) => {
                    error!("Cannot reschedule task {}: {}", task_id, e);
                    self.next_fires.write().await.remove(&task_id);
                }
            }

            if now - fire_time > grace {
                debug!("Dropping fire of task {} missed beyond grace window", task_id);
                if let Some(metrics) = &self.metrics {
                    metrics.record_missed_fire(&task_id.to_string());
                }
                continue;
            }

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.run_execution(task_id, None).await;
            });
        }

        let due_retries: Vec<RetryEntry> = {
            let mut retries = self.retries.write().await;
            let (due, later): (Vec<RetryEntry>, Vec<RetryEntry>) =
                retries.drain(..).partition(|r| r.due <= now);
            *retries = later;
            due
        };

        for entry in due_retries {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler
                    .run_execution(entry.task_id, Some(entry.execution_id))
                    .await;
            });
        }
    }

    /// Run one execution attempt through the gates. Returns the execution
    /// id, or None when a gate skipped the fire entirely.
    pub async fn run_execution(
        self: &Arc<Self>,
        task_id: Uuid,
        resume: Option<Uuid>,
    ) -> Option<Uuid> {
        let task = self.tasks.read().await.get(&task_id).cloned()?;
        let now = Utc::now();

        // Gate 1: maintenance windows.
        {
            let windows = self.windows.read().await;
            if windows.values().any(|w| w.covers(&task_id, now)) {
                info!("Task {} skipped due to maintenance window", task_id);
                return None;
            }
        }

        // Gate 2: concurrency limit.
        {
            let executions = self.executions.read().await;
            let running = executions
                .values()
                .filter(|e| e.task_id == task_id && e.status == TaskStatus::Running)
                .count();
            if running >= task.max_concurrent {
                warn!("Task {} skipped due to concurrency limit", task_id);
                return None;
            }
        }

        // Gate 3: per-task lock plus store-level claim.
        let lock = {
            let mut locks = self.task_locks.write().await;
            Arc::clone(locks.entry(task_id).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let _guard = lock.lock().await;

        let claim_key = task_id.to_string();
        match get_json::<TaskClaim>(self.store.as_ref(), CLAIMS_NS, &claim_key).await {
            Ok(Some(claim))
                if claim.node_id != self.node_id
                    && (now - claim.claimed_at)
                        < ChronoDuration::seconds(self.config.node_expiry as i64) =>
            {
                debug!("Task {} is claimed by node {}", task_id, claim.node_id);
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Claim lookup failed for task {}: {}", task_id, e);
            }
        }
        let claim = TaskClaim {
            node_id: self.node_id.clone(),
            claimed_at: now,
        };
        if let Err(e) = put_json(self.store.as_ref(), CLAIMS_NS, &claim_key, &claim).await {
            warn!("Failed to write claim for task {}: {}", task_id, e);
        }

        // Gate 4: execution record, Pending then Running.
        let execution_id = match resume {
            Some(id) => {
                let mut executions = self.executions.write().await;
                match executions.get_mut(&id) {
                    Some(execution) => {
                        execution.status = TaskStatus::Running;
                        execution.retry_count += 1;
                        execution.end_time = None;
                        id
                    }
                    None => {
                        self.store.delete(CLAIMS_NS, &claim_key).await.ok();
                        return None;
                    }
                }
            }
            None => {
                let execution = TaskExecution::new(task_id, &self.node_id);
                let id = execution.execution_id;
                self.executions.write().await.insert(id, execution);
                self.set_execution_status(id, TaskStatus::Running).await;
                id
            }
        };
        self.persist_execution(execution_id).await;

        // Execution body with the task deadline.
        let started = Instant::now();
        let result = match timeout(
            Duration::from_secs(task.timeout),
            self.oracle.execute_update(&task),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(OracleError::Resource(format!(
                "Execution deadline of {}s exceeded",
                task.timeout
            ))),
        };
        let duration = started.elapsed().as_secs_f64();

        let status = match result {
            Ok(outcome) => {
                let mut executions = self.executions.write().await;
                if let Some(execution) = executions.get_mut(&execution_id) {
                    execution.status = TaskStatus::Completed;
                    execution.end_time = Some(Utc::now());
                    execution.data_points = outcome.data_points;
                    execution.aggregated_value = Some(outcome.signed.aggregated.clone());
                    execution.performance_metrics = outcome.stage_timings;
                    execution
                        .performance_metrics
                        .insert("duration".to_string(), duration);
                }
                TaskStatus::Completed
            }
            Err(err) => {
                let kind = err.kind();
                let retry_count = {
                    let executions = self.executions.read().await;
                    executions
                        .get(&execution_id)
                        .map(|e| e.retry_count)
                        .unwrap_or(0)
                };

                if task.retry_policy.retriable(kind)
                    && retry_count < task.retry_policy.max_attempts
                {
                    let delay = task.retry_policy.delay_secs(retry_count);
                    warn!(
                        "Task {} failed ({}); retry {} scheduled in {}s",
                        task_id,
                        err,
                        retry_count + 1,
                        delay
                    );
                    {
                        let mut executions = self.executions.write().await;
                        if let Some(execution) = executions.get_mut(&execution_id) {
                            execution.status = TaskStatus::Retrying;
                            execution.error = Some(err.to_string());
                        }
                    }
                    self.retries.write().await.push(RetryEntry {
                        due: Utc::now() + ChronoDuration::seconds(delay as i64),
                        task_id,
                        execution_id,
                    });
                    TaskStatus::Retrying
                } else {
                    error!("Task {} failed: {}", task_id, err);
                    let mut executions = self.executions.write().await;
                    if let Some(execution) = executions.get_mut(&execution_id) {
                        execution.status = TaskStatus::Failed;
                        execution.error = Some(err.to_string());
                        execution.end_time = Some(Utc::now());
                        execution
                            .performance_metrics
                            .insert("duration".to_string(), duration);
                    }
                    TaskStatus::Failed
                }
            }
        };

        self.persist_execution(execution_id).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_task_execution(&task_id.to_string(), status.as_str(), duration);
        }

        self.store.delete(CLAIMS_NS, &claim_key).await.ok();
        Some(execution_id)
    }

    async fn set_execution_status(&self, execution_id: Uuid, status: TaskStatus) {
        let mut executions = self.executions.write().await;
        if let Some(execution) = executions.get_mut(&execution_id) {
            execution.status = status;
        }
    }

    async fn persist_execution(&self, execution_id: Uuid) {
        let record = {
            let executions = self.executions.read().await;
            executions.get(&execution_id).cloned()
        };
        if let Some(record) = record {
            if let Err(e) = put_json(
                self.store.as_ref(),
                EXECUTIONS_NS,
                &execution_id.to_string(),
                &record,
            )
            .await
            {
                error!("Failed to persist execution {}: {}", execution_id, e);
            }
        }
    }

    /// Write this node's liveness record and evict heartbeats from nodes
    /// that disappeared.
    pub async fn heartbeat_once(&self) -> OracleResult<()> {
        let now = Utc::now();
        let running_tasks = {
            let executions = self.executions.read().await;
            executions
                .values()
                .filter(|e| e.status == TaskStatus::Running)
                .count()
        };
        let heartbeat = NodeHeartbeat {
            node_id: self.node_id.clone(),
            running_tasks,
            total_tasks: self.tasks.read().await.len(),
            timestamp: now,
        };
        put_json(self.store.as_ref(), NODES_NS, &self.node_id, &heartbeat).await?;

        let expiry = ChronoDuration::seconds(self.config.node_expiry as i64);
        for (key, raw) in self.store.entries(NODES_NS).await? {
            if let Ok(record) = serde_json::from_str::<NodeHeartbeat>(&raw) {
                if now - record.timestamp > expiry {
                    info!("Removing stale scheduler node {}", record.node_id);
                    self.store.delete(NODES_NS, &key).await.ok();
                }
            }
        }
        Ok(())
    }

    /// Drop terminal executions past retention, force stale in-flight
    /// executions to Failed and clear expired maintenance windows.
    pub async fn gc_once(&self) -> OracleResult<()> {
        let now = Utc::now();
        let retention = ChronoDuration::seconds(self.config.execution_retention as i64);
        let stale_cutoff = ChronoDuration::seconds(self.config.stale_execution_cutoff as i64);

        for (key, raw) in self.store.entries(EXECUTIONS_NS).await? {
            let mut execution = match serde_json::from_str::<TaskExecution>(&raw) {
                Ok(execution) => execution,
                Err(_) => continue,
            };

            if execution.status.is_terminal() {
                if execution
                    .end_time
                    .map_or(false, |end| now - end > retention)
                {
                    self.store.delete(EXECUTIONS_NS, &key).await.ok();
                    self.executions.write().await.remove(&execution.execution_id);
                }
            } else if matches!(
                execution.status,
                TaskStatus::Running | TaskStatus::Pending
            ) && now - execution.start_time > stale_cutoff
            {
                execution.status = TaskStatus::Failed;
                execution.error = Some("Execution timed out".to_string());
                execution.end_time = Some(now);
                put_json(self.store.as_ref(), EXECUTIONS_NS, &key, &execution).await?;
                self.executions
                    .write()
                    .await
                    .insert(execution.execution_id, execution);
            }
        }

        for (key, raw) in self.store.entries(WINDOWS_NS).await? {
            if let Ok(window) = serde_json::from_str::<MaintenanceWindow>(&raw) {
                if window.end_time < now {
                    self.store.delete(WINDOWS_NS, &key).await.ok();
                    self.windows.write().await.remove(&window.window_id);
                }
            }
        }

        Ok(())
    }

    pub async fn next_fire_time(&self, task_id: &Uuid) -> Option<DateTime<Utc>> {
        self.next_fires.read().await.get(task_id).copied()
    }
}
