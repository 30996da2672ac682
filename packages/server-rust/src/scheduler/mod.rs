//! Durable task scheduler run by the control node.
//!
//! The scheduler has no transport code of its own: due tasks are executed
//! by calling `<handlerServiceName>.<handlerName>` through the
//! [`CommandBus`]. Batch runs are settle-all: every claimed task reaches a
//! terminal status and failures come back as a list, never as an error.

pub mod worker;

use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use orbit_core::{task_schema, ScheduleTaskRequest, Task, TaskStatus, TASK_SCHEMA_NAME};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use worker::{RunBatch, SchedulerRunnable};

use crate::bus::{handler_fn, json_result, CommandBus, ExecuteOptions};
use crate::config::SchedulerConfig;
use crate::error::RouterError;
use crate::storage::{InsertOutcome, TaskStore};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A task whose run did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_id: String,
    pub name: String,
    pub message: String,
}

/// Outcome of [`TaskScheduler::handle_task_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub rescheduled: usize,
    pub errors: Vec<TaskFailure>,
}

/// Result of running one claimed task.
struct RunOutcome {
    task_id: String,
    succeeded: bool,
    rescheduled: bool,
    errors: Vec<TaskFailure>,
}

// ---------------------------------------------------------------------------
// TaskScheduler
// ---------------------------------------------------------------------------

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    bus: Arc<CommandBus>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, bus: Arc<CommandBus>, config: SchedulerConfig) -> Self {
        Self { store, bus, config }
    }

    /// Validates `body` and persists a new `scheduled` task.
    ///
    /// # Errors
    ///
    /// - `ValidationFailed` if the body does not match the task schema
    /// - `TaskConflict` if another `scheduled` task holds the same
    ///   idempotency key
    pub async fn schedule_task(&self, body: Value) -> Result<Task, RouterError> {
        let request = ScheduleTaskRequest::from_json(body)?;
        let task = Task::from_request(Uuid::new_v4().to_string(), request, Utc::now());

        match self.store.insert(task.clone()).await? {
            InsertOutcome::Inserted => {
                info!(
                    task_id = %task.id,
                    name = %task.name,
                    handler = %task.handler_command(),
                    scheduled_at = %task.scheduled_at,
                    "task scheduled"
                );
                Ok(task)
            }
            InsertOutcome::Conflict { existing_id } => {
                let key = task.idempotency_key.unwrap_or_default();
                debug!(key = %key, existing_id = %existing_id, "idempotency key already scheduled");
                Err(RouterError::TaskConflict { key })
            }
        }
    }

    /// Tasks at `status` that are due now.
    ///
    /// # Errors
    ///
    /// `Internal` for store failures.
    pub async fn get_task_batch(&self, status: TaskStatus) -> Result<Vec<Task>, RouterError> {
        Ok(self.store.due(status, Utc::now()).await?)
    }

    /// Every task, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// `Internal` for store failures.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, RouterError> {
        Ok(self.store.list(status).await?)
    }

    /// Runs every due task at `status`.
    ///
    /// Each task is first claimed by moving it to `queued`, so a task picked
    /// up by an overlapping batch runs once. At most `workers` handlers run
    /// at the same time.
    ///
    /// The batch runs on its own Tokio task. Dropping the returned future
    /// (HTTP timeout, client gone, worker stopping) detaches the batch
    /// instead of cancelling it, so every claimed task still reaches a
    /// terminal status and gets its successor.
    ///
    /// # Errors
    ///
    /// - `ValidationFailed` for a terminal `status`
    /// - `Internal` if the due-work query fails or the batch task panics
    ///
    /// Per-task failures are reported in [`BatchReport::errors`].
    pub async fn handle_task_batch(
        self: &Arc<Self>,
        status: TaskStatus,
    ) -> Result<BatchReport, RouterError> {
        if status.is_terminal() {
            return Err(RouterError::ValidationFailed {
                errors: vec![format!("tasks in terminal status {status} are never re-run")],
            });
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_batch(status).await })
            .await
            .map_err(|e| RouterError::Internal(anyhow::Error::new(e).context("task batch aborted")))?
    }

    async fn run_batch(&self, status: TaskStatus) -> Result<BatchReport, RouterError> {
        let due = self.get_task_batch(status).await?;
        if due.is_empty() {
            return Ok(BatchReport::default());
        }
        debug!(count = due.len(), status = %status, "running task batch");

        let workers = self.config.workers.max(1);
        let outcomes: Vec<Option<RunOutcome>> = stream::iter(due)
            .map(|task| self.claim_and_run(task, status))
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for outcome in outcomes.into_iter().flatten() {
            report.processed += 1;
            if outcome.succeeded {
                report.completed += 1;
            } else {
                report.failed += 1;
            }
            if outcome.rescheduled {
                report.rescheduled += 1;
            }
            if !outcome.errors.is_empty() {
                debug!(task_id = %outcome.task_id, "task reported errors");
            }
            report.errors.extend(outcome.errors);
        }
        info!(
            processed = report.processed,
            completed = report.completed,
            failed = report.failed,
            rescheduled = report.rescheduled,
            "task batch finished"
        );
        Ok(report)
    }

    /// Removes every `failed` task, returning how many were removed.
    ///
    /// # Errors
    ///
    /// `Internal` for store failures.
    pub async fn delete_failed_tasks(&self) -> Result<usize, RouterError> {
        let removed = self.store.delete_by_status(TaskStatus::Failed).await?;
        info!(removed, "failed tasks deleted");
        Ok(removed)
    }

    async fn claim_and_run(&self, task: Task, from: TaskStatus) -> Option<RunOutcome> {
        match self
            .store
            .transition(&task.id, from, TaskStatus::Queued, Utc::now())
            .await
        {
            Ok(true) => Some(self.run(task).await),
            Ok(false) => {
                debug!(task_id = %task.id, "task already claimed");
                None
            }
            Err(e) => Some(RunOutcome {
                task_id: task.id.clone(),
                succeeded: false,
                rescheduled: false,
                errors: vec![failure(&task, format!("could not claim task: {e:#}"))],
            }),
        }
    }

    async fn run(&self, task: Task) -> RunOutcome {
        let command = task.handler_command();
        let payload = with_task_id(task.payload.clone(), &task.id);
        let result = self
            .bus
            .execute(&command, payload, ExecuteOptions::default())
            .await;

        let mut errors = Vec::new();
        let succeeded = match result {
            Ok(response) if reports_failure(&response) => {
                errors.push(failure(&task, format!("{command} reported failure: {response}")));
                false
            }
            Ok(_) => true,
            Err(e) => {
                errors.push(failure(&task, e.to_string()));
                false
            }
        };

        let to = if succeeded {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        metrics::counter!("orbit_tasks_processed_total", "outcome" => to.as_str()).increment(1);
        match self
            .store
            .transition(&task.id, TaskStatus::Queued, to, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(task_id = %task.id, "task left queued state while running"),
            Err(e) => errors.push(failure(&task, format!("could not record {to}: {e:#}"))),
        }

        let mut rescheduled = false;
        if task.reschedules_after(succeeded) {
            match self.reschedule(&task).await {
                Ok(()) => rescheduled = true,
                Err(message) => errors.push(failure(&task, message)),
            }
        }

        if !succeeded {
            warn!(task_id = %task.id, handler = %command, "task failed");
        }
        RunOutcome {
            task_id: task.id,
            succeeded,
            rescheduled,
            errors,
        }
    }

    async fn reschedule(&self, task: &Task) -> Result<(), String> {
        let next = task
            .successor(Uuid::new_v4().to_string(), Utc::now())
            .map_err(|e| format!("cannot reschedule: {e}"))?;
        match self.store.insert(next.clone()).await {
            Ok(InsertOutcome::Inserted) => {
                debug!(
                    task_id = %task.id,
                    successor = %next.id,
                    scheduled_at = %next.scheduled_at,
                    "recurring task rescheduled"
                );
                Ok(())
            }
            Ok(InsertOutcome::Conflict { existing_id }) => Err(format!(
                "successor collides with scheduled task {existing_id}"
            )),
            Err(e) => Err(format!("could not store successor: {e:#}")),
        }
    }

    /// Exposes the scheduler as `<control>.*` commands on `bus` and
    /// publishes the task schema in the manifest.
    pub fn register_commands(self: &Arc<Self>, bus: &CommandBus, control: &str) {
        bus.register_schema(TASK_SCHEMA_NAME, &task_schema());

        let scheduler = Arc::clone(self);
        bus.register(
            &format!("{control}.scheduleTask"),
            handler_fn(move |payload| {
                let scheduler = Arc::clone(&scheduler);
                async move { json_result(&scheduler.schedule_task(payload).await?) }
            })
            .described("validate and persist a scheduled task"),
        );

        let scheduler = Arc::clone(self);
        bus.register(
            &format!("{control}.getTasks"),
            handler_fn(move |payload| {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    let status = status_field(&payload)?;
                    json_result(&scheduler.list_tasks(status).await?)
                }
            })
            .described("list tasks, optionally by status"),
        );

        let scheduler = Arc::clone(self);
        bus.register(
            &format!("{control}.executeBatch"),
            handler_fn(move |payload| {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    let status = status_field(&payload)?.unwrap_or(TaskStatus::Scheduled);
                    json_result(&scheduler.handle_task_batch(status).await?)
                }
            })
            .described("run every due task at a status"),
        );

        let scheduler = Arc::clone(self);
        bus.register(
            &format!("{control}.deleteFailedTasks"),
            handler_fn(move |_| {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    let deleted = scheduler.delete_failed_tasks().await?;
                    Ok(json!({ "deleted": deleted }))
                }
            })
            .described("remove every failed task"),
        );
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn failure(task: &Task, message: String) -> TaskFailure {
    TaskFailure {
        task_id: task.id.clone(),
        name: task.name.clone(),
        message,
    }
}

/// Adds `taskId` to an object payload; anything else is wrapped.
fn with_task_id(payload: Value, task_id: &str) -> Value {
    match payload {
        Value::Object(mut fields) => {
            fields.insert("taskId".to_string(), Value::String(task_id.to_string()));
            Value::Object(fields)
        }
        Value::Null => json!({ "taskId": task_id }),
        other => json!({ "taskId": task_id, "payload": other }),
    }
}

/// A handler may answer normally but still report `{"status": "failed"}`.
fn reports_failure(response: &Value) -> bool {
    response.get("status").and_then(Value::as_str) == Some("failed")
}

/// Reads an optional `status` field from a command payload.
pub(crate) fn status_field(payload: &Value) -> Result<Option<TaskStatus>, RouterError> {
    match payload.get("status").and_then(Value::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: String| RouterError::ValidationFailed { errors: vec![e] }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
