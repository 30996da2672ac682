//! Periodic batch driver for the scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use orbit_core::TaskStatus;
use tracing::warn;

use super::TaskScheduler;
use crate::worker::BackgroundRunnable;

/// Runs one batch at the given status outside the regular tick.
#[derive(Debug)]
pub struct RunBatch(pub TaskStatus);

/// Runs `handle_task_batch(scheduled)` on every tick.
pub struct SchedulerRunnable {
    scheduler: Arc<TaskScheduler>,
}

impl SchedulerRunnable {
    #[must_use]
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }

    async fn batch(&self, status: TaskStatus) {
        if let Err(e) = self.scheduler.handle_task_batch(status).await {
            warn!(error = %e, status = %status, "scheduled batch run failed");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for SchedulerRunnable {
    type Job = RunBatch;

    fn name(&self) -> &'static str {
        "task-scheduler"
    }

    async fn run(&mut self, job: RunBatch) {
        self.batch(job.0).await;
    }

    async fn on_tick(&mut self) {
        self.batch(TaskStatus::Scheduled).await;
    }
}
