//! Background worker for periodic and on-demand jobs.
//!
//! `BackgroundWorker<R>` owns a spawned loop that feeds submitted jobs to a
//! [`BackgroundRunnable`], calls its `on_tick` on a fixed interval, and runs
//! its `shutdown` hook once when stopped. Used by mesh reconciliation and
//! the periodic task batch.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

const JOB_CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// On-demand job type.
    type Job: Send + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn run(&mut self, job: Self::Job);

    /// Called once per tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Job>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. The first tick fires one full `tick` after
    /// start, not immediately.
    pub fn start(mut runnable: R, tick: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Job>(JOB_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let name = runnable.name();
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(worker = name, tick_ms = tick.as_millis(), "background worker started");

            loop {
                tokio::select! {
                    job = rx.recv() => match job {
                        Some(job) => runnable.run(job).await,
                        None => break,
                    },
                    _ = interval.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
            debug!(worker = name, "background worker stopped");
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a job.
    ///
    /// # Errors
    ///
    /// Fails if the worker has been stopped.
    pub async fn submit(&self, job: R::Job) -> anyhow::Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("worker not running");
        };
        tx.send(job)
            .await
            .map_err(|_| anyhow::anyhow!("worker channel closed"))
    }

    /// Stops the loop and waits for the shutdown hook to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
