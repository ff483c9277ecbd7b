//! Fixed-size worker pool draining the [`WorkQueue`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::work_queue::{FailureOutcome, WorkQueue};
use super::ImportTask;
use crate::storage::ClaimedTask;

/// Default number of tasks processed concurrently.
pub const DEFAULT_CONCURRENCY: usize = 10;
/// Default idle wait between claim attempts when the queue is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Processes one delivered task. An `Err` counts as a failed attempt.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &ImportTask) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of tasks in flight.
    pub concurrency: usize,
    /// How long the dispatcher sleeps when nothing is claimable.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Events broadcast by a running pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    PoolStarted { concurrency: usize },
    TaskCompleted { task_id: i64, attempt: i64 },
    TaskFailed {
        task_id: i64,
        attempt: i64,
        error: String,
        /// True when this was the final attempt
        dead_lettered: bool,
    },
    PoolStopped,
}

/// Handle for controlling a running pool.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] also stops
/// the pool, but nothing waits for the drain.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    dispatcher: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop claiming new tasks and wait for in-flight tasks to finish.
    pub async fn shutdown(self) -> Result<()> {
        // The dispatcher may already have exited; there is nothing to signal then
        let _ = self.shutdown_tx.send(true);
        self.dispatcher.await?;
        Ok(())
    }

    /// Subscribe to pool events from this point on.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

pub struct WorkerPool {
    queue: WorkQueue,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl WorkerPool {
    pub fn new(queue: WorkQueue, handler: Arc<dyn TaskHandler>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue,
            handler,
            config,
            event_tx,
        }
    }

    /// Recover orphaned tasks, then spawn the dispatcher.
    pub async fn start(self) -> Result<WorkerHandle> {
        let recovered = self.queue.recover_abandoned().await?;
        if recovered > 0 {
            warn!(recovered, "Requeued tasks abandoned by a previous run");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_rx = self.event_tx.subscribe();
        let dispatcher = tokio::spawn(self.run(shutdown_rx));

        Ok(WorkerHandle {
            shutdown_tx,
            event_rx,
            dispatcher,
        })
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let concurrency = self.config.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = JoinSet::new();

        info!(
            concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker pool started"
        );
        let _ = self.event_tx.send(WorkerEvent::PoolStarted { concurrency });

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            while let Some(result) = in_flight.try_join_next() {
                log_join_result(result);
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            match self.queue.claim().await {
                Ok(Some(task)) => {
                    let runner = self.runner();
                    in_flight.spawn(async move {
                        runner.execute(task).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = self.queue.work_available() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to claim task");
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Worker pool draining");
        while let Some(result) = in_flight.join_next().await {
            log_join_result(result);
        }

        let _ = self.event_tx.send(WorkerEvent::PoolStopped);
        info!("Worker pool stopped");
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

fn log_join_result(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = ?e, "Task panicked");
    }
}

/// Owned bundle for executing a single claimed task in a spawned future.
struct TaskRunner {
    queue: WorkQueue,
    handler: Arc<dyn TaskHandler>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl TaskRunner {
    async fn execute(self, task: ClaimedTask) {
        let start = Instant::now();
        let task_id = task.id;
        let attempt = task.attempts;
        debug!(task_id, attempt, feed = %task.source_feed, "Processing task");

        let result = match ImportTask::from_payload(&task.payload) {
            Ok(import_task) => self.handler.handle(&import_task).await,
            Err(e) => Err(anyhow::Error::new(e).context("Invalid task payload")),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.queue.complete(task_id).await {
                    error!(task_id, error = %e, "Failed to mark task as completed");
                    return;
                }
                debug!(
                    task_id,
                    attempt,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Task completed"
                );
                let _ = self
                    .event_tx
                    .send(WorkerEvent::TaskCompleted { task_id, attempt });
            }
            Err(e) => {
                let error = format!("{e:#}");
                let outcome = match self.queue.fail(&task, &error).await {
                    Ok(outcome) => outcome,
                    Err(db_err) => {
                        error!(task_id, error = %db_err, "Failed to record task failure");
                        return;
                    }
                };
                let dead_lettered = match outcome {
                    FailureOutcome::Retrying { delay } => {
                        warn!(
                            task_id,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %error,
                            "Task failed, will retry"
                        );
                        false
                    }
                    FailureOutcome::DeadLettered => {
                        error!(
                            task_id,
                            attempt,
                            feed = %task.source_feed,
                            error = %error,
                            "Task failed permanently"
                        );
                        true
                    }
                };
                let _ = self.event_tx.send(WorkerEvent::TaskFailed {
                    task_id,
                    attempt,
                    error,
                    dead_lettered,
                });
            }
        }
    }
}
