use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::debug;

use super::ImportTask;
use crate::storage::{ClaimedTask, Database, DeadLetter, QueueStats, STATUS_FAILED};

/// Default delivery attempts per task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first redelivery; doubles on each further attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Attempt budget and exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivering a task whose `attempt`-th delivery failed:
    /// `base × 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// What happened to a task after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Scheduled for redelivery after `delay`.
    Retrying { delay: Duration },
    /// Attempts exhausted; retained with status `failed`.
    DeadLettered,
}

/// Durable FIFO of [`ImportTask`]s stored in the `import_tasks` table.
///
/// Cloning shares the database pool and wakeup signals.
#[derive(Clone)]
pub struct WorkQueue {
    db: Database,
    policy: RetryPolicy,
    work_available: Arc<Notify>,
    settled: Arc<Notify>,
}

impl WorkQueue {
    pub fn new(db: Database, policy: RetryPolicy) -> Self {
        Self {
            db,
            policy,
            work_available: Arc::new(Notify::new()),
            settled: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Store a task for delivery. Never waits on workers.
    pub async fn enqueue(&self, task: &ImportTask) -> Result<i64> {
        let payload = task.to_payload().context("Failed to serialize task")?;
        let id = self
            .db
            .enqueue_task(
                &payload,
                &task.source_feed,
                i64::from(self.policy.max_attempts),
                now_ms(),
            )
            .await?;
        self.work_available.notify_one();
        Ok(id)
    }

    /// Claim the next deliverable task, if any.
    pub async fn claim(&self) -> Result<Option<ClaimedTask>> {
        self.db.claim_task(now_ms()).await
    }

    pub async fn complete(&self, task_id: i64) -> Result<()> {
        self.db.complete_task(task_id).await?;
        self.settled.notify_waiters();
        Ok(())
    }

    /// Record a failed delivery, scheduling a retry or dead-lettering the task.
    pub async fn fail(&self, task: &ClaimedTask, error: &str) -> Result<FailureOutcome> {
        let attempt = u32::try_from(task.attempts).unwrap_or(u32::MAX);
        let delay = self.policy.delay_for(attempt);
        let retry_at = now_ms().saturating_add(duration_ms(delay));

        let status = self.db.fail_task(task.id, retry_at, error).await?;
        self.settled.notify_waiters();

        if status == STATUS_FAILED {
            Ok(FailureOutcome::DeadLettered)
        } else {
            Ok(FailureOutcome::Retrying { delay })
        }
    }

    /// Return tasks orphaned in `active` by an earlier process to `pending`.
    pub async fn recover_abandoned(&self) -> Result<u64> {
        let recovered = self.db.recover_abandoned_tasks(now_ms()).await?;
        if recovered > 0 {
            self.work_available.notify_one();
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.db.queue_stats().await
    }

    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        self.db.dead_letters(limit).await
    }

    /// Requeue every dead-lettered task with a fresh attempt budget.
    pub async fn retry_failed(&self) -> Result<u64> {
        let requeued = self.db.retry_failed_tasks(now_ms()).await?;
        if requeued > 0 {
            self.work_available.notify_one();
        }
        Ok(requeued)
    }

    /// Resolves once a task may have become deliverable.
    pub(crate) async fn work_available(&self) {
        self.work_available.notified().await;
    }

    /// Wait until no task is pending or active.
    ///
    /// Tasks waiting out a backoff delay count as pending, so this returns
    /// only after every task has completed or been dead-lettered.
    pub async fn wait_idle(&self, poll_interval: Duration) -> Result<()> {
        loop {
            let settled = self.settled.notified();
            let stats = self.stats().await?;
            if stats.is_idle() {
                return Ok(());
            }
            debug!(
                pending = stats.pending,
                active = stats.active,
                "Waiting for queue to drain"
            );
            tokio::select! {
                _ = settled => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
