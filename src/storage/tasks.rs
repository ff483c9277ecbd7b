use anyhow::Result;

use super::schema::Database;
use super::types::{ClaimedTask, DeadLetter, QueueStats};

/// Status string a task row takes after its final attempt fails.
pub const STATUS_FAILED: &str = "failed";
/// Status string of a task waiting for (re)delivery.
pub const STATUS_PENDING: &str = "pending";

impl Database {
    // ========================================================================
    // Task Queue
    // ========================================================================

    /// Append a task, immediately available for delivery.
    pub async fn enqueue_task(
        &self,
        payload: &str,
        source_feed: &str,
        max_attempts: i64,
        now_ms: i64,
    ) -> Result<i64> {
        let id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO import_tasks (payload, source_feed, max_attempts, available_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(payload)
        .bind(source_feed)
        .bind(max_attempts)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(id.0)
    }

    /// Atomically claim the oldest pending task whose backoff has elapsed.
    ///
    /// The select and the status flip happen in one statement, so two
    /// concurrent claimers can never receive the same row.
    pub async fn claim_task(&self, now_ms: i64) -> Result<Option<ClaimedTask>> {
        let task = sqlx::query_as::<_, ClaimedTask>(
            r#"
            UPDATE import_tasks
            SET status = 'active', attempts = attempts + 1, claimed_at = ?
            WHERE id = (
                SELECT id FROM import_tasks
                WHERE status = 'pending' AND available_at <= ?
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, payload, source_feed, attempts, max_attempts
        "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Remove a task that was processed successfully.
    pub async fn complete_task(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM import_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed attempt. Returns the new status: `pending` when the
    /// task will be redelivered at `retry_at_ms`, `failed` when it has
    /// exhausted `max_attempts`.
    pub async fn fail_task(&self, id: i64, retry_at_ms: i64, error: &str) -> Result<String> {
        let status: (String,) = sqlx::query_as(
            r#"
            UPDATE import_tasks
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                available_at = ?,
                claimed_at = NULL,
                last_error = ?
            WHERE id = ?
            RETURNING status
        "#,
        )
        .bind(retry_at_ms)
        .bind(error)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(status.0)
    }

    /// Return tasks left `active` by a process that stopped mid-delivery.
    ///
    /// Tasks with attempts remaining go back to `pending`; the rest fail.
    pub async fn recover_abandoned_tasks(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE import_tasks
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                available_at = ?,
                claimed_at = NULL,
                last_error = COALESCE(last_error, 'Abandoned during delivery')
            WHERE status = 'active'
        "#,
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM import_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.pending = count,
                "active" => stats.active = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Tasks that exhausted their attempts, oldest first.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT id, source_feed, payload, attempts, last_error, created_at
            FROM import_tasks
            WHERE status = 'failed'
            ORDER BY id
            LIMIT ?
        "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Move every dead-lettered task back to `pending` with a fresh attempt budget.
    pub async fn retry_failed_tasks(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE import_tasks
            SET status = 'pending', attempts = 0, available_at = ?, last_error = NULL
            WHERE status = 'failed'
        "#,
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
