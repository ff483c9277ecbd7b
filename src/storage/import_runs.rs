use std::collections::HashMap;

use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{ImportRun, ImportRunRow, SyncError};

/// Maximum number of runs returned by a history query
const MAX_HISTORY: i64 = 500;

impl Database {
    // ========================================================================
    // Import Run Log
    // ========================================================================

    /// Persist the opening record of a run with zeroed counters.
    pub async fn create_import_run(
        &self,
        feed_url: &str,
        timestamp: i64,
        total_fetched: i64,
    ) -> Result<ImportRun> {
        let id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO import_runs (feed_url, timestamp, total_fetched)
            VALUES (?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(feed_url)
        .bind(timestamp)
        .bind(total_fetched)
        .fetch_one(&self.pool)
        .await?;

        Ok(ImportRun {
            id: id.0,
            feed_url: feed_url.to_string(),
            timestamp,
            total_fetched,
            total_imported: 0,
            new_jobs: 0,
            updated_jobs: 0,
            failed_jobs: 0,
            sync_errors: Vec::new(),
        })
    }

    /// Write the final counters and sync errors of a run in one transaction.
    pub async fn finalize_import_run(&self, run: &ImportRun) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE import_runs
            SET total_fetched = ?, total_imported = ?, new_jobs = ?,
                updated_jobs = ?, failed_jobs = ?
            WHERE id = ?
        "#,
        )
        .bind(run.total_fetched)
        .bind(run.total_imported)
        .bind(run.new_jobs)
        .bind(run.updated_jobs)
        .bind(run.failed_jobs)
        .bind(run.id)
        .execute(&mut *tx)
        .await?;

        // 3 binds per row keeps a chunk of 200 far below SQLite's parameter limit
        const BATCH_SIZE: usize = 200;
        for chunk in run.sync_errors.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO import_sync_errors (run_id, job_id, reason) ");
            builder.push_values(chunk, |mut b, error| {
                b.push_bind(run.id)
                    .push_bind(&error.job_id)
                    .push_bind(&error.reason);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Get one run with its sync errors.
    pub async fn get_import_run(&self, id: i64) -> Result<Option<ImportRun>> {
        let row = sqlx::query_as::<_, ImportRunRow>(
            r#"
            SELECT id, feed_url, timestamp, total_fetched, total_imported,
                   new_jobs, updated_jobs, failed_jobs
            FROM import_runs
            WHERE id = ?
        "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut errors = self.sync_errors_for(&[row.id]).await?;
        let sync_errors = errors.remove(&row.id).unwrap_or_default();
        Ok(Some(row.into_run(sync_errors)))
    }

    /// Most recent runs first, capped at `limit` (and at 500).
    pub async fn recent_import_runs(&self, limit: i64) -> Result<Vec<ImportRun>> {
        let limit = limit.clamp(1, MAX_HISTORY);
        let rows = sqlx::query_as::<_, ImportRunRow>(
            r#"
            SELECT id, feed_url, timestamp, total_fetched, total_imported,
                   new_jobs, updated_jobs, failed_jobs
            FROM import_runs
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut errors = self.sync_errors_for(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let sync_errors = errors.remove(&row.id).unwrap_or_default();
                row.into_run(sync_errors)
            })
            .collect())
    }

    async fn sync_errors_for(&self, run_ids: &[i64]) -> Result<HashMap<i64, Vec<SyncError>>> {
        let mut grouped: HashMap<i64, Vec<SyncError>> = HashMap::new();
        if run_ids.is_empty() {
            return Ok(grouped);
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT run_id, job_id, reason FROM import_sync_errors WHERE run_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in run_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");

        let rows: Vec<(i64, Option<String>, String)> =
            builder.build_query_as().fetch_all(&self.pool).await?;
        for (run_id, job_id, reason) in rows {
            grouped
                .entry(run_id)
                .or_default()
                .push(SyncError { job_id, reason });
        }
        Ok(grouped)
    }
}
