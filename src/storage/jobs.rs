use anyhow::Result;
use async_trait::async_trait;

use super::schema::Database;
use super::types::{JobPosting, NormalizedJob};

/// Keyed posting store consumed by the import pipeline.
///
/// The orchestrator only reads (`job_exists`); workers only write
/// (`upsert_job`). Implementations must make `upsert_job` atomic per
/// `job_id` so concurrent workers converge on one row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Read-only existence check by canonical identifier.
    async fn job_exists(&self, job_id: &str) -> Result<bool>;

    /// Insert the posting, or overwrite every normalized field if `job_id` exists.
    async fn upsert_job(&self, job: &NormalizedJob) -> Result<()>;

    /// Total number of stored postings.
    async fn count_jobs(&self) -> Result<i64>;
}

#[async_trait]
impl JobStore for Database {
    async fn job_exists(&self, job_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Single-statement upsert so the write is atomic per key without an
    /// explicit transaction. `created_at` is only set on first insert.
    async fn upsert_job(&self, job: &NormalizedJob) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, title, company, location, description, category,
                              job_type, link, pub_date, source_feed, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                title = excluded.title,
                company = excluded.company,
                location = excluded.location,
                description = excluded.description,
                category = excluded.category,
                job_type = excluded.job_type,
                link = excluded.link,
                pub_date = excluded.pub_date,
                source_feed = excluded.source_feed,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(&job.job_id)
        .bind(&job.title)
        .bind(&job.company)
        .bind(&job.location)
        .bind(&job.description)
        .bind(&job.category)
        .bind(&job.job_type)
        .bind(&job.link)
        .bind(job.pub_date)
        .bind(&job.source_feed)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_jobs(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

impl Database {
    // ========================================================================
    // Job Queries
    // ========================================================================

    /// Get a single posting by its canonical identifier.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobPosting>> {
        let row = sqlx::query_as::<_, JobPosting>(
            r#"
            SELECT id, job_id, title, company, location, description, category,
                   job_type, link, pub_date, source_feed, created_at, updated_at
            FROM jobs
            WHERE job_id = ?
        "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Number of postings imported from one feed.
    pub async fn count_jobs_for_feed(&self, source_feed: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE source_feed = ?")
            .bind(source_feed)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}
