use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_message, DatabaseError};

// ============================================================================
// Database
// ============================================================================

/// Handle to the SQLite store holding postings, import runs and queued tasks.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `path` may be `:memory:` for a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the database
    /// lock (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: concurrent workers wait up to 5 seconds for the
        // write lock instead of failing immediately with SQLITE_BUSY.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        if path != ":memory:" {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // SQLite is single-writer; a small pool still lets the orchestrator's
        // lookups proceed while workers hold the write lock.
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            if is_lock_message(&e.to_string()) {
                DatabaseError::Locked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// Every statement uses `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                job_id TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT 'N/A',
                location TEXT NOT NULL DEFAULT 'Remote',
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                job_type TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL,
                pub_date INTEGER NOT NULL,
                source_feed TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_source_feed ON jobs(source_feed)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_pub_date ON jobs(pub_date DESC)")
            .execute(&mut *tx)
            .await?;
        // Listing by feed sorts by publish date
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_feed_pub_date ON jobs(source_feed, pub_date DESC)",
        )
        .execute(&mut *tx)
        .await?;

        // Full-text index over the searchable posting fields
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS jobs_fts
            USING fts5(title, company, description, content=jobs, content_rowid=id)
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS jobs_fts_insert AFTER INSERT ON jobs BEGIN
                INSERT INTO jobs_fts(rowid, title, company, description)
                VALUES (new.id, new.title, new.company, new.description);
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS jobs_fts_delete AFTER DELETE ON jobs BEGIN
                INSERT INTO jobs_fts(jobs_fts, rowid, title, company, description)
                VALUES ('delete', old.id, old.title, old.company, old.description);
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS jobs_fts_update AFTER UPDATE ON jobs BEGIN
                INSERT INTO jobs_fts(jobs_fts, rowid, title, company, description)
                VALUES ('delete', old.id, old.title, old.company, old.description);
                INSERT INTO jobs_fts(rowid, title, company, description)
                VALUES (new.id, new.title, new.company, new.description);
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_runs (
                id INTEGER PRIMARY KEY,
                feed_url TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                total_fetched INTEGER NOT NULL DEFAULT 0,
                total_imported INTEGER NOT NULL DEFAULT 0,
                new_jobs INTEGER NOT NULL DEFAULT 0,
                updated_jobs INTEGER NOT NULL DEFAULT 0,
                failed_jobs INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_runs_timestamp ON import_runs(timestamp DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_runs_feed ON import_runs(feed_url)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_sync_errors (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL REFERENCES import_runs(id) ON DELETE CASCADE,
                job_id TEXT,
                reason TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_sync_errors_run ON import_sync_errors(run_id)",
        )
        .execute(&mut *tx)
        .await?;

        // Durable work queue. Times are unix milliseconds so sub-second
        // backoff schedules stay exact.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_tasks (
                id INTEGER PRIMARY KEY,
                payload TEXT NOT NULL,
                source_feed TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'active', 'failed')),
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                claimed_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Covers the claim query: WHERE status = 'pending' AND available_at <= ? ORDER BY id
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_import_tasks_claim ON import_tasks(status, available_at, id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_and_migrate_twice() {
        let db = Database::open(":memory:").await.unwrap();
        // Migrations are idempotent
        db.migrate().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN \
             ('jobs', 'import_runs', 'import_sync_errors', 'import_tasks') ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            names,
            vec!["import_runs", "import_sync_errors", "import_tasks", "jobs"]
        );
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).await.unwrap();
        db.close().await;

        // Reopening an existing file runs migrations as a no-op
        let db = Database::open(path).await.unwrap();
        db.close().await;
    }
}
