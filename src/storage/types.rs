use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("Database is locked by another process. Please close it and try again.")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::Locked;
        }
        DatabaseError::Other(err)
    }
}

pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Job Postings
// ============================================================================

/// Normalized posting fields written by a worker upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedJob {
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub category: String,
    pub job_type: String,
    pub link: String,
    /// Unix seconds
    pub pub_date: i64,
    pub source_feed: String,
}

/// A persisted job posting.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct JobPosting {
    #[serde(skip)]
    pub id: i64,
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub category: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub link: String,
    pub pub_date: i64,
    pub source_feed: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Filter and paging options for listing postings.
#[derive(Debug, Clone)]
pub struct JobQuery {
    /// Restrict to postings imported from this feed URL
    pub source_feed: Option<String>,
    /// Free-text search over title, company and description
    pub search: Option<String>,
    /// 1-based page number
    pub page: u32,
    pub limit: u32,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            source_feed: None,
            search: None,
            page: 1,
            limit: 10,
        }
    }
}

/// One page of postings plus the totals needed to render pagination.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<JobPosting>,
    pub total: i64,
    pub pages: i64,
    pub current_page: u32,
}

// ============================================================================
// Import Runs
// ============================================================================

/// Reason recorded when an item carries no usable identifier.
pub const MISSING_JOB_ID: &str = "Missing jobId";

/// A problem with a single item, recorded on its import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub reason: String,
}

/// Telemetry for one import run against one feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    pub id: i64,
    pub feed_url: String,
    /// Unix seconds at which the run started
    pub timestamp: i64,
    pub total_fetched: i64,
    pub total_imported: i64,
    pub new_jobs: i64,
    pub updated_jobs: i64,
    pub failed_jobs: i64,
    pub sync_errors: Vec<SyncError>,
}

impl ImportRun {
    /// Counts an item as failed and records why.
    pub fn record_failure(&mut self, job_id: Option<String>, reason: impl Into<String>) {
        self.failed_jobs += 1;
        self.sync_errors.push(SyncError {
            job_id,
            reason: reason.into(),
        });
    }
}

/// Internal row type for import run queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ImportRunRow {
    pub id: i64,
    pub feed_url: String,
    pub timestamp: i64,
    pub total_fetched: i64,
    pub total_imported: i64,
    pub new_jobs: i64,
    pub updated_jobs: i64,
    pub failed_jobs: i64,
}

impl ImportRunRow {
    pub(crate) fn into_run(self, sync_errors: Vec<SyncError>) -> ImportRun {
        ImportRun {
            id: self.id,
            feed_url: self.feed_url,
            timestamp: self.timestamp,
            total_fetched: self.total_fetched,
            total_imported: self.total_imported,
            new_jobs: self.new_jobs,
            updated_jobs: self.updated_jobs,
            failed_jobs: self.failed_jobs,
            sync_errors,
        }
    }
}

// ============================================================================
// Task Queue Rows
// ============================================================================

/// A task row handed to exactly one worker for one delivery attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedTask {
    pub id: i64,
    pub payload: String,
    pub source_feed: String,
    /// Attempt number of this delivery, starting at 1
    pub attempts: i64,
    pub max_attempts: i64,
}

/// A task retained after exhausting its attempts.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: i64,
    pub source_feed: String,
    pub payload: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Unix milliseconds
    pub created_at: i64,
}

/// Task counts by status. Completed tasks are deleted and never counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub active: i64,
    pub failed: i64,
}

impl QueueStats {
    /// True when nothing is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.active == 0
    }
}
