//! SQLite persistence for postings, import run telemetry and the task queue.

mod import_runs;
mod jobs;
mod schema;
mod search;
mod tasks;
mod types;

pub use jobs::JobStore;
pub use schema::Database;
pub use search::MAX_PAGE_SIZE;
pub use tasks::{STATUS_FAILED, STATUS_PENDING};
pub use types::{
    ClaimedTask, DatabaseError, DeadLetter, ImportRun, JobPage, JobPosting, JobQuery,
    NormalizedJob, QueueStats, SyncError, MISSING_JOB_ID,
};
