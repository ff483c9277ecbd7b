use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::feed::{canonical_id, field_text, RawItem};
use crate::queue::{ImportTask, TaskHandler};
use crate::storage::{JobStore, NormalizedJob};

const DEFAULT_COMPANY: &str = "N/A";
const DEFAULT_LOCATION: &str = "Remote";

/// Date fields tried in order: RSS first, then Atom.
const DATE_FIELDS: [&str; 3] = ["pubDate", "published", "updated"];

/// Why a delivered task could not be written.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("No unique identifier (link/guid) found for job")]
    MissingJobId,

    #[error("Store write failed: {0:#}")]
    Store(anyhow::Error),
}

/// Reduce a raw feed item to the fields stored for a posting.
///
/// `now` stands in for the publish date when the item has none or it does
/// not parse.
pub fn normalize(
    item: &RawItem,
    source_feed: &str,
    now: DateTime<Utc>,
) -> Result<NormalizedJob, ProcessError> {
    let job_id = canonical_id(item).ok_or(ProcessError::MissingJobId)?;

    Ok(NormalizedJob {
        title: field_text(item, "title"),
        company: or_default(field_text(item, "company_name"), DEFAULT_COMPANY),
        location: or_default(field_text(item, "location"), DEFAULT_LOCATION),
        description: field_text(item, "description"),
        category: field_text(item, "job_categories"),
        job_type: field_text(item, "job_types"),
        link: job_id.clone(),
        pub_date: publish_date(item).unwrap_or(now).timestamp(),
        source_feed: source_feed.to_string(),
        job_id,
    })
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn publish_date(item: &RawItem) -> Option<DateTime<Utc>> {
    DATE_FIELDS
        .iter()
        .map(|field| field_text(item, field))
        .find(|value| !value.trim().is_empty())
        .and_then(|value| parse_date(value.trim()))
}

/// Zone-less layouts some feeds emit; read as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
    {
        return Some(date.with_timezone(&Utc));
    }

    // A weekday that disagrees with the date is rejected by chrono; drop it
    if let Some((_, rest)) = value.split_once(", ") {
        if let Ok(date) = DateTime::parse_from_rfc2822(rest) {
            return Some(date.with_timezone(&Utc));
        }
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Worker-side handler: normalize the task's item and upsert it by `job_id`.
pub struct UpsertHandler {
    store: Arc<dyn JobStore>,
}

impl UpsertHandler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn process(&self, task: &ImportTask) -> Result<NormalizedJob, ProcessError> {
        let job = normalize(&task.raw_item, &task.source_feed, Utc::now())?;
        self.store
            .upsert_job(&job)
            .await
            .map_err(ProcessError::Store)?;
        Ok(job)
    }
}

#[async_trait]
impl TaskHandler for UpsertHandler {
    async fn handle(&self, task: &ImportTask) -> Result<()> {
        let job = self.process(task).await?;
        tracing::debug!(job_id = %job.job_id, feed = %job.source_feed, "Upserted job");
        Ok(())
    }
}
