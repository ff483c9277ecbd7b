use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::feed::{canonical_id, FeedFetcher};
use crate::queue::{ImportTask, WorkQueue};
use crate::storage::{Database, ImportRun, JobStore, MISSING_JOB_ID};

/// Maximum number of feeds imported at once by [`Importer::run_all`].
const MAX_CONCURRENT_IMPORTS: usize = 4;

/// Runs one import pass per feed: fetch, classify each item as new or
/// updated, enqueue it for the workers, and record the run.
///
/// Classification happens before the workers write, so a run's counters
/// describe what was enqueued rather than what was eventually stored.
#[derive(Clone)]
pub struct Importer {
    db: Database,
    store: Arc<dyn JobStore>,
    queue: WorkQueue,
    fetcher: FeedFetcher,
}

impl Importer {
    pub fn new(db: Database, queue: WorkQueue, fetcher: FeedFetcher) -> Self {
        Self {
            store: Arc::new(db.clone()),
            db,
            queue,
            fetcher,
        }
    }

    /// Use a different store for existence lookups.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = store;
        self
    }

    /// Import one feed and return its persisted run record.
    ///
    /// Fetch and parse failures yield a run with zero items. Only failures
    /// to persist the run record are returned as errors.
    pub async fn run_import(&self, feed_url: &str) -> Result<ImportRun> {
        info!(feed = %feed_url, "Starting import");
        let timestamp = chrono::Utc::now().timestamp();

        let items = self.fetcher.fetch_and_parse(feed_url).await;
        let total_fetched = i64::try_from(items.len()).unwrap_or(i64::MAX);

        let mut run = self
            .db
            .create_import_run(feed_url, timestamp, total_fetched)
            .await
            .with_context(|| format!("Failed to create import run for {feed_url}"))?;

        for item in items {
            let Some(job_id) = canonical_id(&item) else {
                run.record_failure(None, MISSING_JOB_ID);
                continue;
            };

            let exists = match self.store.job_exists(&job_id).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!(feed = %feed_url, job_id = %job_id, error = %e, "Job lookup failed");
                    run.record_failure(Some(job_id), MISSING_JOB_ID);
                    continue;
                }
            };

            let task = ImportTask::new(item, feed_url);
            if let Err(e) = self.queue.enqueue(&task).await {
                warn!(feed = %feed_url, job_id = %job_id, error = %e, "Failed to enqueue job");
                run.record_failure(Some(job_id), format!("Enqueue failed: {e}"));
                continue;
            }

            if exists {
                run.updated_jobs += 1;
            } else {
                run.new_jobs += 1;
            }
        }

        run.total_imported = run.new_jobs + run.updated_jobs;
        self.db
            .finalize_import_run(&run)
            .await
            .with_context(|| format!("Failed to record import run for {feed_url}"))?;

        info!(
            feed = %feed_url,
            run_id = run.id,
            fetched = run.total_fetched,
            new = run.new_jobs,
            updated = run.updated_jobs,
            failed = run.failed_jobs,
            "Import finished"
        );
        Ok(run)
    }

    /// Import several feeds with bounded concurrency.
    ///
    /// Results are returned in completion order, paired with their feed URL.
    pub async fn run_all(&self, feed_urls: &[String]) -> Vec<(String, Result<ImportRun>)> {
        stream::iter(feed_urls.iter().cloned())
            .map(|url| {
                let importer = self.clone();
                async move {
                    let result = importer.run_import(&url).await;
                    if let Err(e) = &result {
                        warn!(feed = %url, error = %e, "Import failed");
                    }
                    (url, result)
                }
            })
            .buffer_unordered(MAX_CONCURRENT_IMPORTS)
            .collect()
            .await
    }

    /// Runs [`Importer::run_all`] every `period`, starting immediately, until
    /// `shutdown` resolves.
    ///
    /// Shutdown also interrupts a pass in progress. Items that pass already
    /// enqueued stay queued for the workers; its unfinished run records keep
    /// zero counters.
    pub async fn run_scheduled<F>(&self, feed_urls: &[String], period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => return,
            }
            tokio::select! {
                results = self.run_all(feed_urls) => {
                    for (url, result) in results {
                        if let Err(e) = result {
                            error!(feed = %url, error = %e, "Scheduled import failed");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested during scheduled import");
                    return;
                }
            }
        }
    }
}
