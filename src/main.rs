use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use job_importer::config::Config;
use job_importer::feed::FeedFetcher;
use job_importer::import::{Importer, UpsertHandler};
use job_importer::queue::{WorkQueue, WorkerHandle, WorkerPool};
use job_importer::storage::{Database, DatabaseError, ImportRun, JobQuery};
use job_importer::util::validate_feed_url;

/// Get the config directory path (~/.config/job-importer/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("job-importer"))
}

#[derive(Parser, Debug)]
#[command(
    name = "job-importer",
    about = "Import job postings from RSS/Atom feeds through a retrying work queue"
)]
struct Args {
    /// Config file (default: ~/.config/job-importer/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the config file
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import the given feeds once, then wait for the queue to drain
    Import {
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },
    /// Import every configured feed once, then wait for the queue to drain
    Sync,
    /// Run the worker pool and import configured feeds on a schedule until Ctrl-C
    Serve,
    /// Show recent import runs
    History {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List imported job postings
    Jobs {
        /// Only postings from this feed URL
        #[arg(long, value_name = "URL")]
        feed: Option<String>,
        /// Full-text search over title, company and description
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Show tasks that exhausted their attempts
    DeadLetters {
        /// Requeue them with a fresh attempt budget
        #[arg(long)]
        retry: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

/// Everything the import commands need, constructed once at start-up.
struct Runtime {
    config: Config,
    db: Database,
    queue: WorkQueue,
    importer: Importer,
}

impl Runtime {
    async fn open(config: Config, db_path: PathBuf) -> Result<Self> {
        let db_path_str = db_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
        let db = match Database::open(db_path_str).await {
            Ok(db) => db,
            Err(DatabaseError::Locked) => {
                anyhow::bail!(
                    "Database {} is locked by another process. Please close it and try again.",
                    db_path.display()
                );
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
        };

        let queue = WorkQueue::new(db.clone(), config.retry_policy());
        let fetcher = FeedFetcher::new(config.fetch_timeout(), &config.user_agent)
            .context("Failed to build HTTP client")?;
        let importer = Importer::new(db.clone(), queue.clone(), fetcher);

        Ok(Self {
            config,
            db,
            queue,
            importer,
        })
    }

    async fn start_workers(&self) -> Result<WorkerHandle> {
        let handler = Arc::new(UpsertHandler::new(Arc::new(self.db.clone())));
        WorkerPool::new(self.queue.clone(), handler, self.config.worker_config())
            .start()
            .await
            .context("Failed to start worker pool")
    }

    async fn import_and_drain(&self, urls: &[String]) -> Result<()> {
        let workers = self.start_workers().await?;

        let mut failures = 0;
        for (url, result) in self.importer.run_all(urls).await {
            match result {
                Ok(run) => print_run(&run),
                Err(e) => {
                    failures += 1;
                    eprintln!("Import failed for {}: {:#}", url, e);
                }
            }
        }

        println!("Waiting for queued jobs to be processed...");
        self.queue.wait_idle(self.config.poll_interval()).await?;
        workers.shutdown().await?;

        let stats = self.queue.stats().await?;
        if stats.failed > 0 {
            println!(
                "{} task(s) dead-lettered; see `job-importer dead-letters`",
                stats.failed
            );
        }
        self.db.close().await;

        if failures > 0 {
            anyhow::bail!("{} of {} imports failed", failures, urls.len());
        }
        Ok(())
    }

    async fn serve(&self) -> Result<()> {
        let workers = self.start_workers().await?;

        match self.config.sync_interval() {
            Some(period) => {
                tracing::info!(
                    interval_minutes = self.config.sync_interval_minutes,
                    feeds = self.config.feeds.len(),
                    "Scheduled imports enabled"
                );
                self.importer
                    .run_scheduled(&self.config.feeds, period, shutdown_signal())
                    .await;
            }
            None => {
                tracing::info!("Scheduled imports disabled; processing queue only");
                shutdown_signal().await;
            }
        }

        println!("Shutting down, finishing in-flight jobs...");
        workers.shutdown().await?;
        self.db.close().await;
        Ok(())
    }
}

/// Resolves on Ctrl-C, or straight away if the signal cannot be listened for.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }
}

fn format_timestamp(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_run(run: &ImportRun) {
    println!(
        "{}  {}  fetched={} imported={} new={} updated={} failed={}",
        format_timestamp(run.timestamp),
        run.feed_url,
        run.total_fetched,
        run.total_imported,
        run.new_jobs,
        run.updated_jobs,
        run.failed_jobs
    );
    for error in &run.sync_errors {
        match &error.job_id {
            Some(job_id) => println!("    {}: {}", job_id, error.reason),
            None => println!("    {}", error.reason),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| config.database_path(&config_dir));

    let runtime = Runtime::open(config, db_path).await?;

    match args.command {
        Command::Import { urls } => {
            for url in &urls {
                validate_feed_url(url).with_context(|| format!("Invalid feed URL: {}", url))?;
            }
            runtime.import_and_drain(&urls).await?;
        }
        Command::Sync => {
            let feeds = runtime.config.feeds.clone();
            if feeds.is_empty() {
                anyhow::bail!("No feeds configured");
            }
            runtime.import_and_drain(&feeds).await?;
        }
        Command::Serve => runtime.serve().await?,
        Command::History { limit, json } => {
            let runs = runtime
                .db
                .recent_import_runs(limit)
                .await
                .context("Failed to load import history")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No imports recorded yet.");
            } else {
                runs.iter().for_each(print_run);
            }
        }
        Command::Jobs {
            feed,
            search,
            page,
            limit,
            json,
        } => {
            let query = JobQuery {
                source_feed: feed,
                search,
                page,
                limit,
            };
            let result = runtime
                .db
                .list_jobs(&query)
                .await
                .context("Failed to list jobs")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                for job in &result.jobs {
                    println!(
                        "{}  {} @ {} ({})  {}",
                        format_timestamp(job.pub_date),
                        job.title,
                        job.company,
                        job.location,
                        job.link
                    );
                }
                println!(
                    "Page {} of {} ({} jobs)",
                    result.current_page, result.pages, result.total
                );
            }
        }
        Command::DeadLetters { retry, limit } => {
            if retry {
                let requeued = runtime.queue.retry_failed().await?;
                println!("Requeued {} task(s).", requeued);
            } else {
                let dead = runtime.queue.dead_letters(limit).await?;
                if dead.is_empty() {
                    println!("No dead-lettered tasks.");
                }
                for task in dead {
                    println!(
                        "#{}  {}  attempts={}  {}",
                        task.id,
                        task.source_feed,
                        task.attempts,
                        task.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    Ok(())
}
