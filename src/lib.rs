//! Imports job postings from RSS/Atom feeds into SQLite.
//!
//! An [`import::Importer`] fetches a feed, classifies each item as new or
//! updated, and enqueues it on a durable [`queue::WorkQueue`]. A
//! [`queue::WorkerPool`] drains the queue concurrently, upserting postings by
//! their canonical identifier and retrying failures with exponential backoff.

pub mod config;
pub mod feed;
pub mod import;
pub mod queue;
pub mod storage;
pub mod util;
