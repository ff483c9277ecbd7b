//! Import pipeline: feed runs on the producing side, posting upserts on the
//! consuming side of the work queue.

pub mod normalize;
pub mod orchestrator;

pub use normalize::{normalize, ProcessError, UpsertHandler};
pub use orchestrator::Importer;
