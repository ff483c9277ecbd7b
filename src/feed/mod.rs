//! Feed retrieval and parsing for job boards publishing RSS/Atom.
//!
//! - [`tree`] - the [`RecordTree`] shape raw entries are held in, plus
//!   identifier derivation and field collapsing
//! - [`parser`] - markup repair, namespace-stripping parse, item collection
//! - [`fetcher`] - HTTP retrieval that degrades to an empty item list
//!
//! ```ignore
//! let fetcher = FeedFetcher::new(DEFAULT_FETCH_TIMEOUT, DEFAULT_USER_AGENT)?;
//! for item in fetcher.fetch_and_parse("https://jobicy.com/?feed=job_feed").await {
//!     println!("{:?}", canonical_id(&item));
//! }
//! ```

pub mod fetcher;
pub mod parser;
pub mod tree;

pub use fetcher::{FeedFetcher, FetchError, DEFAULT_FETCH_TIMEOUT, DEFAULT_USER_AGENT};
pub use parser::{parse_feed, ParseError};
pub use tree::{canonical_id, field_text, RawItem, RecordTree};
