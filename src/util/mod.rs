//! Small helpers shared by configuration loading and the command line.

mod url_validator;

pub use url_validator::{validate_feed_url, UrlValidationError};
