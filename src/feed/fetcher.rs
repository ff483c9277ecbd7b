use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;

use super::parser::{parse_feed, ParseError};
use super::tree::RawItem;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Default request budget for one feed, covering connect, headers and body.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Some job boards reject clients that do not look like a browser.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const ACCEPT: &str = "application/xml, text/xml, */*";

/// Errors that can occur while fetching a feed document.
///
/// None of these reach the import run; [`FeedFetcher::fetch_and_parse`]
/// logs them and yields an empty item list.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Feed markup could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

/// Retrieves feed documents and turns them into raw items.
#[derive(Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl FeedFetcher {
    /// Builds a fetcher with its own HTTP client identifying as `user_agent`.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self::with_client(client, timeout))
    }

    /// Wraps an existing client (shared connection pool, custom TLS, tests).
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Fetches `url` and returns every item/entry it contains.
    ///
    /// Never fails: network errors, timeouts, bad statuses and unparseable
    /// documents are logged and produce an empty list.
    pub async fn fetch_and_parse(&self, url: &str) -> Vec<RawItem> {
        match self.try_fetch_and_parse(url).await {
            Ok(items) => {
                tracing::info!(feed = %url, items = items.len(), "Feed processed");
                items
            }
            Err(e) => {
                tracing::warn!(feed = %url, error = %e, "Feed fetch failed, continuing with no items");
                Vec::new()
            }
        }
    }

    async fn try_fetch_and_parse(&self, url: &str) -> Result<Vec<RawItem>, FetchError> {
        let body = tokio::time::timeout(self.timeout, self.fetch(url))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;
        Ok(parse_feed(&body)?)
    }

    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited_bytes(response, MAX_FEED_SIZE).await?;
        // Feeds are nominally UTF-8; stray bytes from legacy encodings must not sink the run
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::tree::canonical_id;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>Test & Co</title></item>
    <item><link>https://jobs.example.com/2</link><title>Second</title></item>
</channel></rss>"#;

    fn fetcher(timeout: Duration) -> FeedFetcher {
        FeedFetcher::new(timeout, DEFAULT_USER_AGENT).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(&mock_server)
            .await;

        let items = fetcher(DEFAULT_FETCH_TIMEOUT)
            .fetch_and_parse(&format!("{}/feed", mock_server.uri()))
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(canonical_id(&items[0]).as_deref(), Some("1"));
        assert_eq!(
            canonical_id(&items[1]).as_deref(),
            Some("https://jobs.example.com/2")
        );
    }

    #[tokio::test]
    async fn test_sends_identification_headers() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "job-importer-test/1.0"))
            .and(header_exists("accept"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(1)
            .mount(&mock_server)
            .await;

        let items = FeedFetcher::new(DEFAULT_FETCH_TIMEOUT, "job-importer-test/1.0")
            .unwrap()
            .fetch_and_parse(&mock_server.uri())
            .await;
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_http_error_yields_empty() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let f = fetcher(DEFAULT_FETCH_TIMEOUT);
        let err = f.try_fetch_and_parse(&mock_server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)), "got {:?}", err);
        assert!(f.fetch_and_parse(&mock_server.uri()).await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_yields_empty() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let f = fetcher(Duration::from_millis(100));
        let err = f.try_fetch_and_parse(&mock_server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "got {:?}", err);
        assert!(f.fetch_and_parse(&mock_server.uri()).await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_feed_yields_empty() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&mock_server)
            .await;

        let f = fetcher(DEFAULT_FETCH_TIMEOUT);
        let err = f.try_fetch_and_parse(&mock_server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)), "got {:?}", err);
        assert!(f.fetch_and_parse(&mock_server.uri()).await.is_empty());
    }

    #[tokio::test]
    async fn test_connection_refused_yields_empty() {
        // Nothing listens on the discard port of localhost in the test environment
        let items = fetcher(Duration::from_secs(2))
            .fetch_and_parse("http://127.0.0.1:9/feed")
            .await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_empty_feed_success() {
        let empty_rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel></channel></rss>"#;

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(empty_rss))
            .mount(&mock_server)
            .await;

        let f = fetcher(DEFAULT_FETCH_TIMEOUT);
        let items = f.try_fetch_and_parse(&mock_server.uri()).await.unwrap();
        assert!(items.is_empty());
    }
}
