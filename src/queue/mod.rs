//! Durable work queue and the worker pool that drains it.
//!
//! The orchestrator enqueues one [`ImportTask`] per classified feed item and
//! returns without waiting. A [`WorkerPool`] claims tasks from the SQLite
//! backed [`WorkQueue`], hands them to a [`TaskHandler`], and retries failures
//! with exponential backoff until the attempt budget is spent.

pub mod work_queue;
pub mod worker;

use serde::{Deserialize, Serialize};

use crate::feed::RawItem;

pub use work_queue::{FailureOutcome, RetryPolicy, WorkQueue};
pub use worker::{TaskHandler, WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool};

/// Unit of work: one raw feed item plus the feed it came from.
///
/// Serialized as `{"rawItem": {...}, "sourceFeed": "..."}`. Each field of
/// `rawItem` is a flat node table (see [`crate::feed::RecordTree`]), so a
/// payload decodes regardless of how deeply the feed nested its markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTask {
    pub raw_item: RawItem,
    pub source_feed: String,
}

impl ImportTask {
    pub fn new(raw_item: RawItem, source_feed: impl Into<String>) -> Self {
        Self {
            raw_item,
            source_feed: source_feed.into(),
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::RecordTree;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_shape() {
        let mut item = RawItem::new();
        item.insert("link".to_string(), RecordTree::Text("https://x/1".to_string()));
        let task = ImportTask::new(item, "https://feed.example.com");

        let value: serde_json::Value = serde_json::from_str(&task.to_payload().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "rawItem": { "link": ["https://x/1"] },
                "sourceFeed": "https://feed.example.com"
            })
        );
    }

    #[test]
    fn test_payload_preserves_nested_fields() {
        let payload = r#"{"rawItem":{"title":[{"list":[1]},"Dev"],"guid":[{"list":[1]},{"map":[["_",2],["isPermaLink",3]]},"g","false"]},"sourceFeed":"f"}"#;
        let task = ImportTask::from_payload(payload).unwrap();
        assert_eq!(task.source_feed, "f");
        assert_eq!(task.raw_item["title"].collapse(), "Dev");
        assert_eq!(
            crate::feed::canonical_id(&task.raw_item).as_deref(),
            Some("g")
        );
    }

    #[test]
    fn test_deeply_nested_item_survives_payload() {
        let handle = std::thread::Builder::new()
            .stack_size(512 * 1024)
            .spawn(|| {
                let depth = 5_000;
                let mut xml = String::from("<rss><item><link>https://x/deep</link><description>");
                xml.push_str(&"<div>".repeat(depth));
                xml.push_str("body");
                xml.push_str(&"</div>".repeat(depth));
                xml.push_str("</description></item></rss>");
                let mut items = crate::feed::parse_feed(&xml).unwrap();
                let task = ImportTask::new(items.remove(0), "https://feed.example.com");

                let back = ImportTask::from_payload(&task.to_payload().unwrap()).unwrap();
                assert_eq!(back.source_feed, "https://feed.example.com");
                assert_eq!(
                    crate::feed::canonical_id(&back.raw_item).as_deref(),
                    Some("https://x/deep")
                );
                assert_eq!(crate::feed::field_text(&back.raw_item, "description"), "body");
            })
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        assert!(ImportTask::from_payload(r#"{"sourceFeed":"f"}"#).is_err());
    }
}
