use std::borrow::Cow;

use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::tree::{RawItem, RecordTree, CONTENT_KEY};

/// Container tags recognised as feed entries (RSS and Atom).
const ITEM_KEYS: [&str; 2] = ["item", "entry"];

/// Errors produced while turning feed markup into a record tree.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The XML reader rejected the document.
    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),
    /// The document contained no element at all.
    #[error("Document has no root element")]
    NoRoot,
    /// A second top-level element followed the root.
    #[error("Unexpected second root element <{0}>")]
    MultipleRoots(String),
    /// The document ended while elements were still open.
    #[error("Unclosed element <{0}> at end of document")]
    Unclosed(String),
}

/// Parses a feed document and returns every item-like entry in document order.
pub fn parse_feed(xml: &str) -> Result<Vec<RawItem>, ParseError> {
    let repaired = repair_ampersands(xml.trim());
    let root = parse_document(&repaired)?;
    Ok(collect_items(root))
}

/// Escapes `&` characters that do not start an entity reference.
///
/// Valid references are `&name;`, `&#nnn;` and `&#xHH;`. Anything else is
/// rewritten to `&amp;` so feeds that emit raw ampersands still parse.
pub fn repair_ampersands(xml: &str) -> Cow<'_, str> {
    if !xml.contains('&') {
        return Cow::Borrowed(xml);
    }

    let mut out = String::with_capacity(xml.len() + 16);
    let mut rest = xml;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        if starts_with_entity_ref(tail) {
            out.push('&');
        } else {
            out.push_str("&amp;");
        }
        rest = tail;
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn starts_with_entity_ref(tail: &str) -> bool {
    let bytes = tail.as_bytes();
    let (body_start, accept): (usize, fn(u8) -> bool) = match bytes {
        [b'#', b'x', ..] => (2, |b| b.is_ascii_hexdigit()),
        [b'#', ..] => (1, |b| b.is_ascii_digit()),
        _ => (0, |b| b.is_ascii_alphabetic()),
    };
    let body_len = bytes[body_start..]
        .iter()
        .take_while(|&&b| accept(b))
        .count();
    body_len > 0 && bytes.get(body_start + body_len) == Some(&b';')
}

/// An element whose end tag has not been seen yet.
struct OpenElement {
    name: String,
    attributes: Vec<(String, String)>,
    children: IndexMap<String, Vec<RecordTree>>,
    text: String,
}

impl OpenElement {
    fn new(start: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Self {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let decoder = reader.decoder();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = match attr {
                Ok(attr) => attr,
                Err(e) => {
                    tracing::debug!(element = %name, error = %e, "Skipping malformed attribute");
                    continue;
                }
            };
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = match attr.decode_and_unescape_value(decoder) {
                Ok(v) => v.into_owned(),
                // Unknown entities are kept literally rather than failing the document
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            attributes.push((key, value));
        }
        Self {
            name,
            attributes,
            children: IndexMap::new(),
            text: String::new(),
        }
    }

    fn push_text(&mut self, raw: &str) {
        match quick_xml::escape::unescape(raw) {
            Ok(text) => self.text.push_str(&text),
            Err(_) => self.text.push_str(raw),
        }
    }

    fn into_node(self) -> (String, RecordTree) {
        let text = self.text.trim();
        if self.attributes.is_empty() && self.children.is_empty() {
            return (self.name, RecordTree::Text(text.to_string()));
        }

        let mut fields = IndexMap::new();
        if !text.is_empty() {
            fields.insert(CONTENT_KEY.to_string(), RecordTree::Text(text.to_string()));
        }
        for (key, value) in self.attributes {
            fields.insert(key, RecordTree::Text(value));
        }
        for (key, nodes) in self.children {
            match fields.shift_remove(&key) {
                // An attribute sharing a child's name is merged into the sequence
                Some(existing) => {
                    let mut merged = Vec::with_capacity(nodes.len() + 1);
                    merged.push(existing);
                    merged.extend(nodes);
                    fields.insert(key, RecordTree::List(merged));
                }
                None => {
                    fields.insert(key, RecordTree::List(nodes));
                }
            }
        }
        (self.name, RecordTree::Map(fields))
    }
}

/// Parses markup into a record tree rooted at `{rootTag: node}`.
///
/// Tag names lose their namespace prefix and attributes are merged into the
/// element's own mapping. Open elements are tracked on an explicit stack so
/// nesting depth is limited only by the document size.
pub fn parse_document(xml: &str) -> Result<RecordTree, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<OpenElement> = Vec::new();
    let mut root: Option<(String, RecordTree)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                if stack.is_empty() {
                    ensure_single_root(&root, &start)?;
                }
                stack.push(OpenElement::new(&start, &reader));
            }
            Event::Empty(start) => {
                if stack.is_empty() {
                    ensure_single_root(&root, &start)?;
                }
                let closed = OpenElement::new(&start, &reader).into_node();
                attach(&mut stack, &mut root, closed);
            }
            Event::End(_) => {
                // quick-xml verifies end names, so the top of the stack always matches
                if let Some(open) = stack.pop() {
                    let closed = open.into_node();
                    attach(&mut stack, &mut root, closed);
                }
            }
            Event::Text(text) => {
                if let Some(open) = stack.last_mut() {
                    open.push_text(&String::from_utf8_lossy(&text));
                }
            }
            Event::CData(data) => {
                if let Some(open) = stack.last_mut() {
                    open.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(ParseError::Unclosed(open.name));
    }

    let (name, node) = root.ok_or(ParseError::NoRoot)?;
    let mut fields = IndexMap::new();
    fields.insert(name, node);
    Ok(RecordTree::Map(fields))
}

fn ensure_single_root(
    root: &Option<(String, RecordTree)>,
    start: &BytesStart<'_>,
) -> Result<(), ParseError> {
    if root.is_some() {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        return Err(ParseError::MultipleRoots(name));
    }
    Ok(())
}

fn attach(
    stack: &mut [OpenElement],
    root: &mut Option<(String, RecordTree)>,
    (name, node): (String, RecordTree),
) {
    match stack.last_mut() {
        Some(parent) => parent.children.entry(name).or_default().push(node),
        None => *root = Some((name, node)),
    }
}

/// Collects every `item`/`entry` container anywhere in the tree.
///
/// Uses an explicit worklist in depth-first document order. Matched
/// containers are moved out whole; the walk never descends into them.
pub fn collect_items(root: RecordTree) -> Vec<RawItem> {
    let mut items = Vec::new();
    let mut pending = vec![root];

    while let Some(mut node) = pending.pop() {
        match &mut node {
            RecordTree::Text(_) => {}
            RecordTree::List(nodes) => pending.extend(std::mem::take(nodes).into_iter().rev()),
            RecordTree::Map(fields) => {
                let mut fields = std::mem::take(fields);
                for key in ITEM_KEYS {
                    if let Some(RecordTree::List(entries)) = fields.get_mut(key) {
                        items.extend(std::mem::take(entries).iter_mut().map(into_raw_item));
                    }
                }
                let start = pending.len();
                pending.extend(fields.into_iter().filter_map(|(key, value)| {
                    let skip = ITEM_KEYS.contains(&key.as_str()) || key == CONTENT_KEY;
                    (!skip).then_some(value)
                }));
                pending[start..].reverse();
            }
        }
    }

    items
}

fn into_raw_item(entry: &mut RecordTree) -> RawItem {
    match entry {
        RecordTree::Map(fields) => std::mem::take(fields),
        // A bare-text entry has no fields and is reported as missing its id later
        _ => RawItem::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::tree::{canonical_id, field_text};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:job="https://jobicy.com">
  <channel>
    <title>Remote Jobs</title>
    <item>
      <title>Senior Rust Engineer</title>
      <link>https://jobs.example.com/rust-1</link>
      <job:company_name>Engineering & Co</job:company_name>
      <job:location>Berlin</job:location>
      <description><![CDATA[<p>Build <b>things</b></p>]]></description>
      <pubDate>Tue, 03 Jun 2025 10:00:00 +0000</pubDate>
      <guid isPermaLink="false">rust-1</guid>
    </item>
    <item>
      <title>Designer</title>
      <guid>design-2</guid>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Jobs</title>
  <entry>
    <title>Data Scientist</title>
    <link rel="alternate" href="https://jobs.example.com/atom/ds"/>
    <id>urn:uuid:1</id>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss_items() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(field_text(&items[0], "title"), "Senior Rust Engineer");
        assert_eq!(
            canonical_id(&items[0]).as_deref(),
            Some("https://jobs.example.com/rust-1")
        );
        assert_eq!(canonical_id(&items[1]).as_deref(), Some("design-2"));
    }

    #[test]
    fn test_ampersand_repair_preserves_text() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(field_text(&items[0], "company_name"), "Engineering & Co");
    }

    #[test]
    fn test_namespace_prefix_stripped() {
        let items = parse_feed(RSS).unwrap();
        assert!(items[0].contains_key("company_name"));
        assert!(items[0].contains_key("location"));
        assert!(!items[0].keys().any(|k| k.contains(':')));
    }

    #[test]
    fn test_attributes_merged_with_content() {
        let items = parse_feed(RSS).unwrap();
        let guid = &items[0]["guid"];
        let RecordTree::List(nodes) = guid else {
            panic!("guid should be a sequence, got {:?}", guid);
        };
        assert_eq!(nodes[0].get("isPermaLink"), Some(&RecordTree::Text("false".into())));
        assert_eq!(nodes[0].get(CONTENT_KEY), Some(&RecordTree::Text("rust-1".into())));
    }

    #[test]
    fn test_cdata_kept_as_text() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(
            field_text(&items[0], "description"),
            "<p>Build <b>things</b></p>"
        );
    }

    #[test]
    fn test_parse_atom_entries() {
        let items = parse_feed(ATOM).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            canonical_id(&items[0]).as_deref(),
            Some("https://jobs.example.com/atom/ds")
        );
    }

    #[test]
    fn test_items_found_at_any_depth_in_order() {
        let xml = r#"<root>
            <item><title>A</title></item>
            <wrapper><deeper><item><title>B</title></item></deeper></wrapper>
            <entry><title>C</title><item><title>nested-not-collected</title></item></entry>
        </root>"#;
        let items = parse_feed(xml).unwrap();
        let titles: Vec<String> = items.iter().map(|i| field_text(i, "title")).collect();
        assert_eq!(titles, vec!["A", "C", "B"]);
    }

    #[test]
    fn test_deep_nesting_parses_without_recursion() {
        let depth = 20_000;
        let mut xml = String::new();
        for _ in 0..depth {
            xml.push_str("<n>");
        }
        xml.push_str("<item><link>deep</link></item>");
        for _ in 0..depth {
            xml.push_str("</n>");
        }
        let items = parse_feed(&xml).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(canonical_id(&items[0]).as_deref(), Some("deep"));
    }

    #[test]
    fn test_deep_markup_inside_item_is_moved_not_copied() {
        let handle = std::thread::Builder::new()
            .stack_size(512 * 1024)
            .spawn(|| {
                let depth = 50_000;
                let mut xml = String::from("<rss><channel><item><link>https://x/deep</link><description>");
                xml.push_str(&"<div>".repeat(depth));
                xml.push_str("body");
                xml.push_str(&"</div>".repeat(depth));
                xml.push_str("</description></item></channel></rss>");

                let items = parse_feed(&xml).unwrap();
                assert_eq!(items.len(), 1);
                assert_eq!(canonical_id(&items[0]).as_deref(), Some("https://x/deep"));
                assert_eq!(field_text(&items[0], "description"), "body");
            })
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_bare_text_item_becomes_empty() {
        let items = parse_feed("<rss><channel><item>just text</item></channel></rss>").unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_empty());
    }

    #[test]
    fn test_unknown_entity_kept_literally() {
        let items = parse_feed("<rss><item><title>Caf&eacute; Jobs</title></item></rss>").unwrap();
        assert_eq!(field_text(&items[0], "title"), "Caf&eacute; Jobs");
    }

    #[test]
    fn test_malformed_documents_error() {
        assert!(parse_feed("<not valid xml").is_err());
        assert!(parse_feed("<rss><item></rss>").is_err());
        assert!(matches!(parse_feed(""), Err(ParseError::NoRoot)));
        assert!(matches!(
            parse_feed("<a/><b/>"),
            Err(ParseError::MultipleRoots(name)) if name == "b"
        ));
    }

    #[test]
    fn test_repair_ampersands_cases() {
        assert_eq!(repair_ampersands("A & B"), "A &amp; B");
        assert_eq!(repair_ampersands("A &amp; B"), "A &amp; B");
        assert_eq!(repair_ampersands("&#38;&#x26;"), "&#38;&#x26;");
        assert_eq!(repair_ampersands("&#xZZ;"), "&amp;#xZZ;");
        assert_eq!(repair_ampersands("a=1&b=2"), "a=1&amp;b=2");
        assert_eq!(repair_ampersands("trailing &"), "trailing &amp;");
        assert!(matches!(repair_ampersands("no amps"), Cow::Borrowed(_)));
    }

    proptest! {
        #[test]
        fn prop_bare_ampersands_survive_parsing(text in "[A-Za-z0-9 &]{0,40}") {
            let xml = format!("<rss><item><title>{}</title></item></rss>", text);
            let items = parse_feed(&xml).unwrap();
            prop_assert_eq!(field_text(&items[0], "title"), text.trim());
        }

        #[test]
        fn prop_repair_leaves_no_bare_ampersand(text in "[a-z#x0-9;& ]{0,40}") {
            let repaired = repair_ampersands(&text);
            for (pos, _) in repaired.match_indices('&') {
                prop_assert!(starts_with_entity_ref(&repaired[pos + 1..]));
            }
        }
    }
}
