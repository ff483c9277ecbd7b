use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Slot holding an element's own text when it also carries attributes or children.
pub const CONTENT_KEY: &str = "_";

/// Paragraph-style wrapper some feeds put around descriptive text.
const WRAPPER_KEY: &str = "p";

/// One raw feed entry: field name to parsed node, in document order.
pub type RawItem = IndexMap<String, RecordTree>;

/// A parsed feed node.
///
/// Elements without attributes or child elements become [`RecordTree::Text`].
/// Everything else becomes a [`RecordTree::Map`] where attributes map to
/// `Text` values, child tags map to a `List` of their occurrences, and the
/// element's own text (if any) lives under [`CONTENT_KEY`].
///
/// `Clone` and `Drop` are iterative; serde goes through a flat node table.
#[derive(Debug, PartialEq)]
pub enum RecordTree {
    Text(String),
    List(Vec<RecordTree>),
    Map(IndexMap<String, RecordTree>),
}

impl RecordTree {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RecordTree::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, RecordTree>> {
        match self {
            RecordTree::Map(fields) => Some(fields),
            _ => None,
        }
    }

    /// Field lookup on a map node. Other variants have no fields.
    pub fn get(&self, key: &str) -> Option<&RecordTree> {
        self.as_map().and_then(|fields| fields.get(key))
    }

    /// Collapses the node to a single string.
    ///
    /// Strings are returned as-is, sequences yield their first element, and
    /// maps prefer their direct content, then a `p` wrapper, then their first
    /// value in document order. Empty sequences and maps collapse to `""`.
    pub fn collapse(&self) -> String {
        let mut node = self;
        loop {
            let next = match node {
                RecordTree::Text(s) => return s.clone(),
                RecordTree::List(nodes) => nodes.first(),
                RecordTree::Map(fields) => fields
                    .get(CONTENT_KEY)
                    .or_else(|| fields.get(WRAPPER_KEY))
                    .or_else(|| fields.values().next()),
            };
            match next {
                Some(child) => node = child,
                None => return String::new(),
            }
        }
    }
}

// Deeply nested documents would otherwise overflow the stack on drop.
impl Drop for RecordTree {
    fn drop(&mut self) {
        let mut pending = match self {
            RecordTree::Text(_) => return,
            RecordTree::List(nodes) => std::mem::take(nodes),
            RecordTree::Map(fields) => std::mem::take(fields).into_values().collect(),
        };
        while let Some(mut node) = pending.pop() {
            match &mut node {
                RecordTree::Text(_) => {}
                RecordTree::List(nodes) => pending.append(nodes),
                RecordTree::Map(fields) => pending.extend(std::mem::take(fields).into_values()),
            }
        }
    }
}

impl Clone for RecordTree {
    fn clone(&self) -> Self {
        let mut stack = match CloneFrame::open(self) {
            Ok(leaf) => return leaf,
            Err(frame) => vec![frame],
        };
        while let Some(top) = stack.last_mut() {
            match top.next_child() {
                Some(child) => match CloneFrame::open(child) {
                    Ok(leaf) => top.push(leaf),
                    Err(frame) => stack.push(frame),
                },
                None => {
                    let Some(done) = stack.pop().map(CloneFrame::finish) else {
                        break;
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.push(done),
                        None => return done,
                    }
                }
            }
        }
        unreachable!("the root frame returns before the stack empties")
    }
}

/// A container being copied: the source children still to visit and the
/// copies made so far.
enum CloneFrame<'a> {
    List {
        source: std::slice::Iter<'a, RecordTree>,
        built: Vec<RecordTree>,
    },
    Map {
        source: indexmap::map::Iter<'a, String, RecordTree>,
        built: IndexMap<String, RecordTree>,
        key: String,
    },
}

impl<'a> CloneFrame<'a> {
    /// Copies a leaf outright, or opens a frame for a container.
    fn open(node: &'a RecordTree) -> Result<RecordTree, Self> {
        match node {
            RecordTree::Text(s) => Ok(RecordTree::Text(s.clone())),
            RecordTree::List(nodes) => Err(CloneFrame::List {
                source: nodes.iter(),
                built: Vec::with_capacity(nodes.len()),
            }),
            RecordTree::Map(fields) => Err(CloneFrame::Map {
                source: fields.iter(),
                built: IndexMap::with_capacity(fields.len()),
                key: String::new(),
            }),
        }
    }

    fn next_child(&mut self) -> Option<&'a RecordTree> {
        match self {
            CloneFrame::List { source, .. } => source.next(),
            CloneFrame::Map { source, key, .. } => source.next().map(|(k, v)| {
                key.clone_from(k);
                v
            }),
        }
    }

    fn push(&mut self, child: RecordTree) {
        match self {
            CloneFrame::List { built, .. } => built.push(child),
            CloneFrame::Map { built, key, .. } => {
                built.insert(std::mem::take(key), child);
            }
        }
    }

    fn finish(self) -> RecordTree {
        match self {
            CloneFrame::List { built, .. } => RecordTree::List(built),
            CloneFrame::Map { built, .. } => RecordTree::Map(built),
        }
    }
}

/// One entry of the serialized node table. Children are referenced by their
/// index in the table, so the JSON nesting depth is the same for every tree.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FlatNode {
    Text(String),
    List { list: Vec<usize> },
    Map { map: Vec<(String, usize)> },
}

/// Serializes as a node table: entry 0 is the node itself and every child
/// index points further down the table.
impl Serialize for RecordTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        flatten(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RecordTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let nodes = Vec::<FlatNode>::deserialize(deserializer)?;
        unflatten(nodes).map_err(D::Error::custom)
    }
}

fn flatten(root: &RecordTree) -> Vec<FlatNode> {
    let mut table = vec![FlatNode::Text(String::new())];
    let mut pending = vec![(root, 0usize)];
    while let Some((node, index)) = pending.pop() {
        let entry = match node {
            RecordTree::Text(s) => FlatNode::Text(s.clone()),
            RecordTree::List(nodes) => FlatNode::List {
                list: nodes
                    .iter()
                    .map(|child| reserve(&mut table, &mut pending, child))
                    .collect(),
            },
            RecordTree::Map(fields) => FlatNode::Map {
                map: fields
                    .iter()
                    .map(|(key, child)| (key.clone(), reserve(&mut table, &mut pending, child)))
                    .collect(),
            },
        };
        table[index] = entry;
    }
    table
}

fn reserve<'a>(
    table: &mut Vec<FlatNode>,
    pending: &mut Vec<(&'a RecordTree, usize)>,
    child: &'a RecordTree,
) -> usize {
    let index = table.len();
    table.push(FlatNode::Text(String::new()));
    pending.push((child, index));
    index
}

/// Rebuilds a tree from its node table, last entry first, so every child is
/// complete before its parent claims it.
fn unflatten(nodes: Vec<FlatNode>) -> Result<RecordTree, String> {
    if nodes.is_empty() {
        return Err("empty node table".to_string());
    }
    let len = nodes.len();
    let mut slots: Vec<Option<RecordTree>> = (0..len).map(|_| None).collect();
    for (index, node) in nodes.into_iter().enumerate().rev() {
        let mut claim = |child: usize| -> Result<RecordTree, String> {
            if child <= index || child >= len {
                return Err(format!("node {} has invalid child index {}", index, child));
            }
            slots[child]
                .take()
                .ok_or_else(|| format!("node {} is referenced more than once", child))
        };
        let built = match node {
            FlatNode::Text(s) => RecordTree::Text(s),
            FlatNode::List { list } => RecordTree::List(
                list.into_iter().map(&mut claim).collect::<Result<_, _>>()?,
            ),
            FlatNode::Map { map } => RecordTree::Map(
                map.into_iter()
                    .map(|(key, child)| claim(child).map(|tree| (key, tree)))
                    .collect::<Result<_, _>>()?,
            ),
        };
        slots[index] = Some(built);
    }
    if let Some(orphan) = slots.iter().skip(1).position(Option::is_some) {
        return Err(format!("node {} is never referenced", orphan + 1));
    }
    slots[0].take().ok_or_else(|| "missing root node".to_string())
}

/// Collapses a field of a raw item, yielding `""` when the field is absent.
pub fn field_text(item: &RawItem, field: &str) -> String {
    item.get(field).map(RecordTree::collapse).unwrap_or_default()
}

/// Derives the identifier used to deduplicate postings across runs.
///
/// Precedence: the `link` field, then the text content of `guid`, then the
/// first attribute value on `guid`. Blank values are treated as absent.
pub fn canonical_id(item: &RawItem) -> Option<String> {
    link_value(item)
        .or_else(|| guid_text(item))
        .or_else(|| guid_attribute(item))
}

fn first_occurrence<'a>(item: &'a RawItem, field: &str) -> Option<&'a RecordTree> {
    match item.get(field)? {
        RecordTree::List(nodes) => nodes.first(),
        node => Some(node),
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn link_value(item: &RawItem) -> Option<String> {
    match first_occurrence(item, "link")? {
        RecordTree::Text(s) => non_blank(s),
        // Atom links carry the target in an href attribute
        RecordTree::Map(fields) => fields
            .get(CONTENT_KEY)
            .or_else(|| fields.get("href"))
            .and_then(RecordTree::as_text)
            .and_then(non_blank),
        RecordTree::List(_) => None,
    }
}

fn guid_text(item: &RawItem) -> Option<String> {
    match first_occurrence(item, "guid")? {
        RecordTree::Text(s) => non_blank(s),
        RecordTree::Map(fields) => fields
            .get(CONTENT_KEY)
            .and_then(RecordTree::as_text)
            .and_then(non_blank),
        RecordTree::List(_) => None,
    }
}

fn guid_attribute(item: &RawItem) -> Option<String> {
    let fields = first_occurrence(item, "guid")?.as_map()?;
    // Attributes are stored as bare text; child elements are always lists.
    fields
        .iter()
        .filter(|(key, _)| key.as_str() != CONTENT_KEY)
        .find_map(|(_, value)| value.as_text().and_then(non_blank))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RecordTree {
        RecordTree::Text(s.to_string())
    }

    fn list(nodes: Vec<RecordTree>) -> RecordTree {
        RecordTree::List(nodes)
    }

    fn map(fields: &[(&str, RecordTree)]) -> RecordTree {
        RecordTree::Map(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn item(fields: &[(&str, RecordTree)]) -> RawItem {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_collapse_text() {
        assert_eq!(text("Engineer").collapse(), "Engineer");
    }

    #[test]
    fn test_collapse_list_takes_first() {
        assert_eq!(list(vec![text("a"), text("b")]).collapse(), "a");
        assert_eq!(list(vec![]).collapse(), "");
    }

    #[test]
    fn test_collapse_map_prefers_content_then_wrapper() {
        let node = map(&[("lang", text("en")), ("_", text("body"))]);
        assert_eq!(node.collapse(), "body");

        let wrapped = map(&[("class", text("x")), ("p", list(vec![text("para")]))]);
        assert_eq!(wrapped.collapse(), "para");

        let other = map(&[("span", list(vec![text("first")])), ("b", text("second"))]);
        assert_eq!(other.collapse(), "first");

        assert_eq!(map(&[]).collapse(), "");
    }

    #[test]
    fn test_collapse_deeply_nested_does_not_recurse() {
        let mut node = text("leaf");
        for _ in 0..10_000 {
            node = list(vec![node]);
        }
        assert_eq!(node.collapse(), "leaf");
        drop(node);
    }

    #[test]
    fn test_canonical_id_prefers_link() {
        let raw = item(&[
            ("guid", list(vec![text("guid-1")])),
            ("link", list(vec![text("https://jobs.example.com/1")])),
        ]);
        assert_eq!(
            canonical_id(&raw).as_deref(),
            Some("https://jobs.example.com/1")
        );
    }

    #[test]
    fn test_canonical_id_guid_text_content() {
        let raw = item(&[(
            "guid",
            list(vec![map(&[("isPermaLink", text("false")), ("_", text("abc-123"))])]),
        )]);
        assert_eq!(canonical_id(&raw).as_deref(), Some("abc-123"));

        let plain = item(&[("guid", list(vec![text("plain-guid")]))]);
        assert_eq!(canonical_id(&plain).as_deref(), Some("plain-guid"));
    }

    #[test]
    fn test_canonical_id_guid_attribute() {
        let raw = item(&[("guid", list(vec![map(&[("ref", text("urn:job:9"))])]))]);
        assert_eq!(canonical_id(&raw).as_deref(), Some("urn:job:9"));
    }

    #[test]
    fn test_canonical_id_atom_href() {
        let raw = item(&[(
            "link",
            list(vec![map(&[
                ("rel", text("alternate")),
                ("href", text("https://jobs.example.com/atom/1")),
            ])]),
        )]);
        assert_eq!(
            canonical_id(&raw).as_deref(),
            Some("https://jobs.example.com/atom/1")
        );
    }

    #[test]
    fn test_canonical_id_blank_link_falls_through() {
        let raw = item(&[
            ("link", list(vec![text("   ")])),
            ("guid", list(vec![text("fallback")])),
        ]);
        assert_eq!(canonical_id(&raw).as_deref(), Some("fallback"));
    }

    #[test]
    fn test_canonical_id_missing() {
        let raw = item(&[("title", list(vec![text("No id here")]))]);
        assert_eq!(canonical_id(&raw), None);
        assert_eq!(canonical_id(&RawItem::new()), None);
    }

    #[test]
    fn test_serde_shape_is_node_table() {
        let raw = item(&[
            ("title", list(vec![text("Dev")])),
            ("guid", list(vec![map(&[("_", text("g"))])])),
        ]);
        let json = serde_json::to_string(&raw).unwrap();
        assert_eq!(
            json,
            r#"{"title":[{"list":[1]},"Dev"],"guid":[{"list":[1]},{"map":[["_",2]]},"g"]}"#
        );
        let back: RawItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_node_table_rejects_malformed_references() {
        for json in [
            "[]",
            r#"[{"list":[0]}]"#,
            r#"[{"list":[5]}]"#,
            r#"[{"list":[1,1]},"x"]"#,
            r#"["a","orphan"]"#,
        ] {
            assert!(
                serde_json::from_str::<RecordTree>(json).is_err(),
                "accepted {}",
                json
            );
        }
    }

    fn nested_divs(depth: usize) -> RecordTree {
        let mut node = text("bottom");
        for _ in 0..depth {
            let mut fields = IndexMap::new();
            fields.insert("div".to_string(), list(vec![node]));
            node = RecordTree::Map(fields);
        }
        node
    }

    fn innermost(mut node: &RecordTree) -> &str {
        loop {
            match node {
                RecordTree::Text(s) => return s,
                RecordTree::List(nodes) => node = &nodes[0],
                RecordTree::Map(fields) => node = &fields["div"],
            }
        }
    }

    /// Runs `f` on a thread with a small stack so recursion would overflow.
    fn on_small_stack(f: impl FnOnce() + Send + 'static) {
        std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(f)
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn test_clone_deeply_nested_does_not_recurse() {
        on_small_stack(|| {
            let tree = nested_divs(50_000);
            let copy = tree.clone();
            assert_eq!(innermost(&copy), "bottom");
        });
    }

    #[test]
    fn test_serde_deeply_nested_does_not_recurse() {
        on_small_stack(|| {
            let mut raw = RawItem::new();
            raw.insert("description".to_string(), nested_divs(50_000));
            let json = serde_json::to_string(&raw).unwrap();
            let back: RawItem = serde_json::from_str(&json).unwrap();
            assert_eq!(innermost(&back["description"]), "bottom");
        });
    }
}
