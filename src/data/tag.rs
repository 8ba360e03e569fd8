//! Parsed tag tree and the message unit stored in region buffers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reserved name for synthetic text nodes. `#` can't start an XML name, so
/// this never collides with a server element.
pub const TEXT_NODE_NAME: &str = "#text";

/// Reserved name for the synthetic wrapper holding one region's content
pub const REGION_WRAPPER_NAME: &str = "#stream";

/// Attribute on a region wrapper that carries the region (stream) id
pub const REGION_ID_ATTR: &str = "id";

static NEXT_TAG_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a tag node. Never part of equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(u64);

impl TagId {
    fn next() -> Self {
        Self(NEXT_TAG_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagState {
    /// Still being assembled by the parser
    Open,
    Closed,
}

/// One parsed element, text run, or region wrapper
#[derive(Debug, Clone, Serialize)]
pub struct TagNode {
    #[serde(skip)]
    pub id: TagId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TagNode>,
    pub state: TagState,
    /// Region (stream id) this tag was parsed inside, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl PartialEq for TagNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.text == other.text
            && self.attributes == other.attributes
            && self.children == other.children
            && self.state == other.state
            && self.region == other.region
    }
}

impl Eq for TagNode {}

impl TagNode {
    /// A closed element with no attributes, text, or children.
    ///
    /// Use the `with_*` builders to fill it in.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TagId::next(),
            name: name.into(),
            text: None,
            attributes: HashMap::new(),
            children: Vec::new(),
            state: TagState::Closed,
            region: None,
        }
    }

    /// An element the parser has seen the start of but not the end
    pub fn open(
        name: impl Into<String>,
        attributes: HashMap<String, String>,
        region: Option<String>,
    ) -> Self {
        Self {
            attributes,
            state: TagState::Open,
            region,
            ..Self::new(name)
        }
    }

    /// A closed synthetic text node
    pub fn text_node(text: impl Into<String>, region: Option<String>) -> Self {
        Self {
            text: Some(text.into()),
            region,
            ..Self::new(TEXT_NODE_NAME)
        }
    }

    /// An open region wrapper. A push directive without an id still gets a
    /// wrapper; the router drops it later.
    pub fn region_wrapper(region_id: Option<String>) -> Self {
        let mut wrapper = Self::new(REGION_WRAPPER_NAME);
        wrapper.state = TagState::Open;
        if let Some(id) = &region_id {
            wrapper
                .attributes
                .insert(REGION_ID_ATTR.to_string(), id.clone());
        }
        wrapper.region = region_id;
        wrapper
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: TagNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn is_text(&self) -> bool {
        self.name == TEXT_NODE_NAME
    }

    pub fn is_region_wrapper(&self) -> bool {
        self.name == REGION_WRAPPER_NAME
    }

    pub fn is_closed(&self) -> bool {
        self.state == TagState::Closed
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Region id carried by a wrapper's `id` attribute
    pub fn region_id(&self) -> Option<&str> {
        if self.is_region_wrapper() {
            self.attr(REGION_ID_ATTR)
        } else {
            None
        }
    }

    /// All text in this subtree, in document order
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.children {
            child.collect_text(out);
        }
    }

    /// Depth-first, pre-order walk over this node and its descendants
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a TagNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// Logical unit held in a region buffer
#[derive(Debug, Clone)]
pub struct Message {
    pub timestamp: DateTime<Utc>,
    /// Plain-text rendering of `tags`
    pub display: String,
    pub tags: Vec<TagNode>,
    pub region: Option<String>,
}

impl Message {
    pub fn from_tags(tags: Vec<TagNode>, region: Option<String>) -> Self {
        let display = tags.iter().map(TagNode::plain_text).collect();
        Self {
            timestamp: Utc::now(),
            display,
            tags,
            region,
        }
    }

    /// Text-only message, handy for system lines and tests
    pub fn text(text: impl Into<String>, region: Option<String>) -> Self {
        let node = TagNode::text_node(text, region.clone());
        Self::from_tags(vec![node], region)
    }
}
