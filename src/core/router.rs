//! Splits region wrappers out of the parsed tag stream
//!
//! Ordinary tags go straight to the main output. A region wrapper's children
//! become one message in that region's buffer and, in mirror mode, are also
//! spliced into the main output where the wrapper stood.

use crate::core::buffers::StreamBufferManager;
use crate::data::{Message, TagNode};

#[derive(Debug, Clone)]
pub struct StreamRouter {
    buffers: StreamBufferManager,
}

impl StreamRouter {
    pub fn new(buffers: StreamBufferManager) -> Self {
        Self { buffers }
    }

    pub fn buffers(&self) -> &StreamBufferManager {
        &self.buffers
    }

    /// Route one batch of parsed tags, returning what belongs in the main output
    pub fn route(&self, tags: Vec<TagNode>, mirror: bool) -> Vec<TagNode> {
        let mut output = Vec::with_capacity(tags.len());

        for tag in tags {
            if !tag.is_region_wrapper() {
                output.push(tag);
                continue;
            }

            let Some(region) = tag.region_id().map(str::to_string) else {
                tracing::warn!(
                    "Dropping stream wrapper without an id ({} child tag(s))",
                    tag.children.len()
                );
                continue;
            };

            if mirror {
                output.extend(tag.children.iter().cloned());
            }
            let message = Message::from_tags(tag.children, Some(region.clone()));
            self.buffers.append(message, &region);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn wrapper(id: Option<&str>, children: Vec<TagNode>) -> TagNode {
        let mut wrapper = TagNode::region_wrapper(id.map(str::to_string));
        wrapper.children = children;
        wrapper.state = crate::data::TagState::Closed;
        wrapper
    }

    fn thought(text: &str) -> TagNode {
        TagNode::text_node(text, Some("thoughts".to_string()))
    }

    #[test]
    fn test_ordinary_tags_pass_through() {
        let router = StreamRouter::new(StreamBufferManager::new());
        let tags = vec![TagNode::new("b").with_text("x"), TagNode::text_node("y", None)];
        assert_eq!(router.route(tags.clone(), false), tags);
        assert!(router.buffers().channels().is_empty());
    }

    #[test]
    fn test_region_suppressed_without_mirror() {
        let router = StreamRouter::new(StreamBufferManager::new());
        let tags = vec![
            TagNode::new("a"),
            wrapper(Some("thoughts"), vec![thought("hmm")]),
            TagNode::new("b"),
        ];

        let output = router.route(tags, false);
        assert_eq!(output, vec![TagNode::new("a"), TagNode::new("b")]);

        let messages = router.buffers().messages("thoughts");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].display, "hmm");
        assert_eq!(messages[0].tags, vec![thought("hmm")]);
        assert_eq!(messages[0].region.as_deref(), Some("thoughts"));
        assert_eq!(router.buffers().unread_count("thoughts"), 1);
    }

    #[test]
    fn test_mirror_splices_children_in_place() {
        let router = StreamRouter::new(StreamBufferManager::new());
        let tags = vec![
            TagNode::new("a"),
            wrapper(Some("thoughts"), vec![thought("one"), thought("two")]),
            TagNode::new("b"),
        ];

        let output = router.route(tags, true);
        assert_eq!(
            output,
            vec![TagNode::new("a"), thought("one"), thought("two"), TagNode::new("b")]
        );
        assert_eq!(router.buffers().len("thoughts"), 1);
    }

    #[test]
    fn test_wrapper_without_id_is_dropped() {
        let router = StreamRouter::new(StreamBufferManager::new());
        let tags = vec![wrapper(None, vec![TagNode::text_node("lost", None)]), TagNode::new("b")];

        assert_eq!(router.route(tags.clone(), true), vec![TagNode::new("b")]);
        assert_eq!(router.route(tags, false), vec![TagNode::new("b")]);
        assert!(router.buffers().channels().is_empty());
    }
}
