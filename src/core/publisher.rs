//! Publishes allow-listed tags on the event bus
//!
//! Runs over the parser's output before routing, so tags inside regions are
//! seen whether or not the region is mirrored into the main output.

use crate::config::PublishRule;
use crate::core::events::EventBus;
use crate::data::TagNode;
use std::collections::HashMap;
use std::sync::Arc;

/// Event name used for region wrappers
pub const REGION_EVENT: &str = "pushStream";

#[derive(Clone)]
pub struct TagPublisher {
    bus: Arc<EventBus>,
    /// Tag name -> optional attribute whose value suffixes the event name
    rules: HashMap<String, Option<String>>,
}

impl TagPublisher {
    pub fn new(bus: Arc<EventBus>, rules: &[PublishRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| (rule.tag.clone(), rule.key_attribute.clone()))
            .collect();
        Self { bus, rules }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Event name for a tag, or `None` if it isn't allow-listed
    pub fn event_name(&self, tag: &TagNode) -> Option<String> {
        let name = if tag.is_region_wrapper() {
            REGION_EVENT
        } else {
            tag.name.as_str()
        };
        let key_attribute = self.rules.get(name)?;

        let key = if tag.is_region_wrapper() {
            tag.region_id()
        } else {
            key_attribute.as_deref().and_then(|attr| tag.attr(attr))
        };
        Some(match key {
            Some(key) => format!("{}:{}", name, key),
            None => name.to_string(),
        })
    }

    /// Publish every allow-listed tag in `tags`, depth first in document
    /// order. Returns the number of events published.
    pub fn publish(&self, tags: &[TagNode]) -> usize {
        let mut published = 0;
        for tag in tags {
            tag.walk(&mut |node: &TagNode| {
                if let Some(event) = self.event_name(node) {
                    tracing::trace!("Publishing '{}'", event);
                    self.bus.publish(&event, node);
                    published += 1;
                }
            });
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventsConfig;
    use std::sync::Mutex;

    fn publisher() -> TagPublisher {
        TagPublisher::new(Arc::new(EventBus::new()), &EventsConfig::default().publish)
    }

    #[test]
    fn test_event_names() {
        let publisher = publisher();

        let bar = TagNode::new("progressBar").with_attr("id", "health");
        assert_eq!(publisher.event_name(&bar).as_deref(), Some("progressBar:health"));

        let bare_bar = TagNode::new("progressBar");
        assert_eq!(publisher.event_name(&bare_bar).as_deref(), Some("progressBar"));

        let left = TagNode::new("left").with_attr("exist", "123").with_text("a sword");
        assert_eq!(publisher.event_name(&left).as_deref(), Some("left"));

        let wrapper = TagNode::region_wrapper(Some("thoughts".to_string()));
        assert_eq!(publisher.event_name(&wrapper).as_deref(), Some("pushStream:thoughts"));

        assert_eq!(publisher.event_name(&TagNode::new("b")), None);
        assert_eq!(publisher.event_name(&TagNode::text_node("x", None)), None);
    }

    #[test]
    fn test_publishes_nested_tags() {
        let publisher = publisher();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        publisher.bus().subscribe("progressBar:mana", move |tag: &TagNode| {
            sink.lock().unwrap().push(tag.attr("value").unwrap_or_default().to_string());
            Ok(())
        });
        let sink = Arc::clone(&seen);
        publisher.bus().subscribe("prompt", move |tag: &TagNode| {
            sink.lock().unwrap().push(tag.plain_text());
            Ok(())
        });

        let tags = vec![
            TagNode::new("dialogData")
                .with_attr("id", "minivitals")
                .with_child(TagNode::new("progressBar").with_attr("id", "mana").with_attr("value", "87")),
            TagNode::new("prompt").with_attr("time", "1700000000").with_text(">"),
        ];

        assert_eq!(publisher.publish(&tags), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["87", ">"]);
    }

    #[test]
    fn test_custom_rules_replace_defaults() {
        let publisher = TagPublisher::new(
            Arc::new(EventBus::new()),
            &[PublishRule::keyed("indicator", "id")],
        );
        let indicator = TagNode::new("indicator").with_attr("id", "IconHIDDEN");
        assert_eq!(publisher.event_name(&indicator).as_deref(), Some("indicator:IconHIDDEN"));
        assert_eq!(publisher.event_name(&TagNode::new("prompt")), None);
    }
}
