//! Typed publish/subscribe keyed by event name
//!
//! Subscribers declare the payload type they expect. At publish time only
//! handlers whose declared type matches the payload run; the rest are
//! skipped. Several payload shapes can share one event name this way.
//!
//! Handlers run one after another, in subscription order, on the publisher's
//! thread. A handler that returns an error or panics is logged and skipped;
//! delivery continues with the next one.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&dyn Any) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    payload_type: TypeId,
    payload_name: &'static str,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: SubscriptionId,
    /// Event name -> subscriptions in subscription order
    events: HashMap<String, Vec<Subscription>>,
}

#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a handler for payloads of type `T` published under `event`
    pub fn subscribe<T, F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        T: Any,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |payload: &dyn Any| match payload.downcast_ref::<T>() {
            Some(payload) => handler(payload),
            None => Ok(()),
        });

        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .events
            .entry(event.to_string())
            .or_default()
            .push(Subscription {
                id,
                payload_type: TypeId::of::<T>(),
                payload_name: type_name::<T>(),
                handler,
            });

        tracing::debug!(
            "Subscription {} on '{}' for {}",
            id,
            event,
            type_name::<T>()
        );
        id
    }

    /// Deliver `data` to every matching handler of `event`.
    ///
    /// Returns how many handlers ran (failures included).
    pub fn publish<T: Any>(&self, event: &str, data: &T) -> usize {
        let payload_type = TypeId::of::<T>();

        // Handlers may subscribe or unsubscribe, so run them without the lock
        let handlers: Vec<(SubscriptionId, &'static str, Handler)> = {
            let registry = self.lock();
            let Some(subscriptions) = registry.events.get(event) else {
                return 0;
            };
            subscriptions
                .iter()
                .filter(|sub| sub.payload_type == payload_type)
                .map(|sub| (sub.id, sub.payload_name, Arc::clone(&sub.handler)))
                .collect()
        };

        for (id, payload_name, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(data as &dyn Any))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Handler {} for '{}' ({}) failed: {:#}",
                        id,
                        event,
                        payload_name,
                        e
                    );
                }
                Err(_) => {
                    tracing::error!("Handler {} for '{}' ({}) panicked", id, event, payload_name);
                }
            }
        }

        handlers.len()
    }

    /// Remove one subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let mut removed = false;
        registry.events.retain(|_, subscriptions| {
            let before = subscriptions.len();
            subscriptions.retain(|sub| sub.id != id);
            removed |= subscriptions.len() != before;
            !subscriptions.is_empty()
        });
        removed
    }

    /// Remove every subscription for an event name
    pub fn unsubscribe_all(&self, event: &str) -> usize {
        self.lock()
            .events
            .remove(event)
            .map_or(0, |subscriptions| subscriptions.len())
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.lock().events.get(event).map_or(0, Vec::len)
    }
}
