//! Fan-out subscriber registry keyed by [`EventType`].
//!
//! Handlers are snapshotted under the registry lock and invoked after it is
//! released, so a handler may subscribe, unsubscribe, or send on the manager
//! without deadlocking.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::realtime::event::{Event, EventType};

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies one registration on an [`EventBus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventType, HashMap<HandlerId, Handler>>,
}

/// Cloneable handle to a shared subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.registry);
        let counts: HashMap<EventType, usize> = registry
            .handlers
            .iter()
            .map(|(event_type, handlers)| (*event_type, handlers.len()))
            .collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`.
    ///
    /// The returned [`Subscription`] removes exactly this registration.
    /// Dropping it does not unsubscribe.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);
        registry
            .handlers
            .entry(event_type)
            .or_default()
            .insert(id, Arc::new(handler));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            event_type,
            id,
        }
    }

    /// Removes a registration. Returns `false` if it was not present.
    pub fn unsubscribe(&self, event_type: EventType, id: HandlerId) -> bool {
        remove(&self.registry, event_type, id)
    }

    /// Number of handlers currently registered for `event_type`.
    pub fn handler_count(&self, event_type: EventType) -> usize {
        lock(&self.registry)
            .handlers
            .get(&event_type)
            .map_or(0, HashMap::len)
    }

    /// Invokes every handler registered for the event's type.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &Event) -> usize {
        let handlers: Vec<Handler> = lock(&self.registry)
            .handlers
            .get(&event.event_type)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

/// Capability to remove one registration.
#[derive(Clone, Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    event_type: EventType,
    id: HandlerId,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Removes the registration. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            remove(&registry, self.event_type, self.id);
        }
    }
}

fn remove(registry: &Mutex<Registry>, event_type: EventType, id: HandlerId) -> bool {
    let mut registry = lock(registry);
    let Some(handlers) = registry.handlers.get_mut(&event_type) else {
        return false;
    };
    let removed = handlers.remove(&id).is_some();
    if handlers.is_empty() {
        registry.handlers.remove(&event_type);
    }
    removed
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::EventBus;
    use crate::realtime::event::{Event, EventType};

    fn counter(bus: &EventBus, event_type: EventType) -> (Arc<AtomicUsize>, super::Subscription) {
        let hits = Arc::new(AtomicUsize::new(0));
        let subscription = bus.subscribe(event_type, {
            let hits = Arc::clone(&hits);
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        (hits, subscription)
    }

    #[test]
    fn dispatch_fans_out_to_matching_type_only() {
        let bus = EventBus::new();
        let (first, _a) = counter(&bus, EventType::ChatDelta);
        let (second, _b) = counter(&bus, EventType::ChatDelta);
        let (other, _c) = counter(&bus, EventType::ChatComplete);

        let invoked = bus.dispatch(&Event::new(EventType::ChatDelta, json!("hi")));

        assert_eq!(invoked, 2);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_targeted() {
        let bus = EventBus::new();
        let (removed, subscription) = counter(&bus, EventType::TaskUpdate);
        let (kept, _kept_subscription) = counter(&bus, EventType::TaskUpdate);

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!bus.unsubscribe(EventType::TaskUpdate, subscription.id()));

        bus.dispatch(&Event::new(EventType::TaskUpdate, json!(null)));
        assert_eq!(removed.load(Ordering::SeqCst), 0);
        assert_eq!(kept.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(EventType::TaskUpdate), 1);
    }

    #[test]
    fn explicit_unsubscribe_matches_handle() {
        let bus = EventBus::new();
        let (hits, subscription) = counter(&bus, EventType::Error);

        assert!(bus.unsubscribe(EventType::Error, subscription.id()));
        assert!(!bus.unsubscribe(EventType::ChatDelta, subscription.id()));
        assert_eq!(bus.dispatch(&Event::new(EventType::Error, json!({}))), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_can_unsubscribe_itself_during_dispatch() {
        let bus = EventBus::new();
        let slot: Arc<std::sync::Mutex<Option<super::Subscription>>> = Arc::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let subscription = bus.subscribe(EventType::MetricsUpdate, {
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(subscription) = slot.lock().expect("slot").take() {
                    subscription.unsubscribe();
                }
            }
        });
        *slot.lock().expect("slot") = Some(subscription);

        bus.dispatch(&Event::new(EventType::MetricsUpdate, json!(1)));
        bus.dispatch(&Event::new(EventType::MetricsUpdate, json!(2)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
