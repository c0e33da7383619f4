//! Typed multicast event bus
//!
//! Handlers are grouped by event kind and kept in registration order
//! (duplicates allowed). [`EventBus::emit`] dispatches synchronously to the
//! handler list captured at call time, so handlers added during an emission
//! only see later emissions. A panicking handler is logged and skipped; the
//! remaining handlers of the same emission still run.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

/// Identifier of a registered handler, unique per bus
pub type HandlerId = u64;

type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct Table<K, P> {
    next_id: HandlerId,
    handlers: HashMap<K, Vec<(HandlerId, Handler<P>)>>,
}

/// Single-kind event used by value feeds ([`crate::Observable`],
/// [`crate::SharedStream`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueEvent {
    /// A new value was published
    Value,
}

/// Multicast event bus keyed by event kind `K` carrying payload `P`
pub struct EventBus<K, P> {
    table: Arc<Mutex<Table<K, P>>>,
}

impl<K, P> Clone for EventBus<K, P> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<K, P> Default for EventBus<K, P>
where
    K: Eq + Hash + Copy + fmt::Debug + Send + Sync + 'static,
    P: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> EventBus<K, P>
where
    K: Eq + Hash + Copy + fmt::Debug + Send + Sync + 'static,
    P: 'static,
{
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_id: 0,
                handlers: HashMap::new(),
            })),
        }
    }

    /// Append a handler for `kind`
    ///
    /// The returned [`Subscription`] removes exactly this handler.
    pub fn on<F>(&self, kind: K, handler: F) -> Subscription
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let id = {
            let mut table = self.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            table
                .handlers
                .entry(kind)
                .or_default()
                .push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Table<K, P>>> = Arc::downgrade(&self.table);
        Subscription::from_fn(id, move || {
            if let Some(table) = weak.upgrade() {
                remove_handler(&mut table.lock(), kind, id);
            }
        })
    }

    /// Remove one handler of `kind`, or every handler of `kind` when
    /// `handler` is `None`
    pub fn off(&self, kind: K, handler: Option<HandlerId>) {
        let mut table = self.table.lock();
        match handler {
            Some(id) => remove_handler(&mut table, kind, id),
            None => {
                table.handlers.remove(&kind);
            }
        }
    }

    /// Remove every handler of every kind
    pub fn clear(&self) {
        self.table.lock().handlers.clear();
    }

    /// Number of handlers currently registered for `kind`
    pub fn listener_count(&self, kind: K) -> usize {
        self.table
            .lock()
            .handlers
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Dispatch `payload` to the handlers registered for `kind`
    pub fn emit(&self, kind: K, payload: &P) {
        let snapshot: Vec<(HandlerId, Handler<P>)> = {
            let table = self.table.lock();
            match table.handlers.get(&kind) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };

        for (id, handler) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!(event = ?kind, handler_id = id, "Event handler panicked");
            }
        }
    }
}

fn remove_handler<K: Eq + Hash, P>(table: &mut Table<K, P>, kind: K, id: HandlerId) {
    if let Some(handlers) = table.handlers.get_mut(&kind) {
        handlers.retain(|(hid, _)| *hid != id);
        if handlers.is_empty() {
            table.handlers.remove(&kind);
        }
    }
}

/// Handle returned by `on`-style registrations
///
/// Dropping a subscription keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it. Unsubscribing after the
/// handler was already removed (e.g. by `off`) is a no-op.
pub struct Subscription {
    id: HandlerId,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Build a subscription from its removal action
    pub fn from_fn<F>(id: HandlerId, cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Identifier of the subscribed handler (usable with `off`)
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove the handler
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Bag of subscriptions released together
#[derive(Debug, Default)]
pub struct Subscriptions {
    items: Vec<Subscription>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.items.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Unsubscribe everything collected so far
    pub fn unsubscribe_all(&mut self) {
        for subscription in self.items.drain(..) {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Click,
        Load,
    }

    #[test]
    fn test_emit_in_registration_order() {
        let bus: EventBus<Kind, u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            let _ = bus.on(Kind::Click, move |v| seen.lock().push(format!("{tag}{v}")));
        }

        bus.emit(Kind::Click, &1);
        assert_eq!(*seen.lock(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_emit_only_reaches_matching_kind() {
        let bus: EventBus<Kind, u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _ = bus.on(Kind::Load, move |v| s.lock().push(*v));

        bus.emit(Kind::Click, &7);
        bus.emit(Kind::Load, &8);
        assert_eq!(*seen.lock(), vec![8]);
    }

    #[test]
    fn test_duplicate_handlers_allowed() {
        let bus: EventBus<Kind, ()> = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let handler = {
            let count = count.clone();
            move |_: &()| *count.lock() += 1
        };
        let _ = bus.on(Kind::Click, handler.clone());
        let _ = bus.on(Kind::Click, handler);

        bus.emit(Kind::Click, &());
        assert_eq!(*count.lock(), 2);
        assert_eq!(bus.listener_count(Kind::Click), 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_with_off() {
        let bus: EventBus<Kind, ()> = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let sub = bus.on(Kind::Click, move |_| *c.lock() += 1);

        bus.off(Kind::Click, Some(sub.id()));
        sub.unsubscribe();
        bus.emit(Kind::Click, &());
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn test_off_without_handler_removes_all() {
        let bus: EventBus<Kind, ()> = EventBus::new();
        let _ = bus.on(Kind::Click, |_| {});
        let _ = bus.on(Kind::Click, |_| {});
        let _ = bus.on(Kind::Load, |_| {});

        bus.off(Kind::Click, None);
        assert_eq!(bus.listener_count(Kind::Click), 0);
        assert_eq!(bus.listener_count(Kind::Load), 1);
    }

    #[test]
    fn test_handler_added_during_emit_not_invoked() {
        let bus: EventBus<Kind, ()> = EventBus::new();
        let late_calls = Arc::new(Mutex::new(0));
        let inner_bus = bus.clone();
        let late = late_calls.clone();
        let _ = bus.on(Kind::Click, move |_| {
            let late = late.clone();
            let _ = inner_bus.on(Kind::Click, move |_| *late.lock() += 1);
        });

        bus.emit(Kind::Click, &());
        assert_eq!(*late_calls.lock(), 0);

        bus.emit(Kind::Click, &());
        assert_eq!(*late_calls.lock(), 1);
    }

    #[test]
    fn test_panicking_handler_isolated() {
        let bus: EventBus<Kind, ()> = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let _ = bus.on(Kind::Click, |_| panic!("handler failure"));
        let _ = bus.on(Kind::Click, move |_| *c.lock() += 1);

        bus.emit(Kind::Click, &());
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_subscriptions_unsubscribe_all() {
        let bus: EventBus<Kind, ()> = EventBus::new();
        let mut subs = Subscriptions::new();
        subs.push(bus.on(Kind::Click, |_| {}));
        subs.push(bus.on(Kind::Load, |_| {}));
        assert_eq!(subs.len(), 2);

        subs.unsubscribe_all();
        assert!(subs.is_empty());
        assert_eq!(bus.listener_count(Kind::Click), 0);
        assert_eq!(bus.listener_count(Kind::Load), 0);
    }
}
