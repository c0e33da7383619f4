//! Shared value with change notification

use crate::events::{EventBus, Subscription, ValueEvent};
use parking_lot::Mutex;
use std::sync::Arc;

/// A value whose every write is published to subscribers
///
/// Clones share the same value and subscriber list.
pub struct Observable<T> {
    value: Arc<Mutex<T>>,
    changes: EventBus<ValueEvent, T>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            changes: self.changes.clone(),
        }
    }
}

impl<T: Default + Clone + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
            changes: EventBus::new(),
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.value.lock().clone()
    }

    /// Replace the value and notify subscribers
    pub fn set(&self, value: T) {
        *self.value.lock() = value.clone();
        self.changes.emit(ValueEvent::Value, &value);
    }

    /// Modify the value in place and notify subscribers with the result
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let (result, snapshot) = {
            let mut value = self.value.lock();
            let result = f(&mut value);
            (result, value.clone())
        };
        self.changes.emit(ValueEvent::Value, &snapshot);
        result
    }

    /// Modify the value in place; subscribers are notified only when `f`
    /// reports a change
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        let snapshot = {
            let mut value = self.value.lock();
            if !f(&mut value) {
                return false;
            }
            value.clone()
        };
        self.changes.emit(ValueEvent::Value, &snapshot);
        true
    }

    /// Subscribe to writes
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.changes.on(ValueEvent::Value, handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes.listener_count(ValueEvent::Value)
    }
}
