//! Reference-counted, lazily started shared stream
//!
//! A [`SharedStream`] wraps an expensive upstream (a polling loop, a
//! server-sent event request...) so that it runs only while at least one
//! subscriber exists. Subscribing and unsubscribing publish a
//! "listeners changed" notification; each notification schedules a
//! reconcile step that takes the stream's [`AsyncMutex`] and compares the
//! *current* subscriber count against the upstream state:
//!
//! - subscribers and no upstream: start one and forward its values
//! - no subscribers and a running upstream: stop it
//!
//! Because every reconcile step is serialized by the lock and reads the live
//! count, any burst of concurrent subscribe/unsubscribe calls converges to
//! at most one running upstream, and none once the count reaches zero.

use crate::error::Result;
use crate::events::{EventBus, HandlerId, Subscription, ValueEvent};
use crate::mutex::AsyncMutex;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

type StopFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type Factory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<Upstream<T>>> + Send + Sync>;

/// A started upstream: its value events and how to stop it
pub struct Upstream<T> {
    values: EventBus<ValueEvent, T>,
    stop: StopFn,
}

impl<T: 'static> Upstream<T> {
    pub fn new<F, Fut>(values: EventBus<ValueEvent, T>, stop: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            values,
            stop: Box::new(move || stop().boxed()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ListenerEvent {
    Changed,
}

struct Running {
    forward: Subscription,
    stop: StopFn,
}

struct Shared<T> {
    factory: Factory<T>,
    subscribers: EventBus<ValueEvent, T>,
    listeners_changed: EventBus<ListenerEvent, ()>,
    transition: AsyncMutex,
    running: Mutex<Option<Running>>,
    starts: Mutex<u64>,
}

/// Upstream shared by every subscriber, alive only while subscribed
pub struct SharedStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SharedStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> SharedStream<T> {
    /// Wrap `start`, which is invoked on each 0 → 1 subscriber transition
    pub fn new<F, Fut>(start: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Upstream<T>>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            factory: Box::new(move || start().boxed()),
            subscribers: EventBus::new(),
            listeners_changed: EventBus::new(),
            transition: AsyncMutex::new(),
            running: Mutex::new(None),
            starts: Mutex::new(0),
        });

        let weak: Weak<Shared<T>> = Arc::downgrade(&shared);
        // Lives as long as `shared`; never unsubscribed
        let _ = shared
            .listeners_changed
            .on(ListenerEvent::Changed, move |_| schedule_reconcile(&weak));

        Self { shared }
    }

    /// Subscribe to upstream values, starting the upstream if needed
    pub fn on_value<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let inner = self.shared.subscribers.on(ValueEvent::Value, handler);
        self.shared
            .listeners_changed
            .emit(ListenerEvent::Changed, &());

        let id = inner.id();
        let weak = Arc::downgrade(&self.shared);
        Subscription::from_fn(id, move || {
            inner.unsubscribe();
            if let Some(shared) = weak.upgrade() {
                shared.listeners_changed.emit(ListenerEvent::Changed, &());
            }
        })
    }

    /// Remove one subscriber (or all of them), stopping the upstream once
    /// none remain
    pub fn off_value(&self, handler: Option<HandlerId>) {
        self.shared.subscribers.off(ValueEvent::Value, handler);
        self.shared
            .listeners_changed
            .emit(ListenerEvent::Changed, &());
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.listener_count(ValueEvent::Value)
    }

    /// Whether an upstream is currently running
    pub fn is_running(&self) -> bool {
        self.shared.running.lock().is_some()
    }

    /// How many times the upstream has been started
    pub fn start_count(&self) -> u64 {
        *self.shared.starts.lock()
    }
}

fn schedule_reconcile<T: Send + 'static>(weak: &Weak<Shared<T>>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(reconcile(shared));
        }
        Err(_) => warn!("Shared stream subscriber change outside a tokio runtime; upstream not reconciled"),
    }
}

async fn reconcile<T: Send + 'static>(shared: Arc<Shared<T>>) {
    let _guard = shared.transition.acquire().await;

    let wanted = shared.subscribers.listener_count(ValueEvent::Value) > 0;
    let running = shared.running.lock().is_some();

    if wanted && !running {
        match (shared.factory)().await {
            Ok(upstream) => {
                let subscribers = shared.subscribers.clone();
                let forward = upstream
                    .values
                    .on(ValueEvent::Value, move |value| {
                        subscribers.emit(ValueEvent::Value, value)
                    });
                *shared.running.lock() = Some(Running {
                    forward,
                    stop: upstream.stop,
                });
                *shared.starts.lock() += 1;
                debug!("Shared stream upstream started");
            }
            Err(e) => warn!(error = %e, "Failed to start shared stream upstream"),
        }
    } else if !wanted && running {
        let stopped = shared.running.lock().take();
        if let Some(running) = stopped {
            running.forward.unsubscribe();
            (running.stop)().await;
            debug!("Shared stream upstream stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_is_retried_on_next_change() {
        let attempts = Arc::new(Mutex::new(0u32));
        let a = attempts.clone();
        let stream: SharedStream<u32> = SharedStream::new(move || {
            let a = a.clone();
            async move {
                *a.lock() += 1;
                Err(Error::Upstream("offline".to_string()))
            }
        });

        let first = stream.on_value(|_| {});
        settle().await;
        assert!(!stream.is_running());

        let _second = stream.on_value(|_| {});
        settle().await;
        assert_eq!(*attempts.lock(), 2);

        first.unsubscribe();
        settle().await;
        assert_eq!(stream.start_count(), 0);
    }
}
