//! Hierarchical cancellation scopes
//!
//! A [`Scope`] is a one-shot trigger with a list of cleanup callbacks.
//! Triggering is permanent and idempotent: the first [`Scope::trigger`] takes
//! the registered callbacks and runs each of them once, in registration order.
//! Child scopes derived with [`Scope::child`] trigger when their parent does,
//! and [`Scope::run_scoped`] wraps an async operation in a child scope that is
//! unlinked on success and triggered on failure.
//!
//! Cancellation is cooperative. Triggering never interrupts a pending future;
//! callbacks are expected to close sockets/transports so that the pending
//! operation observably fails. Code that wants to race against cancellation
//! can await [`Scope::triggered`].

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::error;

type Callback = Box<dyn FnOnce() + Send>;

struct Inner {
    state: Mutex<State>,
    fired: watch::Sender<bool>,
}

struct State {
    triggered: bool,
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

/// Cancellation scope handle
///
/// Cloning a `Scope` yields another handle to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Scope")
            .field("triggered", &state.triggered)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

impl Scope {
    /// Create a new, live scope
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    triggered: false,
                    next_id: 0,
                    callbacks: Vec::new(),
                }),
                fired,
            }),
        }
    }

    /// Whether this scope has been triggered
    pub fn is_triggered(&self) -> bool {
        self.inner.state.lock().triggered
    }

    /// Number of callbacks currently waiting for the trigger
    pub fn pending_callbacks(&self) -> usize {
        self.inner.state.lock().callbacks.len()
    }

    /// Register a callback to run when the scope triggers
    ///
    /// Registering on an already-triggered scope is a no-op: the callback is
    /// dropped without being invoked and the returned registration is detached.
    pub fn on_trigger<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        match self.try_register(Box::new(callback)) {
            Ok(registration) => registration,
            Err(_) => Registration::detached(),
        }
    }

    /// Register a release action, running it right away if the scope has
    /// already been triggered
    ///
    /// Use this for resources acquired while the scope may be triggering
    /// concurrently, so they are released either way.
    pub fn on_trigger_or_run<F>(&self, release: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        match self.try_register(Box::new(release)) {
            Ok(registration) => registration,
            Err(release) => {
                release();
                Registration::detached()
            }
        }
    }

    fn try_register(&self, callback: Callback) -> std::result::Result<Registration, Callback> {
        let mut state = self.inner.state.lock();
        if state.triggered {
            return Err(callback);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, callback));
        Ok(Registration {
            scope: Arc::downgrade(&self.inner),
            id: Some(id),
        })
    }

    /// Trigger the scope
    ///
    /// The first call runs every registered callback once, in registration
    /// order. Later calls do nothing. A panicking callback is logged and does
    /// not prevent the remaining callbacks from running.
    pub fn trigger(&self) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.triggered {
                return;
            }
            state.triggered = true;
            std::mem::take(&mut state.callbacks)
        };

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!(callback_id = id, "Cancellation callback panicked");
            }
        }

        self.inner.fired.send_replace(true);
    }

    /// Wait until the scope is triggered
    ///
    /// Resolves immediately if it already was.
    pub async fn triggered(&self) {
        let mut rx = self.inner.fired.subscribe();
        // The sender lives inside `self.inner`, so this only returns once fired.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// `Err(Error::Aborted)` once the scope has been triggered
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` until it completes or the scope triggers
    ///
    /// If the scope is already triggered, `fut` is never polled.
    pub async fn until_triggered<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.triggered() => Err(Error::Aborted),
            output = fut => Ok(output),
        }
    }

    /// Derive a child scope
    ///
    /// Triggering `self` triggers the child exactly once. Unregistering the
    /// returned link detaches the child from `self` without affecting the
    /// child's own triggerability. A child derived from an already-triggered
    /// scope starts out triggered.
    pub fn child(&self) -> (Scope, Registration) {
        let child = Scope::new();
        let link = child.clone();
        match self.try_register(Box::new(move || link.trigger())) {
            Ok(registration) => (child, registration),
            Err(_) => {
                child.trigger();
                (child, Registration::detached())
            }
        }
    }

    /// Run `f` inside a child scope
    ///
    /// On `Ok` the child is unlinked from `self` so later triggers of `self`
    /// no longer cascade into it. On `Err` (or if the returned future is
    /// dropped before completing) the child is triggered, releasing whatever
    /// `f` registered on it.
    pub async fn run_scoped<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let (child, link) = self.child();
        let mut guard = ScopedRun {
            child: child.clone(),
            link: Some(link),
            completed: false,
        };

        let result = f(child).await;
        match &result {
            Ok(_) => guard.finish(false),
            Err(_) => guard.finish(true),
        }
        result
    }
}

/// Unlinks or triggers a [`Scope::run_scoped`] child when the run ends
struct ScopedRun {
    child: Scope,
    link: Option<Registration>,
    completed: bool,
}

impl ScopedRun {
    fn finish(&mut self, trigger_child: bool) {
        self.completed = true;
        if let Some(link) = self.link.take() {
            link.unregister();
        }
        if trigger_child {
            self.child.trigger();
        }
    }
}

impl Drop for ScopedRun {
    fn drop(&mut self) {
        if !self.completed {
            self.finish(true);
        }
    }
}

/// Handle to a callback registered on a [`Scope`]
///
/// Dropping a registration leaves the callback in place; call
/// [`Registration::unregister`] to remove it.
#[derive(Debug)]
pub struct Registration {
    scope: Weak<Inner>,
    id: Option<u64>,
}

impl Registration {
    /// A registration that refers to nothing
    pub fn detached() -> Self {
        Self {
            scope: Weak::new(),
            id: None,
        }
    }

    /// Remove the callback if it has not run yet
    pub fn unregister(self) {
        let (Some(id), Some(inner)) = (self.id, self.scope.upgrade()) else {
            return;
        };
        inner.state.lock().callbacks.retain(|(cid, _)| *cid != id);
    }
}
