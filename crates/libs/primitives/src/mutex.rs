//! FIFO-fair exclusive lock for async critical sections
//!
//! Unlike `tokio::sync::Mutex` this lock guards no data; it only serializes
//! sections of async code. Waiters are granted the lock strictly in arrival
//! order, and a waiter whose `acquire` future is dropped never holds it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Exclusive async lock
#[derive(Clone)]
pub struct AsyncMutex {
    state: Arc<Mutex<LockState>>,
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AsyncMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncMutex")
            .field("locked", &state.locked)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Non-blocking poll of the lock state
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Wait for the lock
    ///
    /// The lock is held until the returned guard is released or dropped.
    pub async fn acquire(&self) -> LockGuard {
        let rx = {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return self.guard();
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            state: self.state.clone(),
            rx: Some(rx),
        };
        if let Some(rx) = waiter.rx.as_mut() {
            // The sender is only ever dropped after a failed hand-off to a
            // receiver that no longer exists, so this resolves with a grant.
            let _ = rx.await;
        }
        waiter.rx = None;
        self.guard()
    }

    fn guard(&self) -> LockGuard {
        LockGuard {
            state: self.state.clone(),
            released: false,
        }
    }
}

/// Hands the lock to the next live waiter, or unlocks
fn release(state: &Mutex<LockState>) {
    let mut state = state.lock();
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            return;
        }
    }
    state.locked = false;
}

/// Pending `acquire`; gives the lock back if it was granted after the
/// future stopped being polled
struct Waiter {
    state: Arc<Mutex<LockState>>,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                release(&self.state);
            }
        }
    }
}

/// Proof of lock ownership; releases on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    state: Arc<Mutex<LockState>>,
    released: bool,
}

impl LockGuard {
    /// Release the lock now
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            release(&self.state);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}
