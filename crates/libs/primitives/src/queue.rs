//! Producer/consumer queue with optional backlog limit
//!
//! `enqueue` hands the item straight to the oldest waiting consumer if there
//! is one, buffers it if capacity remains, and otherwise suspends until a
//! `dequeue` makes room. `dequeue` takes the oldest buffered item or suspends
//! until one arrives. Both sides are FIFO.
//!
//! Dropping a pending `enqueue` withdraws its item. Dropping a pending
//! `dequeue` after an item was handed to it puts the item back at the front.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

type WaiterId = u64;

struct QueueState<T> {
    capacity: Option<usize>,
    items: VecDeque<T>,
    next_id: WaiterId,
    consumers: VecDeque<(WaiterId, oneshot::Sender<T>)>,
    producers: VecDeque<(WaiterId, T, oneshot::Sender<()>)>,
}

impl<T> QueueState<T> {
    fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.items.len() >= cap)
    }

    fn next_id(&mut self) -> WaiterId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Give `item` to the oldest live consumer, returning it if none is left
    fn hand_off(&mut self, mut item: T) -> Option<T> {
        while let Some((_, consumer)) = self.consumers.pop_front() {
            match consumer.send(item) {
                Ok(()) => return None,
                Err(back) => item = back,
            }
        }
        Some(item)
    }

    /// Take the next item, admitting the oldest suspended producer
    fn take(&mut self) -> Option<T> {
        let item = match self.items.pop_front() {
            Some(item) => item,
            None => {
                let (_, item, producer) = self.producers.pop_front()?;
                let _ = producer.send(());
                return Some(item);
            }
        };

        if !self.is_full() {
            if let Some((_, waiting, producer)) = self.producers.pop_front() {
                self.items.push_back(waiting);
                let _ = producer.send(());
            }
        }
        Some(item)
    }
}

/// Async FIFO queue, optionally bounded
pub struct AsyncQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> AsyncQueue<T> {
    /// Create a queue; `None` means no backlog limit
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                capacity,
                items: VecDeque::new(),
                next_id: 0,
                consumers: VecDeque::new(),
                producers: VecDeque::new(),
            })),
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity))
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().is_full()
    }

    /// Add an item, waiting for room if the queue is full
    pub async fn enqueue(&self, item: T) {
        let (id, rx) = {
            let mut state = self.state.lock();
            let Some(item) = state.hand_off(item) else {
                return;
            };
            if !state.is_full() {
                state.items.push_back(item);
                return;
            }
            let id = state.next_id();
            let (tx, rx) = oneshot::channel();
            state.producers.push_back((id, item, tx));
            (id, rx)
        };

        let mut pending = PendingProducer {
            state: self.state.clone(),
            id,
            done: false,
        };
        // Resolves once `take` admitted the item
        let _ = rx.await;
        pending.done = true;
    }

    /// Take an item without waiting
    pub fn try_dequeue(&self) -> Option<T> {
        self.state.lock().take()
    }

    /// Take the next item, waiting for one if the queue is empty
    pub async fn dequeue(&self) -> T {
        loop {
            let (id, rx) = {
                let mut state = self.state.lock();
                if let Some(item) = state.take() {
                    return item;
                }
                let id = state.next_id();
                let (tx, rx) = oneshot::channel();
                state.consumers.push_back((id, tx));
                (id, rx)
            };

            let mut pending = PendingConsumer {
                state: self.state.clone(),
                id,
                rx: Some(rx),
            };
            if let Some(item) = pending.recv().await {
                return item;
            }
        }
    }
}

struct PendingProducer<T> {
    state: Arc<Mutex<QueueState<T>>>,
    id: WaiterId,
    done: bool,
}

impl<T> Drop for PendingProducer<T> {
    fn drop(&mut self) {
        if !self.done {
            self.state.lock().producers.retain(|(id, _, _)| *id != self.id);
        }
    }
}

struct PendingConsumer<T> {
    state: Arc<Mutex<QueueState<T>>>,
    id: WaiterId,
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> PendingConsumer<T> {
    async fn recv(&mut self) -> Option<T> {
        let rx = self.rx.as_mut()?;
        let item = rx.await.ok();
        self.rx = None;
        item
    }
}

impl<T> Drop for PendingConsumer<T> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut state = self.state.lock();
        state.consumers.retain(|(id, _)| *id != self.id);
        rx.close();
        if let Ok(item) = rx.try_recv() {
            if let Some(item) = state.hand_off(item) {
                state.items.push_front(item);
            }
        }
    }
}
