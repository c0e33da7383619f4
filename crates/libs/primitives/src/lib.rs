//! Concurrency primitives for DH2D sessions
//!
//! Building blocks shared by the session transport and its consumers:
//!
//! - [`Scope`]: hierarchical, idempotent cancellation with cleanup callbacks
//! - [`EventBus`]: typed multicast publish/subscribe with synchronous dispatch
//! - [`Observable`]: a shared value that publishes every write
//! - [`AsyncMutex`]: FIFO-fair exclusive lock for async critical sections
//! - [`AsyncQueue`]: producer/consumer hand-off with an optional backlog limit
//! - [`SharedStream`]: an upstream started on the first subscriber and
//!   stopped after the last one leaves
//!
//! All primitives are runtime-agnostic except [`SharedStream`], which spawns
//! its start/stop transitions onto the current tokio runtime.
//!
//! # Example
//!
//! ```
//! use dh2d_primitives::{AsyncQueue, Scope};
//!
//! # tokio_test::block_on(async {
//! let scope = Scope::new();
//! let queue = AsyncQueue::bounded(8);
//! queue.enqueue("hello").await;
//! assert_eq!(scope.until_triggered(queue.dequeue()).await.unwrap(), "hello");
//!
//! // Cancellation wins over a consumer that would wait forever
//! scope.trigger();
//! assert!(scope.until_triggered(queue.dequeue()).await.unwrap_err().is_aborted());
//! # });
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod events;
pub mod mutex;
pub mod observable;
pub mod queue;
pub mod scope;
pub mod shared;

pub use error::{Error, Result};
pub use events::{EventBus, HandlerId, Subscription, Subscriptions, ValueEvent};
pub use mutex::{AsyncMutex, LockGuard};
pub use observable::Observable;
pub use queue::AsyncQueue;
pub use scope::{Registration, Scope};
pub use shared::{SharedStream, Upstream};
