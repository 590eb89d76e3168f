//! Closable FIFO queue shared between the serve loop and its callers.
//!
//! [`ClosableQueue`] is unbounded: `push` never waits. `pop` waits until an
//! item arrives or the queue is closed. Closing is the only cancellation
//! primitive: it discards pending items and wakes every waiter with a
//! uniform "closed" outcome.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An unbounded multi-producer, multi-consumer queue with explicit close.
#[derive(Debug)]
pub struct ClosableQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> ClosableQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item. Returns `false` (and drops the item) if the queue
    /// has been closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next item. Returns `None` once the queue is closed.
    ///
    /// Cancel-safe: an item is only removed from the queue in the same poll
    /// that returns it, so dropping the future never loses an item.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push or close between the check
            // and the await still wakes us.
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.items.pop_front() {
                    if !inner.items.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Close the queue. Idempotent. Pending items are discarded and every
    /// blocked `pop` returns `None`.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.items.clear();
        }
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of items waiting to be popped.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ClosableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
