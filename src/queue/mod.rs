//! Deduplicating, rate-limited work queue of object keys
//!
//! Semantics follow the classic controller work queue:
//!
//! - an item waiting in the queue is never added twice
//! - an item handed to a worker is never handed to a second worker until
//!   `done` is called for it; adds during processing are parked and the
//!   item is re-queued by `done`
//! - after `shut_down` no further `get` succeeds
//!
//! Failed items come back through [`WorkQueue::add_rate_limited`], which asks
//! the queue's [`RateLimiter`] how long to wait.

mod rate_limiter;

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

pub use rate_limiter::{
    default_controller_rate_limiter, BackoffConfig, BucketRateLimiter,
    ItemExponentialRateLimiter, MaxOfRateLimiter, RateLimiter,
};

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Work queue shared by the event handlers and the worker pool
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create a queue backed by the given rate limiter
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    /// Create a queue using [`default_controller_rate_limiter`]
    pub fn with_default_rate_limiter() -> Self {
        Self::new(default_controller_rate_limiter())
    }

    /// Mark an item as needing processing
    ///
    /// No-op if it is already waiting or the queue is shutting down. An item
    /// currently being processed is parked until `done` is called for it.
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(?item, "item in flight, parked until done");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue has been shut down. The caller must
    /// call [`WorkQueue::done`] when finished with the returned item.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking state so a concurrent add is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark an item as processed
    ///
    /// If it was added again while being processed it goes back on the queue.
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clear the rate limiter's failure history for an item
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    /// Number of times the item has been re-queued through the rate limiter
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Re-add an item after the rate limiter says it may run again
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Add an item once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns true when no item is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Returns true once `shut_down` has been called
    pub fn shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
