//! Bounded FIFO of posted events.
//!
//! Producers (hardware callbacks, user commands) push from any thread and never
//! block: the mutex is only held for a `VecDeque` push. The state machine thread
//! is the single consumer and may block in [`EventQueue::wait_pop`] until an
//! event arrives, the next timer deadline passes, or the queue is closed.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use super::EventId;

/// Result of a blocking wait on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The next queued event.
    Event(EventId),
    /// The deadline passed with nothing queued.
    Timeout,
    /// The queue was closed and fully drained.
    Closed,
}

/// Reason a post was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostRejected {
    /// Queue at capacity.
    Full,
    /// Queue closed for shutdown.
    Closed,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<EventId>,
    closed: bool,
}

/// Mutex-guarded deque with a condvar for the consumer.
#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
}

impl EventQueue {
    /// Shared queue holding at most `capacity` events.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        })
    }

    /// Maximum number of queued events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append without blocking.
    pub fn push(&self, event: EventId) -> Result<(), PostRejected> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PostRejected::Closed);
        }
        if inner.items.len() >= self.capacity {
            return Err(PostRejected::Full);
        }
        inner.items.push_back(event);
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Take the oldest event without waiting.
    pub fn try_pop(&self) -> Option<EventId> {
        self.inner.lock().items.pop_front()
    }

    /// Block until an event is available, `deadline` passes, or the queue closes.
    ///
    /// Queued events are still delivered after `close()`; `Closed` is only
    /// returned once the queue is empty.
    pub fn wait_pop(&self, deadline: Option<Instant>) -> Wait {
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = inner.items.pop_front() {
                return Wait::Event(event);
            }
            if inner.closed {
                return Wait::Closed;
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut inner, deadline).timed_out() {
                        return match inner.items.pop_front() {
                            Some(event) => Wait::Event(event),
                            None => Wait::Timeout,
                        };
                    }
                }
                None => self.ready.wait(&mut inner),
            }
        }
    }

    /// Discard every queued event, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        dropped
    }

    /// Reject further pushes and wake the consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }

}
