//! Bounded FIFO of scheduled runs waiting for a worker.
//!
//! The scheduling loop pushes, workers pop. Both sides share the queue
//! through an `Arc`; all operations take the internal lock for their whole
//! duration.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

/// Errors returned by [`RunQueue`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("queue is full (capacity {0})")]
    Full(usize),

    /// There is nothing to pop.
    #[error("queue is empty")]
    Empty,

    /// Queue lock was poisoned.
    #[error("queue lock poisoned")]
    LockPoisoned,
}

/// A thread-safe FIFO with a fixed capacity.
#[derive(Debug)]
pub struct RunQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> RunQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an item at the back.
    ///
    /// Fails without modifying the queue when it is full.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        let mut items = self.items.lock().map_err(|_| QueueError::LockPoisoned)?;
        if items.len() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }
        items.push_back(item);
        Ok(())
    }

    /// Remove and return the oldest item.
    pub fn pop(&self) -> Result<T, QueueError> {
        let mut items = self.items.lock().map_err(|_| QueueError::LockPoisoned)?;
        items.pop_front().ok_or(QueueError::Empty)
    }

    /// Number of queued items.
    pub fn size(&self) -> usize {
        self.items
            .lock()
            .map(|items| items.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
