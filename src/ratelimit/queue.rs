//! Fixed-capacity FIFO of admission timestamps.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors returned by queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("queue is full")]
    Full,
}

/// A bounded first-in first-out queue of timestamps.
///
/// Only the FIFO contract matters to the sliding window; the backing
/// storage is up to the implementation.
pub trait BoundedQueue: Send {
    /// Append `at` to the back of the queue.
    fn enqueue(&mut self, at: DateTime<Utc>) -> Result<(), QueueError>;

    /// Remove and return the front entry.
    fn dequeue(&mut self) -> Result<DateTime<Utc>, QueueError>;

    /// Return the front entry without removing it.
    fn peek(&self) -> Result<DateTime<Utc>, QueueError>;

    /// Whether the queue holds as many entries as it can.
    fn is_full(&self) -> bool;
}

/// A [`BoundedQueue`] over a ring buffer.
#[derive(Debug, Clone)]
pub struct ArrayQueue {
    entries: VecDeque<DateTime<Utc>>,
    capacity: usize,
}

impl ArrayQueue {
    /// Create an empty queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BoundedQueue for ArrayQueue {
    fn enqueue(&mut self, at: DateTime<Utc>) -> Result<(), QueueError> {
        if self.is_full() {
            return Err(QueueError::Full);
        }
        self.entries.push_back(at);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<DateTime<Utc>, QueueError> {
        self.entries.pop_front().ok_or(QueueError::Empty)
    }

    fn peek(&self) -> Result<DateTime<Utc>, QueueError> {
        self.entries.front().copied().ok_or(QueueError::Empty)
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}
