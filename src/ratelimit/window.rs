//! Sliding window limiters.
//!
//! A sliding window admits at most `rate` calls within any trailing span of
//! `window`. The local limiter keeps admitted timestamps in a bounded queue
//! guarded by a mutex; the shared limiter keeps them in a store and relies on
//! the store to evaluate the window atomically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::clock::{window_start, Clock, SystemClock};
use super::queue::{ArrayQueue, BoundedQueue};
use crate::error::Result;
use crate::store::SharedCounterStore;

/// A sliding window kept in process memory.
///
/// The queue capacity is the number of calls admitted per window. The key
/// passed to `limit` is ignored; each instance tracks one window.
pub struct LocalSlidingWindowLimiter<Q = ArrayQueue> {
    window: Duration,
    queue: Mutex<Q>,
    clock: Arc<dyn Clock>,
}

impl LocalSlidingWindowLimiter<ArrayQueue> {
    /// Create a limiter admitting `rate` calls per `window`.
    pub fn new(window: Duration, rate: usize) -> Self {
        Self::with_queue(window, ArrayQueue::new(rate))
    }
}

impl<Q: BoundedQueue> LocalSlidingWindowLimiter<Q> {
    /// Create a limiter over a caller-provided queue. The queue's capacity
    /// sets the rate.
    pub fn with_queue(window: Duration, queue: Q) -> Self {
        Self {
            window,
            queue: Mutex::new(queue),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replace the wall clock with another time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Consume the limiter and return its queue.
    pub fn into_queue(self) -> Q {
        self.queue.into_inner()
    }

    /// Check and record one call. Returns `true` when limited.
    fn check(&self) -> bool {
        let mut queue = self.queue.lock();
        let now = self.clock.now();

        if !queue.is_full() {
            let _ = queue.enqueue(now);
            return false;
        }

        if let Some(start) = window_start(now, self.window) {
            let mut expired = 0usize;
            while let Ok(first) = queue.peek() {
                if first >= start {
                    break;
                }
                let _ = queue.dequeue();
                expired += 1;
            }

            if expired > 0 {
                trace!(expired, window = ?self.window, "Evicted expired window entries");
            }
        }

        if !queue.is_full() {
            let _ = queue.enqueue(now);
            return false;
        }

        debug!(window = ?self.window, "Sliding window limit exceeded");
        true
    }
}

impl<Q> std::fmt::Debug for LocalSlidingWindowLimiter<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSlidingWindowLimiter")
            .field("window", &self.window)
            .finish()
    }
}

#[async_trait]
impl<Q: BoundedQueue> Limiter for LocalSlidingWindowLimiter<Q> {
    async fn limit(&self, _key: &str) -> Result<bool> {
        Ok(self.check())
    }
}

/// A sliding window kept in a shared store under the caller's key.
///
/// Eviction, counting and recording happen in one store call, so callers in
/// different processes cannot both take the last slot of a window.
pub struct SharedSlidingWindowLimiter {
    window: Duration,
    rate: u64,
    store: Arc<dyn SharedCounterStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SharedSlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSlidingWindowLimiter")
            .field("window", &self.window)
            .field("rate", &self.rate)
            .finish()
    }
}

impl SharedSlidingWindowLimiter {
    /// Create a limiter admitting `rate` calls per `window` for each key.
    ///
    /// For example `SharedSlidingWindowLimiter::new(store, Duration::from_secs(1), 3000)`
    /// allows 3000 calls per second per key.
    pub fn new(store: Arc<dyn SharedCounterStore>, window: Duration, rate: u64) -> Self {
        Self {
            window,
            rate,
            store,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replace the wall clock with another time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the number of calls admitted per window.
    pub fn rate(&self) -> u64 {
        self.rate
    }
}

#[async_trait]
impl Limiter for SharedSlidingWindowLimiter {
    async fn limit(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let admitted = self
            .store
            .slide_window(key, self.window, self.rate, now)
            .await?;

        if !admitted {
            debug!(
                key = %key,
                window = ?self.window,
                rate = self.rate,
                "Shared sliding window limit exceeded"
            );
        }

        Ok(!admitted)
    }
}
