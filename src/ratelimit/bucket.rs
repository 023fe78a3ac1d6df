//! Token bucket and leaky bucket limiters.
//!
//! Both algorithms share one engine: a background task adds a token to a
//! bounded buffer every `interval`, and callers take tokens out. A token
//! bucket lets up to `capacity` tokens pile up, allowing bursts. A leaky
//! bucket keeps a single outstanding token, spacing admissions one per
//! interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify, Semaphore, SemaphorePermit, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::backend::Limiter;
use crate::error::{LimiterError, Result};

/// A bucket limiter fed by a replenishment task.
///
/// The task is launched once with [`BucketLimiter::start`] (or by driving
/// [`BucketLimiter::put`] on a task of your own) and runs until
/// [`BucketLimiter::close`]. A closed bucket never admits traffic again.
#[derive(Debug)]
pub struct BucketLimiter {
    /// Time between two replenishments
    interval: Duration,
    /// Configured burst size, zero for a leaky bucket
    capacity: usize,
    /// Unconsumed tokens
    tokens: Semaphore,
    /// Signalled whenever a caller takes a token
    freed: Notify,
    /// Flips to `true` once, on close
    closed: watch::Sender<bool>,
    closing: AtomicBool,
    started: AtomicBool,
}

impl BucketLimiter {
    /// Create a token bucket holding up to `capacity` tokens, adding one
    /// every `interval`.
    pub fn token_bucket(interval: Duration, capacity: usize) -> Result<Self> {
        Self::new(interval, capacity)
    }

    /// Create a leaky bucket admitting one request every `interval`.
    pub fn leaky_bucket(interval: Duration) -> Result<Self> {
        Self::new(interval, 0)
    }

    fn new(interval: Duration, capacity: usize) -> Result<Self> {
        if interval.is_zero() {
            return Err(LimiterError::Config(
                "bucket interval must be greater than zero".to_string(),
            ));
        }

        let (closed, _) = watch::channel(false);
        Ok(Self {
            interval,
            capacity,
            tokens: Semaphore::new(0),
            freed: Notify::new(),
            closed,
            closing: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    /// Get the replenishment interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Get the configured burst size (zero for a leaky bucket).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens ready to be taken.
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.tokens.is_closed()
    }

    /// Spawn the replenishment task on the current tokio runtime.
    ///
    /// The task holds a clone of the `Arc` until the bucket is closed, so a
    /// started bucket is only freed after [`close`](Self::close) (or
    /// [`ReplenishHandle::stop`]), even when every other reference is gone.
    ///
    /// Fails with [`LimiterError::AlreadyStarted`] if the task was already
    /// launched through `start` or `put`.
    pub fn start(self: &Arc<Self>) -> Result<ReplenishHandle> {
        self.claim()?;

        let limiter = Arc::clone(self);
        let task = tokio::spawn(async move { limiter.replenish().await });

        Ok(ReplenishHandle {
            limiter: Arc::clone(self),
            task,
        })
    }

    /// Run the replenishment loop on the calling task until the bucket is closed.
    ///
    /// One token is supplied immediately, then one per interval. Supplying
    /// waits while the buffer is full rather than dropping the token.
    pub async fn put(&self) -> Result<()> {
        self.claim()?;
        self.replenish().await;
        Ok(())
    }

    /// Close the bucket.
    ///
    /// Stops the replenishment task and fails every pending and future
    /// acquisition with [`LimiterError::Closed`]. Only the first call has an
    /// effect; it returns `true`, later calls return `false`.
    pub fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.tokens.close();
        self.closed.send_replace(true);
        info!(interval = ?self.interval, capacity = self.capacity, "Bucket limiter closed");
        true
    }

    /// Wait for a token for at most `timeout`.
    ///
    /// Returns `Ok(false)` once a token is taken, [`LimiterError::Cancelled`]
    /// if the timeout lapses first, and [`LimiterError::Closed`] if the
    /// bucket is closed while waiting.
    pub async fn block_limit(&self, key: &str, timeout: Duration) -> Result<bool> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.block_limit_until(key, deadline).await,
            None => self.acquire().await,
        }
    }

    /// Wait for a token until `deadline`.
    ///
    /// Dropping the returned future abandons the wait without consuming a token.
    pub async fn block_limit_until(&self, key: &str, deadline: Instant) -> Result<bool> {
        match time::timeout_at(deadline, self.acquire()).await {
            Ok(decision) => decision,
            Err(_) => {
                debug!(key = %key, "Deadline elapsed waiting for a bucket token");
                Err(LimiterError::Cancelled)
            }
        }
    }

    async fn acquire(&self) -> Result<bool> {
        match self.tokens.acquire().await {
            Ok(permit) => {
                self.consume(permit);
                Ok(false)
            }
            Err(_) => Err(LimiterError::Closed),
        }
    }

    fn consume(&self, permit: SemaphorePermit<'_>) {
        permit.forget();
        self.freed.notify_one();
    }

    fn claim(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LimiterError::AlreadyStarted);
        }
        Ok(())
    }

    /// Most tokens the buffer may hold. A leaky bucket still needs one slot
    /// to hand its single token over.
    fn slots(&self) -> usize {
        self.capacity.max(1)
    }

    async fn replenish(&self) {
        let mut closed = self.closed.subscribe();
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.interval, capacity = self.capacity, "Replenishment task started");

        loop {
            // The first tick completes immediately
            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break,
                _ = ticker.tick() => {}
            }

            if !self.supply(&mut closed).await {
                break;
            }
        }

        info!(interval = ?self.interval, "Replenishment task stopped");
    }

    /// Add one token, waiting for room. Returns `false` if the bucket closed first.
    async fn supply(&self, closed: &mut watch::Receiver<bool>) -> bool {
        loop {
            if self.tokens.is_closed() {
                return false;
            }

            // Only this task adds tokens, so the room seen here cannot shrink
            if self.tokens.available_permits() < self.slots() {
                self.tokens.add_permits(1);
                trace!(available = self.tokens.available_permits(), "Supplied bucket token");
                return true;
            }

            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return false,
                _ = self.freed.notified() => {}
            }
        }
    }
}

#[async_trait]
impl Limiter for BucketLimiter {
    /// Take a token if one is ready, without waiting.
    async fn limit(&self, key: &str) -> Result<bool> {
        match self.tokens.try_acquire() {
            Ok(permit) => {
                self.consume(permit);
                Ok(false)
            }
            Err(TryAcquireError::Closed) => Err(LimiterError::Closed),
            Err(TryAcquireError::NoPermits) => {
                trace!(key = %key, "No bucket token available");
                Ok(true)
            }
        }
    }
}

/// Owned handle to a running replenishment task.
///
/// Dropping the handle leaves the task running, and the task keeps the
/// bucket alive. Call [`stop`](Self::stop) or [`BucketLimiter::close`] to
/// release both.
#[derive(Debug)]
pub struct ReplenishHandle {
    limiter: Arc<BucketLimiter>,
    task: JoinHandle<()>,
}

impl ReplenishHandle {
    /// The bucket this task feeds.
    pub fn limiter(&self) -> &Arc<BucketLimiter> {
        &self.limiter
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the bucket and wait for the task to exit.
    pub async fn stop(self) -> Result<()> {
        self.limiter.close();
        self.task.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let err = BucketLimiter::token_bucket(Duration::ZERO, 2).unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
        assert!(BucketLimiter::leaky_bucket(Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 2).unwrap());
        let handle = bucket.start().unwrap();

        // Let the bucket fill up to its capacity
        time::sleep(ms(25)).await;
        assert_eq!(bucket.available(), 2);

        assert!(!bucket.limit("").await.unwrap());
        assert!(!bucket.limit("").await.unwrap());
        assert!(bucket.limit("").await.unwrap());

        time::sleep(ms(11)).await;
        assert!(!bucket.limit("").await.unwrap());

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_capacity_bounds_tokens() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 3).unwrap());
        let handle = bucket.start().unwrap();

        time::sleep(ms(200)).await;
        assert_eq!(bucket.available(), 3);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_block_limit() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 2).unwrap());
        let handle = bucket.start().unwrap();

        time::sleep(ms(2)).await;
        assert!(!bucket.block_limit("", ms(100)).await.unwrap());

        // Waits for the 10ms token
        assert!(!bucket.block_limit("", ms(100)).await.unwrap());

        let err = bucket.block_limit("", ms(5)).await.unwrap_err();
        assert!(matches!(err, LimiterError::Cancelled));
        assert!(err.implies_limited());

        assert!(!bucket.block_limit("", ms(100)).await.unwrap());

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_share_supplied_tokens() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 1).unwrap());
        let handle = bucket.start().unwrap();

        let waiters: Vec<_> = (0..20)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::spawn(async move { bucket.block_limit("", ms(45)).await })
            })
            .collect();

        let results: Vec<_> = futures::future::join_all(waiters)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        // Tokens arrive at 0, 10, 20, 30 and 40ms, each taken by exactly one waiter
        let admitted = results.iter().filter(|r| matches!(r, Ok(false))).count();
        let cancelled = results
            .iter()
            .filter(|r| matches!(r, Err(LimiterError::Cancelled)))
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(cancelled, 15);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaky_bucket_one_per_interval() {
        let origin = Instant::now();
        let bucket = Arc::new(BucketLimiter::leaky_bucket(ms(20)).unwrap());
        let handle = bucket.start().unwrap();

        for window in 0..5u64 {
            time::sleep_until(origin + ms(20 * window + 1)).await;
            assert!(!bucket.limit("").await.unwrap(), "window {} should admit", window);
            assert!(bucket.limit("").await.unwrap(), "window {} should limit", window);
        }

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaky_bucket_block_limit() {
        let bucket = Arc::new(BucketLimiter::leaky_bucket(ms(20)).unwrap());
        let handle = bucket.start().unwrap();

        time::sleep(ms(2)).await;
        assert!(!bucket.block_limit("", ms(100)).await.unwrap());

        let err = bucket.block_limit("", ms(5)).await.unwrap_err();
        assert!(matches!(err, LimiterError::Cancelled));

        assert!(!bucket.block_limit("", ms(100)).await.unwrap());
        assert!(bucket.limit("").await.unwrap());

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_bucket_rejects_everything() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 2).unwrap());
        let handle = bucket.start().unwrap();
        time::sleep(ms(25)).await;

        assert!(bucket.close());
        assert!(bucket.is_closed());

        // Closure wins even though tokens are still buffered
        let err = bucket.limit("").await.unwrap_err();
        assert!(matches!(err, LimiterError::Closed));
        assert!(!err.implies_limited());

        let err = bucket.block_limit("", ms(100)).await.unwrap_err();
        assert!(matches!(err, LimiterError::Closed));

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bucket = BucketLimiter::leaky_bucket(ms(20)).unwrap();

        assert!(bucket.close());
        assert!(!bucket.close());
        assert!(!bucket.close());
        assert!(matches!(bucket.limit("").await, Err(LimiterError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_blocked_caller() {
        let bucket = Arc::new(BucketLimiter::leaky_bucket(ms(20)).unwrap());

        let waiter = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.block_limit("", Duration::from_secs(60)).await })
        };

        time::sleep(ms(1)).await;
        bucket.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(LimiterError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_on_own_task() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 1).unwrap());

        let task = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.put().await })
        };

        time::sleep(ms(1)).await;
        assert!(!bucket.limit("").await.unwrap());

        bucket.close();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 1).unwrap());
        let handle = bucket.start().unwrap();

        assert!(matches!(bucket.start(), Err(LimiterError::AlreadyStarted)));
        assert!(matches!(bucket.put().await, Err(LimiterError::AlreadyStarted)));

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_before_start_supplies_nothing() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 2).unwrap());
        bucket.close();

        let handle = bucket.start().unwrap();
        time::sleep(ms(50)).await;

        assert!(handle.is_finished());
        assert_eq!(bucket.available(), 0);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_detached_task() {
        let bucket = Arc::new(BucketLimiter::token_bucket(ms(10), 2).unwrap());
        drop(bucket.start().unwrap());

        time::sleep(ms(25)).await;
        assert_eq!(Arc::strong_count(&bucket), 2);

        assert!(bucket.close());
        time::sleep(ms(1)).await;
        assert_eq!(Arc::strong_count(&bucket), 1);
    }
}
