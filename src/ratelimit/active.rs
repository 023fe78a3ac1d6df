//! Active-request (concurrency) limiters.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::{ActiveLimiter, Limiter};
use crate::error::{LimiterError, Result};
use crate::store::SharedCounterStore;

/// Limits the number of requests in flight within this process.
///
/// There is a single counter per instance; the key passed to `limit` and
/// `decr` is ignored.
#[derive(Debug)]
pub struct LocalActiveLimiter {
    /// Maximum number of requests allowed in flight
    max_active: i64,
    /// Requests currently in flight, negative after a misused `decr`
    count: AtomicI64,
}

impl LocalActiveLimiter {
    /// Create a limiter admitting at most `max_active` concurrent requests.
    pub fn new(max_active: i64) -> Self {
        Self {
            max_active,
            count: AtomicI64::new(0),
        }
    }

    /// Get the current number of requests in flight.
    pub fn active(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Get the limit for this limiter.
    pub fn max_active(&self) -> i64 {
        self.max_active
    }
}

#[async_trait]
impl Limiter for LocalActiveLimiter {
    async fn limit(&self, _key: &str) -> Result<bool> {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let limited = count > self.max_active;

        trace!(active = count, max_active = self.max_active, limited, "Checked active limit");

        Ok(limited)
    }
}

#[async_trait]
impl ActiveLimiter for LocalActiveLimiter {
    async fn decr(&self, _key: &str) -> Result<()> {
        let count = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if count < 0 {
            warn!(active = count, "Active counter dropped below zero");
            return Err(LimiterError::Misuse {
                limiter: "LocalActiveLimiter",
            });
        }
        Ok(())
    }
}

/// Limits requests in flight across every process sharing a store.
///
/// Counters live in the store under the caller's key, so two limiters built
/// over the same store and key enforce one combined limit.
pub struct SharedActiveLimiter {
    max_active: i64,
    store: Arc<dyn SharedCounterStore>,
}

impl std::fmt::Debug for SharedActiveLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedActiveLimiter")
            .field("max_active", &self.max_active)
            .finish()
    }
}

impl SharedActiveLimiter {
    /// Create a store-backed limiter admitting at most `max_active` concurrent
    /// requests per key.
    pub fn new(max_active: i64, store: Arc<dyn SharedCounterStore>) -> Self {
        Self { max_active, store }
    }

    /// Get the limit for this limiter.
    pub fn max_active(&self) -> i64 {
        self.max_active
    }
}

#[async_trait]
impl Limiter for SharedActiveLimiter {
    async fn limit(&self, key: &str) -> Result<bool> {
        let count = self.store.increment(key).await?;
        let limited = count > self.max_active;

        if limited {
            debug!(
                key = %key,
                active = count,
                max_active = self.max_active,
                "Shared active limit exceeded"
            );
        }

        Ok(limited)
    }
}

#[async_trait]
impl ActiveLimiter for SharedActiveLimiter {
    async fn decr(&self, key: &str) -> Result<()> {
        let count = self.store.decrement(key).await?;
        if count < 0 {
            warn!(key = %key, active = count, "Shared active counter dropped below zero");
            return Err(LimiterError::Misuse {
                limiter: "SharedActiveLimiter",
            });
        }
        Ok(())
    }
}
