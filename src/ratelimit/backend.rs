//! Limiter traits shared by every admission algorithm.

use async_trait::async_trait;

use crate::error::Result;

/// Trait for limiter implementations.
///
/// This trait abstracts over local and store-backed limiters so request
/// handling code can hold any of them behind one type.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Decide whether a unit of work for `key` must be held back.
    ///
    /// `Ok(true)` means limited, `Ok(false)` means admitted. On `Err` the
    /// decision is the one given by [`LimiterError::implies_limited`].
    ///
    /// [`LimiterError::implies_limited`]: crate::error::LimiterError::implies_limited
    async fn limit(&self, key: &str) -> Result<bool>;
}

/// A limiter that counts work in flight.
///
/// Every `limit` call, admitted or not, must be paired with one `decr` once
/// the work is done.
#[async_trait]
pub trait ActiveLimiter: Limiter {
    /// Release one unit of in-flight work for `key`.
    async fn decr(&self, key: &str) -> Result<()>;
}
