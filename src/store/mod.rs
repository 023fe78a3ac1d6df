//! Shared counter store abstraction.
//!
//! Limiters that coordinate across processes keep their state in a store
//! reachable by every participant. This module defines the operations such a
//! store has to provide atomically, along with an in-process implementation
//! that can be shared between tasks.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors raised while talking to a shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// Operations a shared backend must execute atomically per key.
///
/// Every call is a single round trip. Implementations must make each of
/// them indivisible with respect to all other callers using the same key,
/// whichever process those callers live in.
#[async_trait]
pub trait SharedCounterStore: Send + Sync {
    /// Add one to the counter at `key` and return the new value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Subtract one from the counter at `key` and return the new value.
    async fn decrement(&self, key: &str) -> Result<i64, StoreError>;

    /// Evict timestamps at `key` older than `now - window`, then record `now`
    /// if fewer than `rate` remain.
    ///
    /// Returns `true` when `now` was recorded (the call is admitted).
    async fn slide_window(
        &self,
        key: &str,
        window: Duration,
        rate: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
