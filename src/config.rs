//! Configuration management for limitkit.
//!
//! A limiter is described by a small YAML document tagged with its `kind`:
//!
//! ```yaml
//! kind: sliding_window
//! window_ms: 1000
//! rate: 3000
//! shared: true
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    ActiveLimiter, BucketLimiter, Limiter, LocalActiveLimiter, LocalSlidingWindowLimiter,
    SharedActiveLimiter, SharedSlidingWindowLimiter,
};
use crate::store::SharedCounterStore;

/// Definition of a single limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterConfig {
    /// Caps requests in flight
    Active {
        max_active: i64,
        /// Keep the counter in the shared store
        #[serde(default)]
        shared: bool,
    },
    /// Adds a token every interval, bursting up to `capacity`
    TokenBucket { interval_ms: u64, capacity: usize },
    /// Admits one request per interval
    LeakyBucket { interval_ms: u64 },
    /// Admits `rate` requests in any trailing `window_ms`
    SlidingWindow {
        window_ms: u64,
        rate: u64,
        /// Keep the window in the shared store
        #[serde(default)]
        shared: bool,
    },
}

/// A limiter built from a [`LimiterConfig`].
///
/// The variants expose the extra operations of each family: `decr` for
/// active limiters and the replenishment lifecycle for buckets.
pub enum BuiltLimiter {
    Active(Arc<dyn ActiveLimiter>),
    Bucket(Arc<BucketLimiter>),
    Window(Arc<dyn Limiter>),
}

impl std::fmt::Debug for BuiltLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuiltLimiter::Active(_) => f.write_str("BuiltLimiter::Active"),
            BuiltLimiter::Bucket(bucket) => f.debug_tuple("BuiltLimiter::Bucket").field(bucket).finish(),
            BuiltLimiter::Window(_) => f.write_str("BuiltLimiter::Window"),
        }
    }
}

#[async_trait]
impl Limiter for BuiltLimiter {
    async fn limit(&self, key: &str) -> Result<bool> {
        match self {
            BuiltLimiter::Active(limiter) => limiter.limit(key).await,
            BuiltLimiter::Bucket(limiter) => limiter.limit(key).await,
            BuiltLimiter::Window(limiter) => limiter.limit(key).await,
        }
    }
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no limiter can run with.
    pub fn validate(&self) -> Result<()> {
        match *self {
            LimiterConfig::Active { max_active, .. } if max_active < 0 => Err(LimiterError::Config(
                format!("max_active must not be negative, got {}", max_active),
            )),
            LimiterConfig::TokenBucket { interval_ms: 0, .. }
            | LimiterConfig::LeakyBucket { interval_ms: 0 } => Err(LimiterError::Config(
                "interval_ms must be greater than zero".to_string(),
            )),
            LimiterConfig::SlidingWindow { window_ms: 0, .. } => Err(LimiterError::Config(
                "window_ms must be greater than zero".to_string(),
            )),
            LimiterConfig::SlidingWindow { rate: 0, .. } => Err(LimiterError::Config(
                "rate must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether the limiter keeps its state in the shared store.
    pub fn is_shared(&self) -> bool {
        matches!(
            self,
            LimiterConfig::Active { shared: true, .. } | LimiterConfig::SlidingWindow { shared: true, .. }
        )
    }

    /// Build the configured limiter. `store` is only used by shared limiters.
    pub fn build(&self, store: Arc<dyn SharedCounterStore>) -> Result<BuiltLimiter> {
        self.validate()?;

        let limiter = match *self {
            LimiterConfig::Active { max_active, shared: false } => {
                BuiltLimiter::Active(Arc::new(LocalActiveLimiter::new(max_active)))
            }
            LimiterConfig::Active { max_active, shared: true } => {
                BuiltLimiter::Active(Arc::new(SharedActiveLimiter::new(max_active, store)))
            }
            LimiterConfig::TokenBucket { interval_ms, capacity } => BuiltLimiter::Bucket(Arc::new(
                BucketLimiter::token_bucket(Duration::from_millis(interval_ms), capacity)?,
            )),
            LimiterConfig::LeakyBucket { interval_ms } => BuiltLimiter::Bucket(Arc::new(
                BucketLimiter::leaky_bucket(Duration::from_millis(interval_ms))?,
            )),
            LimiterConfig::SlidingWindow { window_ms, rate, shared: false } => {
                let rate = usize::try_from(rate)
                    .map_err(|_| LimiterError::Config(format!("rate {} is too large", rate)))?;
                BuiltLimiter::Window(Arc::new(LocalSlidingWindowLimiter::new(
                    Duration::from_millis(window_ms),
                    rate,
                )))
            }
            LimiterConfig::SlidingWindow { window_ms, rate, shared: true } => BuiltLimiter::Window(
                Arc::new(SharedSlidingWindowLimiter::new(store, Duration::from_millis(window_ms), rate)),
            ),
        };

        Ok(limiter)
    }
}
