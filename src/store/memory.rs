//! In-process shared store.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{SharedCounterStore, StoreError};
use crate::ratelimit::window_start;

/// Admitted timestamps for one key, sorted oldest first.
#[derive(Debug, Default)]
struct KeyWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    /// Window length of the most recent call on this key
    window: Duration,
}

impl KeyWindow {
    /// Drop every timestamp strictly older than `now - window`.
    fn evict(&mut self, now: DateTime<Utc>) {
        if let Some(start) = window_start(now, self.window) {
            while self.timestamps.front().is_some_and(|first| *first < start) {
                self.timestamps.pop_front();
            }
        }
    }

    /// Record `at`, keeping the timestamps sorted even when callers' clocks disagree.
    fn record(&mut self, at: DateTime<Utc>) {
        let index = self.timestamps.partition_point(|t| *t <= at);
        self.timestamps.insert(index, at);
    }
}

/// A [`SharedCounterStore`] kept in process memory.
///
/// Wrap it in an `Arc` to share one store between many limiters and tasks.
/// Each operation holds the shard lock of its key for the whole
/// read-modify-write, so concurrent callers on the same key are serialized.
///
/// Counters are forgotten when they return to zero. Windows whose entries
/// have all expired are kept until the next call on their key or until
/// [`purge_expired`](Self::purge_expired) sweeps them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Active-request counters by key, zero counters are not stored
    counters: DashMap<String, i64>,
    /// Admitted timestamps by key
    windows: DashMap<String, KeyWindow>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value for `key`.
    pub fn counter(&self, key: &str) -> i64 {
        self.counters.get(key).map(|value| *value).unwrap_or(0)
    }

    /// Number of timestamps currently recorded in the window at `key`.
    pub fn window_len(&self, key: &str) -> usize {
        self.windows
            .get(key)
            .map(|window| window.timestamps.len())
            .unwrap_or(0)
    }

    /// Number of keys holding state, counters and windows together.
    pub fn key_count(&self) -> usize {
        self.counters.len() + self.windows.len()
    }

    /// Drop every window with no timestamp left inside it as of `now`.
    ///
    /// Returns how many keys were removed. Run it periodically when keys are
    /// short-lived (per user or per address) to bound memory.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.evict(now);
            !window.timestamps.is_empty()
        });
        let purged = before.saturating_sub(self.windows.len());

        if purged > 0 {
            debug!(purged, "Purged expired shared windows");
        }
        purged
    }

    /// Drop all counters and windows.
    ///
    /// This is primarily useful for testing.
    pub fn reset(&self) {
        self.counters.clear();
        self.windows.clear();
    }

    fn add(&self, key: &str, delta: i64) -> i64 {
        let value = {
            let mut value = self.counters.entry(key.to_string()).or_insert(0);
            *value += delta;
            *value
        };

        if value == 0 {
            // Checked again under the shard lock, a concurrent change keeps the key
            self.counters.remove_if(key, |_, current| *current == 0);
        }
        value
    }
}

#[async_trait]
impl SharedCounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.add(key, 1))
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.add(key, -1))
    }

    async fn slide_window(
        &self,
        key: &str,
        window: Duration,
        rate: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (admitted, recorded) = {
            let mut state = self.windows.entry(key.to_string()).or_default();
            state.window = window;
            state.evict(now);

            let admitted = (state.timestamps.len() as u64) < rate;
            if admitted {
                state.record(now);
            }
            (admitted, state.timestamps.len())
        };

        if recorded == 0 {
            self.windows.remove_if(key, |_, state| state.timestamps.is_empty());
        }

        trace!(
            key = %key,
            recorded = recorded,
            admitted = admitted,
            "Evaluated shared window"
        );

        Ok(admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let store = MemoryStore::new();

        assert_eq!(store.increment("k").await.unwrap(), 1);
        assert_eq!(store.increment("k").await.unwrap(), 2);
        assert_eq!(store.decrement("k").await.unwrap(), 1);
        assert_eq!(store.counter("k"), 1);
        assert_eq!(store.counter("missing"), 0);
    }

    #[tokio::test]
    async fn test_decrement_goes_negative() {
        let store = MemoryStore::new();

        assert_eq!(store.decrement("k").await.unwrap(), -1);
        assert_eq!(store.counter("k"), -1);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_counter_at_zero_is_forgotten() {
        let store = MemoryStore::new();

        for key in ["user:1", "user:2", "user:3"] {
            store.increment(key).await.unwrap();
            store.decrement(key).await.unwrap();
        }

        assert_eq!(store.key_count(), 0);
        // A forgotten key starts again from zero
        assert_eq!(store.increment("user:1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("shared").await.unwrap() })
            })
            .collect();

        let mut seen: Vec<i64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        seen.sort_unstable();

        assert_eq!(seen, (1..=64).collect::<Vec<_>>());
        assert_eq!(store.counter("shared"), 64);
    }

    #[tokio::test]
    async fn test_slide_window_admits_up_to_rate() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(500);
        let now = at(1_000_000);

        assert!(store.slide_window("k", window, 2, now).await.unwrap());
        assert!(store.slide_window("k", window, 2, now).await.unwrap());
        assert!(!store.slide_window("k", window, 2, now).await.unwrap());
        assert_eq!(store.window_len("k"), 2);
    }

    #[tokio::test]
    async fn test_slide_window_evicts_expired() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(500);

        assert!(store.slide_window("k", window, 1, at(1_000_000)).await.unwrap());
        assert!(!store.slide_window("k", window, 1, at(1_000_200)).await.unwrap());
        assert!(store.slide_window("k", window, 1, at(1_000_510)).await.unwrap());
        assert_eq!(store.window_len("k"), 1);
    }

    #[tokio::test]
    async fn test_slide_window_evicts_out_of_order_entries() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);

        // A caller with a lagging clock records an older instant second
        assert!(store.slide_window("k", window, 2, at(105_000)).await.unwrap());
        assert!(store.slide_window("k", window, 2, at(100_000)).await.unwrap());

        // Window now starts at 101s: the 100s entry is gone, 105s stays
        assert!(store.slide_window("k", window, 2, at(111_000)).await.unwrap());
        assert_eq!(store.window_len("k"), 2);
        assert!(!store.slide_window("k", window, 2, at(111_000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_slide_window_keeps_entry_at_window_start() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(500);

        assert!(store.slide_window("k", window, 1, at(1_000_000)).await.unwrap());
        // Exactly `window` later the first entry sits on the boundary and stays
        assert!(!store.slide_window("k", window, 1, at(1_000_500)).await.unwrap());
    }

    #[tokio::test]
    async fn test_slide_window_keys_are_independent() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(1);
        let now = at(1_000_000);

        assert!(store.slide_window("foo", window, 1, now).await.unwrap());
        assert!(store.slide_window("bar", window, 1, now).await.unwrap());
        assert!(!store.slide_window("foo", window, 1, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired_windows() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(1);

        for key in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            store.slide_window(key, window, 5, at(1_000_000)).await.unwrap();
        }
        store.slide_window("10.0.0.4", window, 5, at(1_001_500)).await.unwrap();
        assert_eq!(store.key_count(), 4);

        assert_eq!(store.purge_expired(at(1_002_000)), 3);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.window_len("10.0.0.4"), 1);
    }

    #[tokio::test]
    async fn test_zero_rate_window_keeps_no_key() {
        let store = MemoryStore::new();

        assert!(!store.slide_window("k", Duration::from_secs(1), 0, at(0)).await.unwrap());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_reset() {
        let store = MemoryStore::new();
        store.increment("k").await.unwrap();
        store
            .slide_window("w", Duration::from_secs(1), 5, at(0))
            .await
            .unwrap();

        store.reset();

        assert_eq!(store.counter("k"), 0);
        assert_eq!(store.window_len("w"), 0);
    }
}
