//! Time sources for window-based limiters.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Source of the current time.
///
/// Limiters take a clock at construction so tests can pin or step time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock, read once and then advanced by a monotonic timer.
///
/// Steps of the system clock after construction (NTP corrections, manual
/// changes) never move this clock backwards, so timestamps it hands out to
/// one limiter are non-decreasing.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl SystemClock {
    /// Anchor the clock at the current wall time.
    pub fn new() -> Self {
        Self::anchored(Utc::now())
    }

    /// Anchor the clock at `origin`; it advances from there in real time.
    pub fn anchored(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.started.elapsed())
            .ok()
            .and_then(|elapsed| self.origin.checked_add_signed(elapsed))
            .unwrap_or(self.origin)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Create a clock frozen at the given Unix time in milliseconds.
    ///
    /// Returns `None` when the instant is outside chrono's range.
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self::new)
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Some(next) = TimeDelta::from_std(by)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
        {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// The oldest instant still inside a `window` ending at `now`.
///
/// Returns `None` when the window reaches past the representable range,
/// in which case nothing is old enough to expire.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    let window = TimeDelta::from_std(window).ok()?;
    now.checked_sub_signed(window)
}
