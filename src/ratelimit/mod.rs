//! Admission limiters and their building blocks.

mod active;
mod backend;
mod bucket;
mod clock;
mod queue;
mod window;

pub use active::{LocalActiveLimiter, SharedActiveLimiter};
pub use backend::{ActiveLimiter, Limiter};
pub use bucket::{BucketLimiter, ReplenishHandle};
pub use clock::{window_start, Clock, ManualClock, SystemClock};
pub use queue::{ArrayQueue, BoundedQueue, QueueError};
pub use window::{LocalSlidingWindowLimiter, SharedSlidingWindowLimiter};
