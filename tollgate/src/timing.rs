//! Timing primitives: deadline registry, clocks and sub-millisecond pacing.

mod blocker;
mod clock;
mod pacer;

pub use blocker::{BlockKey, Blocker};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use pacer::{Pacer, WaitStrategy};
