//! Sub-granularity waits.
//!
//! Holds are split into whole polling granules, which go to a
//! [`Blocker`](super::Blocker), and a remainder the scheduler waits out on
//! the spot. The wait checks a cancellation flag on every iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use minstant::Instant;

use crate::protocol::MS_TO_NS;

/// How the scheduler thread burns a short wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// `spin_loop` hint; lowest latency, keeps the core busy.
    Spin,
    /// `thread::yield_now`; gives the core away between polls.
    #[default]
    Yield,
}

/// Splits holds and waits out remainders.
#[derive(Debug, Clone)]
pub struct Pacer {
    granularity_ns: i64,
    wait: WaitStrategy,
    cancel: Arc<AtomicBool>,
}

impl Pacer {
    /// # Panics
    ///
    /// Panics if `granularity_ms` is not positive.
    #[must_use]
    pub fn new(granularity_ms: i64, wait: WaitStrategy, cancel: Arc<AtomicBool>) -> Self {
        assert!(granularity_ms > 0, "polling granularity must be at least 1ms");
        Self {
            granularity_ns: granularity_ms * MS_TO_NS,
            wait,
            cancel,
        }
    }

    /// Splits `duration_ns` into whole granules (in ms) and a remainder (in ns).
    #[inline]
    #[must_use]
    pub const fn split(&self, duration_ns: i64) -> (i64, i64) {
        if duration_ns <= 0 {
            return (0, 0);
        }
        let granules = duration_ns / self.granularity_ns;
        let whole_ns = granules * self.granularity_ns;
        (whole_ns / MS_TO_NS, duration_ns - whole_ns)
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// One wait iteration, for callers polling on their own condition.
    #[inline]
    pub fn relax(&self) {
        match self.wait {
            WaitStrategy::Spin => std::hint::spin_loop(),
            WaitStrategy::Yield => std::thread::yield_now(),
        }
    }

    /// Waits `ns` nanoseconds of wall time.
    ///
    /// Returns `false` if the wait was cut short by cancellation.
    pub fn wait_ns(&self, ns: i64) -> bool {
        if ns <= 0 {
            return !self.is_cancelled();
        }
        let start = Instant::now();
        let ns = u128::try_from(ns).unwrap_or(0);
        loop {
            if self.is_cancelled() {
                return false;
            }
            if start.elapsed().as_nanos() >= ns {
                return true;
            }
            self.relax();
        }
    }
}
