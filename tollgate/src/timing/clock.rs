//! Time sources for hardware backings.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use minstant::Instant;

use crate::protocol::MS_TO_NS;

/// Monotonic time source.
pub trait Clock: Send {
    fn now_ns(&self) -> i64;

    #[inline]
    fn now_ms(&self) -> i64 {
        self.now_ns() / MS_TO_NS
    }
}

/// TSC-backed clock counting from its creation.
///
/// Clones share the anchor, so a producer holding a clone computes deadlines
/// on the same time line as the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_ns(&self) -> i64 {
        i64::try_from(self.anchor.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Test clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ns: Arc<AtomicI64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ns: Arc::new(AtomicI64::new(start_ms * MS_TO_NS)),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance_ns(ms * MS_TO_NS);
    }

    pub fn advance_ns(&self, ns: i64) {
        self.now_ns.fetch_add(ns, Ordering::AcqRel);
    }

    pub fn set_ms(&self, ms: i64) {
        self.now_ns.store(ms * MS_TO_NS, Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ns(&self) -> i64 {
        self.now_ns.load(Ordering::Acquire)
    }
}
