//! Hardware backings.
//!
//! A [`HardwareBacking`] is the only thing a scheduler talks to when it
//! dispatches. It is built once, moved into the scheduler that owns the bus,
//! and handed back when that scheduler stops.
//!
//! - [`SimulatedBacking`]: journals every output, serves reads from fed input.
//! - [`RetryingBacking`]: drives a raw [`Transport`] with bounded retries.
//! - [`Loopback`]: in-memory serial transport for tests and benches.

mod loopback;
mod retry;
mod simulated;

pub use loopback::Loopback;
pub use retry::{HardwareError, RetryPolicy, RetryingBacking, Transport};
pub use simulated::{HardwareEvent, Journal, SimulatedBacking};

use crate::protocol::{Connection, LaneId, MAX_LANES};
use crate::timing::Blocker;

/// Raw bus access plus the lane-level blocking the scheduler relies on.
pub trait HardwareBacking: Send {
    fn write(&mut self, address: i32, payload: &[u8]);

    /// Reads up to `length` bytes; empty when nothing is available.
    fn read(&mut self, address: i32, length: usize) -> Vec<u8>;

    fn now_ms(&self) -> i64;

    fn now_ns(&self) -> i64;

    /// Returns `true` while `lane` sits out a [`block_channel_until`].
    ///
    /// [`block_channel_until`]: HardwareBacking::block_channel_until
    fn is_channel_blocked(&self, lane: LaneId) -> bool;

    fn block_channel_until(&mut self, lane: LaneId, time_ms: i64);

    /// Lifts every lane block whose deadline is at or before `now_ms`.
    fn release_channel_blocks(&mut self, now_ms: i64);

    fn digital_write(&mut self, connection: Connection, value: i32) {
        self.write(connection.address(), &value.to_be_bytes());
    }

    fn analog_write(&mut self, connection: Connection, value: i32) {
        self.write(connection.address(), &value.to_be_bytes());
    }
}

/// Lane block bookkeeping shared by the bundled backings.
pub struct ChannelBlocks {
    blocker: Blocker<LaneId>,
}

impl ChannelBlocks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocker: Blocker::new(MAX_LANES),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_blocked(&self, lane: LaneId) -> bool {
        self.blocker.contains(lane)
    }

    #[inline]
    pub fn block_until(&mut self, lane: LaneId, time_ms: i64) {
        self.blocker.block(lane, time_ms);
    }

    pub fn release(&mut self, now_ms: i64) {
        while self.blocker.next_released(now_ms).is_some() {}
    }
}

impl Default for ChannelBlocks {
    fn default() -> Self {
        Self::new()
    }
}
