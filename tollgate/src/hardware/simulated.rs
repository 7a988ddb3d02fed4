//! In-memory backing that records what a real bus would have seen.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ChannelBlocks, HardwareBacking};
use crate::protocol::{Connection, LaneId};
use crate::timing::Clock;

/// One output the backing performed, stamped with its clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    Digital {
        connection: Connection,
        value: i32,
        at_ns: i64,
    },
    Analog {
        connection: Connection,
        value: i32,
        at_ns: i64,
    },
    Write {
        address: i32,
        payload: Vec<u8>,
        at_ns: i64,
    },
}

impl HardwareEvent {
    #[must_use]
    pub const fn at_ns(&self) -> i64 {
        match self {
            Self::Digital { at_ns, .. } | Self::Analog { at_ns, .. } | Self::Write { at_ns, .. } => {
                *at_ns
            }
        }
    }

    /// Connection the event addressed, for pin and I2C outputs.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        match self {
            Self::Digital { connection, .. } | Self::Analog { connection, .. } => Some(*connection),
            Self::Write { address, .. } => u8::try_from(*address).ok().and_then(Connection::from_raw),
        }
    }
}

/// Shared, append-only log of [`HardwareEvent`]s.
///
/// Cloning yields another handle to the same log, so a test keeps one while the
/// backing moves onto a scheduler thread.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<HardwareEvent>>>,
}

impl Journal {
    fn lock(&self) -> MutexGuard<'_, Vec<HardwareEvent>> {
        // A panicking scheduler must not hide what it already dispatched.
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: HardwareEvent) {
        self.lock().push(event);
    }

    /// Snapshot of every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<HardwareEvent> {
        self.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Events addressed to `connection`, in dispatch order.
    #[must_use]
    pub fn for_connection(&self, connection: Connection) -> Vec<HardwareEvent> {
        self.lock()
            .iter()
            .filter(|event| event.connection() == Some(connection))
            .cloned()
            .collect()
    }

    /// Values written to `connection` by digital or analog sets.
    #[must_use]
    pub fn values(&self, connection: Connection) -> Vec<i32> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                HardwareEvent::Digital {
                    connection: c,
                    value,
                    ..
                }
                | HardwareEvent::Analog {
                    connection: c,
                    value,
                    ..
                } if *c == connection => Some(*value),
                _ => None,
            })
            .collect()
    }
}

/// Backing with no real bus behind it.
pub struct SimulatedBacking<C: Clock> {
    clock: C,
    journal: Journal,
    inputs: HashMap<i32, VecDeque<u8>>,
    lanes: ChannelBlocks,
}

impl<C: Clock> SimulatedBacking<C> {
    #[must_use]
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            journal: Journal::default(),
            inputs: HashMap::new(),
            lanes: ChannelBlocks::new(),
        }
    }

    /// Another handle to this backing's journal.
    #[must_use]
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    /// Queues bytes to be returned by later reads of `address`.
    pub fn feed(&mut self, address: i32, bytes: &[u8]) {
        self.inputs.entry(address).or_default().extend(bytes);
    }
}

impl<C: Clock> HardwareBacking for SimulatedBacking<C> {
    fn write(&mut self, address: i32, payload: &[u8]) {
        self.journal.record(HardwareEvent::Write {
            address,
            payload: payload.to_vec(),
            at_ns: self.clock.now_ns(),
        });
    }

    fn read(&mut self, address: i32, length: usize) -> Vec<u8> {
        match self.inputs.get_mut(&address) {
            Some(queue) => {
                let take = length.min(queue.len());
                queue.drain(..take).collect()
            }
            None => Vec::new(),
        }
    }

    #[inline]
    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    #[inline]
    fn now_ns(&self) -> i64 {
        self.clock.now_ns()
    }

    fn is_channel_blocked(&self, lane: LaneId) -> bool {
        self.lanes.is_blocked(lane)
    }

    fn block_channel_until(&mut self, lane: LaneId, time_ms: i64) {
        self.lanes.block_until(lane, time_ms);
    }

    fn release_channel_blocks(&mut self, now_ms: i64) {
        self.lanes.release(now_ms);
    }

    fn digital_write(&mut self, connection: Connection, value: i32) {
        self.journal.record(HardwareEvent::Digital {
            connection,
            value,
            at_ns: self.clock.now_ns(),
        });
    }

    fn analog_write(&mut self, connection: Connection, value: i32) {
        self.journal.record(HardwareEvent::Analog {
            connection,
            value,
            at_ns: self.clock.now_ns(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ManualClock;

    #[test]
    fn test_journal_records_in_order_with_timestamps() {
        let clock = ManualClock::new(0);
        let mut hw = SimulatedBacking::new(clock.clone());
        let journal = hw.journal();
        let pin = Connection::digital(5);

        hw.digital_write(pin, 1);
        clock.advance_ms(2);
        hw.digital_write(pin, 0);
        hw.analog_write(Connection::analog(1), 512);
        hw.write(0x04, &[9, 9]);

        assert_eq!(journal.len(), 4);
        assert_eq!(journal.values(pin), vec![1, 0]);
        assert_eq!(journal.values(Connection::analog(1)), vec![512]);

        let pin_events = journal.for_connection(pin);
        assert_eq!(pin_events[1].at_ns() - pin_events[0].at_ns(), 2_000_000);
        assert_eq!(journal.for_connection(Connection::i2c(4)).len(), 1);

        journal.clear();
        assert!(journal.is_empty());
    }

    #[test]
    fn test_reads_drain_fed_input() {
        let mut hw = SimulatedBacking::new(ManualClock::new(0));
        hw.feed(7, &[1, 2, 3]);

        assert_eq!(hw.read(7, 2), vec![1, 2]);
        assert_eq!(hw.read(7, 8), vec![3]);
        assert!(hw.read(7, 8).is_empty());
        assert!(hw.read(8, 8).is_empty());
    }

    #[test]
    fn test_lane_blocks() {
        let mut hw = SimulatedBacking::new(ManualClock::new(0));
        let lane = LaneId::new(0);

        hw.block_channel_until(lane, 5);
        assert!(hw.is_channel_blocked(lane));
        hw.release_channel_blocks(5);
        assert!(!hw.is_channel_blocked(lane));
    }
}
