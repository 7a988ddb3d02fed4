//! Consumer side: the traffic-ordered scheduler that owns one bus.
//!
//! A scheduler holds one lane per command channel feeding its bus. Each lane
//! cycles through
//!
//! ```text
//! Idle --Release--> Counting --dispatch--> Draining --last fragment--> Done --Ack--> Idle
//! ```
//!
//! Every dispatched fragment, block fragments included, is one step of the
//! batch count. A block fragment registers a deadline for its connection, and
//! nothing addressed to the connection dispatches until it passes. If the
//! batch still has fragments left, the lane becomes the connection's resume
//! owner: when the deadline passes the owner is visited before any other
//! lane, then the connection is free again. Ownership never outlives the
//! deadline, so two batches holding each other's connections cannot stall.
//!
//! Lanes are visited in reverse index order and the starting lane moves by one
//! each pass.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::channel::{Consumer, Producer};
use crate::config::SchedulerConfig;
use crate::hardware::HardwareBacking;
use crate::pipeline::Bus;
use crate::protocol::{Connection, Fragment, Hold, LaneId, MAX_CONNECTIONS, Outcome, TrafficMessage};
use crate::timing::{Blocker, Pacer};
use crate::trace::{debug, error, info, trace};

/// Scheduler end of one lane.
pub(crate) struct LaneReader {
    pub lane: LaneId,
    pub data: Consumer<Fragment>,
    pub release: Consumer<TrafficMessage>,
    pub ack: Producer<TrafficMessage>,
}

/// Where a lane is in its batch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    /// Waiting for a release.
    Idle,
    /// Release read, nothing dispatched yet.
    Counting { remaining: u32 },
    /// Part of the batch dispatched.
    Draining { remaining: u32 },
    /// Batch dispatched; the ack is still owed.
    Done,
    /// The producer sent end-of-stream.
    Closed,
}

impl LaneState {
    const fn remaining(self) -> Option<u32> {
        match self {
            Self::Counting { remaining } | Self::Draining { remaining } => Some(remaining),
            _ => None,
        }
    }
}

struct Lane {
    reader: LaneReader,
    state: LaneState,
}

/// Why [`TrafficScheduler::run_for`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A pass found nothing to do and no connection comes free within the
    /// budget.
    Idle,
    /// The budget ran out while there was still work.
    BudgetExhausted,
    /// Every lane sent end-of-stream.
    Shutdown,
    /// The cancellation flag was raised.
    Cancelled,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub passes: u64,
    pub batches: u64,
    pub dispatched: u64,
    pub acks: u64,
}

/// Drains the lanes of one bus into a [`HardwareBacking`].
pub struct TrafficScheduler<H: HardwareBacking> {
    bus: Bus,
    hardware: H,
    lanes: Vec<Lane>,
    blocker: Blocker<Connection>,
    resume_owner: Box<[Option<usize>]>,
    resume_queue: VecDeque<usize>,
    pass_start: usize,
    pacer: Pacer,
    config: SchedulerConfig,
    live_lanes: usize,
    shutdown_requested: bool,
    stats: SchedulerStats,
}

impl<H: HardwareBacking> TrafficScheduler<H> {
    pub(crate) fn new(bus: Bus, readers: Vec<LaneReader>, hardware: H, config: SchedulerConfig) -> Self {
        for (index, reader) in readers.iter().enumerate() {
            assert_eq!(
                reader.lane.index(),
                index,
                "lanes must be handed over in index order"
            );
        }
        let lanes: Vec<Lane> = readers
            .into_iter()
            .map(|reader| Lane {
                reader,
                state: LaneState::Idle,
            })
            .collect();
        let live_lanes = lanes.len();
        let pacer = Pacer::new(
            config.poll_granularity_ms(),
            config.wait,
            Arc::new(AtomicBool::new(false)),
        );

        info!(?bus, lanes = live_lanes, "traffic scheduler created");

        Self {
            bus,
            hardware,
            lanes,
            blocker: Blocker::with_full_capacity(),
            resume_owner: vec![None; MAX_CONNECTIONS].into_boxed_slice(),
            resume_queue: VecDeque::new(),
            pass_start: 0,
            pacer,
            config,
            live_lanes,
            shutdown_requested: false,
            stats: SchedulerStats::default(),
        }
    }

    #[must_use]
    pub const fn bus(&self) -> Bus {
        self.bus
    }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hardware
    }

    pub const fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    #[must_use]
    pub fn into_hardware(self) -> H {
        self.hardware
    }

    #[must_use]
    pub const fn stats(&self) -> SchedulerStats {
        self.stats
    }

    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    #[must_use]
    pub fn lane_state(&self, lane: LaneId) -> Option<LaneState> {
        self.lanes.get(lane.index()).map(|l| l.state)
    }

    /// Lane that gets the first visit once `connection`'s deadline passes.
    #[must_use]
    pub fn resume_owner(&self, connection: Connection) -> Option<LaneId> {
        self.resume_owner
            .get(connection.index())
            .copied()
            .flatten()
            .map(|index| self.lanes[index].reader.lane)
    }

    #[must_use]
    pub fn is_connection_blocked(&self, connection: Connection) -> bool {
        self.blocker.is_blocked(connection, self.hardware.now_ms())
    }

    /// Flag that stops `run_for` and any in-progress pacing wait.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.pacer.cancel_flag()
    }

    /// `true` once every lane has sent end-of-stream.
    #[must_use]
    pub const fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Runs passes until the budget is spent, nothing is left to do, every
    /// lane has closed, or the cancellation flag is raised.
    ///
    /// A pass that found no work still keeps the call alive while a blocked
    /// connection is due to come free within the remaining budget.
    pub fn run_for(&mut self, budget_ms: i64) -> RunOutcome {
        let start = self.hardware.now_ms();
        loop {
            if self.shutdown_requested {
                return RunOutcome::Shutdown;
            }
            if self.pacer.is_cancelled() {
                return RunOutcome::Cancelled;
            }

            let progressed = self.run_pass();

            if self.shutdown_requested {
                return RunOutcome::Shutdown;
            }
            let now = self.hardware.now_ms();
            let elapsed = now - start;
            if elapsed >= budget_ms {
                return if progressed {
                    RunOutcome::BudgetExhausted
                } else {
                    RunOutcome::Idle
                };
            }
            if progressed {
                continue;
            }
            if !self.blocker.will_release_within(now, budget_ms - elapsed) {
                return RunOutcome::Idle;
            }
            self.pacer.relax();
        }
    }

    /// Runs [`run_for`](Self::run_for) with the configured pass budget.
    pub fn run(&mut self) -> RunOutcome {
        let budget = self.config.pass_budget_ms();
        self.run_for(budget)
    }

    /// Visits every lane once. Returns `true` if anything moved.
    pub fn run_pass(&mut self) -> bool {
        let count = self.lanes.len();
        if count == 0 {
            return false;
        }
        let mut progressed = false;
        for k in 0..count {
            progressed |= self.release_expired();
            while let Some(owner) = self.resume_queue.pop_front() {
                progressed |= self.visit(owner);
            }
            let index = (self.pass_start + count - k) % count;
            progressed |= self.visit(index);
            if self.pacer.is_cancelled() {
                break;
            }
        }
        self.pass_start = (self.pass_start + 1) % count;
        self.stats.passes += 1;
        progressed
    }

    /// Lifts expired lane and connection blocks, queueing resume owners.
    fn release_expired(&mut self) -> bool {
        let now = self.hardware.now_ms();
        self.hardware.release_channel_blocks(now);
        let mut released = false;
        while let Some(connection) = self.blocker.next_released(now) {
            released = true;
            trace!(%connection, now, "connection released");
            if let Some(owner) = self.resume_owner[connection.index()].take()
                && !self.resume_queue.contains(&owner)
            {
                self.resume_queue.push_back(owner);
            }
        }
        released
    }

    /// One lane visit. Returns `true` if the lane's state moved.
    fn visit(&mut self, index: usize) -> bool {
        let lane_id = self.lanes[index].reader.lane;
        if self.hardware.is_channel_blocked(lane_id) {
            return false;
        }

        let mut progressed = false;

        if self.lanes[index].state == LaneState::Idle {
            if !self.read_release(index) {
                return false;
            }
            progressed = true;
        }

        if self.lanes[index].state.remaining().is_some() {
            progressed |= self.drain(index);
        }

        if self.lanes[index].state == LaneState::Done {
            progressed |= self.try_ack(index);
        }

        progressed
    }

    /// Reads the next control record for an idle lane.
    fn read_release(&mut self, index: usize) -> bool {
        let lane = &mut self.lanes[index];
        let lane_id = lane.reader.lane;
        let Some(message) = lane.reader.release.take() else {
            return false;
        };
        match message {
            TrafficMessage::Release { lane: named, count } if named == lane_id => {
                self.stats.batches += 1;
                lane.state = if count == 0 {
                    LaneState::Done
                } else {
                    LaneState::Counting { remaining: count }
                };
                trace!(lane = %lane_id, count, "release read");
            }
            TrafficMessage::EndOfStream => {
                lane.state = LaneState::Closed;
                self.live_lanes -= 1;
                info!(bus = ?self.bus, lane = %lane_id, live = self.live_lanes, "lane closed");
                if self.live_lanes == 0 {
                    self.shutdown_requested = true;
                    info!(bus = ?self.bus, "every lane closed, shutdown requested");
                }
            }
            other => {
                error!(bus = ?self.bus, lane = %lane_id, kind = other.kind(), "unexpected message on release channel");
                panic!(
                    "protocol violation: {lane_id} on {:?} bus received {other:?} on its release channel",
                    self.bus
                );
            }
        }
        true
    }

    /// Dispatches fragments of the lane's batch until it completes or waits.
    fn drain(&mut self, index: usize) -> bool {
        let Self {
            hardware,
            lanes,
            blocker,
            resume_owner,
            pacer,
            stats,
            ..
        } = self;
        let lane = &mut lanes[index];
        let lane_id = lane.reader.lane;
        let Some(mut remaining) = lane.state.remaining() else {
            return false;
        };
        let mut progressed = false;

        while remaining > 0 {
            if hardware.is_channel_blocked(lane_id) {
                break;
            }
            let Some(fragment) = lane.reader.data.try_read_fragment() else {
                break;
            };
            if let Some(connection) = fragment.connection() {
                let reserved_elsewhere =
                    matches!(resume_owner[connection.index()], Some(owner) if owner != index);
                if reserved_elsewhere || blocker.is_blocked(connection, hardware.now_ms()) {
                    break;
                }
            }

            let outcome = fragment.apply(hardware);
            trace!(lane = %lane_id, kind = fragment.kind(), ?outcome, "fragment dispatched");
            lane.reader.data.release_read_lock();
            remaining -= 1;
            stats.dispatched += 1;
            progressed = true;

            let completed = match outcome {
                Outcome::Dispatched => true,
                Outcome::HoldConnection { connection, hold } => {
                    match hold_deadline(hardware, pacer, hold) {
                        Some(Some(deadline)) => {
                            blocker.block(connection, deadline);
                            if remaining > 0 {
                                resume_owner[connection.index()] = Some(index);
                            }
                            true
                        }
                        Some(None) => true,
                        None => false,
                    }
                }
                Outcome::HoldLane { hold } => match hold_deadline(hardware, pacer, hold) {
                    Some(Some(deadline)) => {
                        hardware.block_channel_until(lane_id, deadline);
                        true
                    }
                    Some(None) => true,
                    None => false,
                },
            };

            if !completed {
                debug!(lane = %lane_id, "hold cut short by cancellation");
                break;
            }
        }

        if remaining == 0 {
            lane.state = LaneState::Done;
        } else if progressed {
            lane.state = LaneState::Draining { remaining };
        }
        progressed
    }

    /// Sends the ack for a completed batch. Stays `Done` if the ack channel
    /// is full.
    fn try_ack(&mut self, index: usize) -> bool {
        let lane = &mut self.lanes[index];
        let lane_id = lane.reader.lane;
        if lane.reader.ack.push(TrafficMessage::Ack { lane: lane_id }).is_err() {
            trace!(lane = %lane_id, "ack channel full, retrying next visit");
            return false;
        }
        lane.state = LaneState::Idle;
        self.stats.acks += 1;
        debug!(lane = %lane_id, "batch acknowledged");
        true
    }
}

/// Turns a hold into an absolute deadline in ms.
///
/// Relative holds first wait out their sub-granule remainder in place.
/// Returns `None` if that wait was cancelled, `Some(None)` if nothing is left
/// to block.
fn hold_deadline<H: HardwareBacking + ?Sized>(
    hardware: &H,
    pacer: &Pacer,
    hold: Hold,
) -> Option<Option<i64>> {
    match hold {
        Hold::For(duration_ns) => {
            let (whole_ms, remainder_ns) = pacer.split(duration_ns);
            if remainder_ns > 0 && !pacer.wait_ns(remainder_ns) {
                return None;
            }
            if whole_ms > 0 {
                Some(Some(hardware.now_ms() + whole_ms))
            } else {
                Some(None)
            }
        }
        Hold::Until(time_ms) => {
            if time_ms > hardware.now_ms() {
                Some(Some(time_ms))
            } else {
                Some(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PinStep;
    use crate::hardware::SimulatedBacking;
    use crate::pipeline::{ChannelRequest, Pipeline};
    use crate::protocol::MS_TO_NS;
    use crate::timing::ManualClock;
    use crate::PipelineConfig;

    fn pin_scheduler(
        channels: usize,
    ) -> (
        Vec<crate::CommandChannel>,
        TrafficScheduler<SimulatedBacking<ManualClock>>,
        ManualClock,
    ) {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        let channels = (0..channels)
            .map(|_| pipeline.command_channel(ChannelRequest::new().pins()).unwrap())
            .collect();
        let clock = ManualClock::new(1_000);
        let scheduler = pipeline
            .scheduler(
                Bus::Pin,
                SimulatedBacking::new(clock.clone()),
                SchedulerConfig::default(),
            )
            .unwrap();
        (channels, scheduler, clock)
    }

    #[test]
    fn test_lane_walks_through_its_states() {
        let (channels, mut scheduler, clock) = pin_scheduler(1);
        let lane = LaneId::new(0);
        let pin = Connection::digital(5);

        assert_eq!(scheduler.lane_state(lane), Some(LaneState::Idle));
        assert!(channels[0].digital_pulse_for(pin, 2 * MS_TO_NS));

        assert!(scheduler.run_pass());
        assert_eq!(
            scheduler.lane_state(lane),
            Some(LaneState::Draining { remaining: 1 })
        );
        assert_eq!(scheduler.resume_owner(pin), Some(lane));
        assert!(scheduler.is_connection_blocked(pin));

        assert!(!scheduler.run_pass());

        clock.advance_ms(2);
        assert!(scheduler.run_pass());
        assert_eq!(scheduler.lane_state(lane), Some(LaneState::Idle));
        assert_eq!(scheduler.resume_owner(pin), None);
        assert_eq!(channels[0].poll_acks(), 1);

        let stats = scheduler.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.acks, 1);
    }

    #[test]
    fn test_zero_count_release_acks_immediately() {
        let (channels, mut scheduler, _clock) = pin_scheduler(1);

        assert!(channels[0].sequence(&[]));
        assert!(scheduler.run_pass());
        assert_eq!(channels[0].poll_acks(), 1);
        assert_eq!(scheduler.stats().dispatched, 0);
    }

    #[test]
    fn test_lane_block_skips_the_lane() {
        let (channels, mut scheduler, clock) = pin_scheduler(1);
        let pin = Connection::digital(3);

        assert!(channels[0].block(4));
        assert!(channels[0].set_value(pin, 1));

        scheduler.run_pass();
        assert!(scheduler.hardware().journal().is_empty());

        clock.advance_ms(4);
        scheduler.run_pass();
        assert_eq!(scheduler.hardware().journal().values(pin), vec![1]);
        assert_eq!(channels[0].poll_acks(), 2);
    }

    #[test]
    fn test_reserved_connection_waits_for_owner() {
        let (channels, mut scheduler, clock) = pin_scheduler(2);
        let pin = Connection::digital(3);

        assert!(channels[0].sequence(&[
            PinStep::Set { connection: pin, value: 1 },
            PinStep::Hold { connection: pin, duration_ns: MS_TO_NS },
            PinStep::Set { connection: pin, value: 2 },
        ]));
        scheduler.run_pass();
        assert_eq!(scheduler.resume_owner(pin), Some(LaneId::new(0)));

        assert!(channels[1].set_value(pin, 9));
        clock.advance_ms(1);
        while scheduler.run_pass() {}

        assert_eq!(scheduler.hardware().journal().values(pin), vec![1, 2, 9]);
    }

    #[test]
    fn test_crossed_holds_both_complete() {
        let (channels, mut scheduler, clock) = pin_scheduler(2);
        let p3 = Connection::digital(3);
        let p4 = Connection::digital(4);

        assert!(channels[0].sequence(&[
            PinStep::Hold { connection: p3, duration_ns: MS_TO_NS },
            PinStep::Set { connection: p3, value: 1 },
            PinStep::Set { connection: p4, value: 1 },
        ]));
        assert!(channels[1].sequence(&[
            PinStep::Hold { connection: p4, duration_ns: MS_TO_NS },
            PinStep::Set { connection: p4, value: 2 },
            PinStep::Set { connection: p3, value: 2 },
        ]));
        while scheduler.run_pass() {}
        assert_eq!(scheduler.resume_owner(p3), Some(LaneId::new(0)));
        assert_eq!(scheduler.resume_owner(p4), Some(LaneId::new(1)));

        clock.advance_ms(1);
        while scheduler.run_pass() {}

        assert_eq!(scheduler.resume_owner(p3), None);
        assert_eq!(scheduler.resume_owner(p4), None);
        assert_eq!(channels[0].poll_acks() + channels[1].poll_acks(), 2);
        let journal = scheduler.hardware().journal();
        assert_eq!(journal.values(p3).len(), 2);
        assert_eq!(journal.values(p4).len(), 2);
    }

    #[test]
    fn test_run_for_reports_shutdown() {
        let (channels, mut scheduler, _clock) = pin_scheduler(2);

        assert!(channels[0].set_value(Connection::digital(1), 1));
        assert!(channels[0].end_of_stream());
        assert_eq!(scheduler.run_for(10), RunOutcome::Idle);
        assert!(!scheduler.is_shutdown_requested());

        assert!(channels[1].end_of_stream());
        assert_eq!(scheduler.run_for(10), RunOutcome::Shutdown);
        assert_eq!(scheduler.lane_state(LaneId::new(0)), Some(LaneState::Closed));
    }

    #[test]
    fn test_run_for_honours_cancellation() {
        let (_channels, mut scheduler, _clock) = pin_scheduler(1);

        scheduler
            .cancel_flag()
            .store(true, std::sync::atomic::Ordering::Release);
        assert_eq!(scheduler.run_for(10), RunOutcome::Cancelled);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_ack_on_release_channel_panics() {
        let (_channels, mut scheduler, _clock) = pin_scheduler(1);
        let (mut tx, rx) = crate::channel::channel(64);
        tx.push(TrafficMessage::Ack { lane: LaneId::new(0) }).unwrap();
        scheduler.lanes[0].reader.release = rx;

        scheduler.run_pass();
    }
}
