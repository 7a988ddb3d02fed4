//! Producer side: the command channel a behavior writes hardware actions to.
//!
//! Every public call is one logical action. It checks room on every channel it
//! touches before writing anything, so a `false`/`None` return leaves no trace
//! behind. On success the fragments are published first and a single
//! `Release` carrying their count follows on the lane's release channel.
//!
//! A command channel is meant to be driven by one thread at a time. It can be
//! shared, but entering it while another call is in flight panics.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::channel::{Consumer, Producer};
use crate::pipeline::Bus;
use crate::protocol::{
    BLOCK_CHANNEL_FOOTPRINT, BLOCK_FOOTPRINT, Connection, END_OF_STREAM_FOOTPRINT, Fragment,
    I2C_BLOCK_FOOTPRINT, I2C_HEADER_FOOTPRINT, LaneId, MS_TO_NS, PIN_SET_FOOTPRINT,
    RELEASE_FOOTPRINT, SERIAL_HEADER_FOOTPRINT, TrafficMessage,
};
use crate::trace::{debug, error, trace, warn};

/// Capacity errors raised synchronously by the overflowing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    /// More I2C commands were queued than the channel can ever hold at once.
    #[error("too many i2c commands, found {found} but only left room for {max}")]
    TooManyCommands { found: u32, max: u32 },
    /// An I2C payload outgrew the size the channel was built for.
    #[error("i2c message of {len} bytes exceeds the configured maximum of {max}")]
    MessageTooLarge { len: usize, max: usize },
}

/// One step of a [`CommandChannel::sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStep {
    /// Digital or analog set, depending on the connection.
    Set { connection: Connection, value: i32 },
    /// Hold the connection for `duration_ns`.
    Hold {
        connection: Connection,
        duration_ns: i64,
    },
    /// Hold the connection until `time_ms` on the scheduler's clock.
    HoldUntil { connection: Connection, time_ms: i64 },
    /// Hold this channel's pin lane for `duration_ns`.
    Pause { duration_ns: i64 },
}

impl PinStep {
    fn into_fragment(self) -> Fragment {
        match self {
            Self::Set { connection, value } => set_fragment(connection, value),
            Self::Hold {
                connection,
                duration_ns,
            } => Fragment::BlockConnection {
                connection,
                duration_ns,
            },
            Self::HoldUntil {
                connection,
                time_ms,
            } => Fragment::BlockConnectionUntil {
                connection,
                time_ms,
            },
            Self::Pause { duration_ns } => Fragment::BlockChannel { duration_ns },
        }
    }

    const fn footprint(&self) -> usize {
        match self {
            Self::Set { .. } => PIN_SET_FOOTPRINT,
            Self::Hold { .. } | Self::HoldUntil { .. } => BLOCK_FOOTPRINT,
            Self::Pause { .. } => BLOCK_CHANNEL_FOOTPRINT,
        }
    }
}

fn set_fragment(connection: Connection, value: i32) -> Fragment {
    if connection.is_analog() {
        Fragment::AnalogSet { connection, value }
    } else {
        Fragment::DigitalSet { connection, value }
    }
}

/// Producer end of one lane.
pub(crate) struct LaneWriter {
    lane: LaneId,
    data: Producer<Fragment>,
    release: Producer<TrafficMessage>,
    acks: Consumer<TrafficMessage>,
    /// Releases sent and not yet acknowledged.
    outstanding: usize,
}

impl LaneWriter {
    pub(crate) const fn new(
        lane: LaneId,
        data: Producer<Fragment>,
        release: Producer<TrafficMessage>,
        acks: Consumer<TrafficMessage>,
    ) -> Self {
        Self {
            lane,
            data,
            release,
            acks,
            outstanding: 0,
        }
    }

    fn has_room(&mut self, data_bytes: usize) -> bool {
        self.data.has_room_for(data_bytes) && self.release.has_room_for(RELEASE_FOOTPRINT)
    }

    /// Stages and publishes `fragment`. Room must have been checked.
    fn write(&mut self, fragment: Fragment) {
        if self.data.try_write(fragment).is_err() {
            unreachable!("{} data channel lost room it was checked for", self.lane);
        }
    }

    /// Publishes staged fragments and releases `count` of them as one batch.
    fn release(&mut self, count: u32) {
        self.data.publish();
        if self
            .release
            .push(TrafficMessage::Release {
                lane: self.lane,
                count,
            })
            .is_err()
        {
            unreachable!("{} release channel lost room it was checked for", self.lane);
        }
        self.outstanding += 1;
        trace!(lane = %self.lane, count, "batch released");
    }

    /// Writes `fragments` as one batch. Room must have been checked.
    fn submit(&mut self, fragments: impl IntoIterator<Item = Fragment>) {
        let mut count = 0u32;
        for fragment in fragments {
            self.write(fragment);
            count += 1;
        }
        self.release(count);
    }

    fn poll_acks(&mut self) -> usize {
        let mut acked = 0;
        while let Some(message) = self.acks.take() {
            match message {
                TrafficMessage::Ack { lane } if lane == self.lane => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    acked += 1;
                }
                other => {
                    error!(lane = %self.lane, kind = other.kind(), "unexpected message on ack channel");
                    panic!(
                        "protocol violation: {} received {:?} on its ack channel",
                        self.lane, other
                    );
                }
            }
        }
        if acked > 0 {
            debug!(lane = %self.lane, acked, outstanding = self.outstanding, "acks received");
        }
        acked
    }
}

/// I2C lane plus its batch accounting.
pub(crate) struct I2cLane {
    writer: LaneWriter,
    /// Fragments published since the last flush; the next flush releases them.
    running: u32,
    max_commands: u32,
    max_message: usize,
}

impl I2cLane {
    pub(crate) const fn new(writer: LaneWriter, max_commands: u32, max_message: usize) -> Self {
        Self {
            writer,
            running: 0,
            max_commands,
            max_message,
        }
    }

    const fn command_footprint(&self) -> usize {
        I2C_HEADER_FOOTPRINT + self.max_message
    }

    const fn check_capacity(&self) -> Result<(), CommandError> {
        let found = self.running + 1;
        if found > self.max_commands {
            return Err(CommandError::TooManyCommands {
                found,
                max: self.max_commands,
            });
        }
        Ok(())
    }
}

/// State behind the exclusive-use guard.
pub(crate) struct ChannelState {
    pins: Option<LaneWriter>,
    i2c: Option<I2cLane>,
    serial: Option<LaneWriter>,
    closed: bool,
}

impl ChannelState {
    pub(crate) const fn new(
        pins: Option<LaneWriter>,
        i2c: Option<I2cLane>,
        serial: Option<LaneWriter>,
    ) -> Self {
        Self {
            pins,
            i2c,
            serial,
            closed: false,
        }
    }

    fn lanes_mut(&mut self) -> impl Iterator<Item = &mut LaneWriter> {
        self.pins
            .iter_mut()
            .chain(self.i2c.iter_mut().map(|i2c| &mut i2c.writer))
            .chain(self.serial.iter_mut())
    }

    fn lanes(&self) -> impl Iterator<Item = &LaneWriter> {
        self.pins
            .iter()
            .chain(self.i2c.iter().map(|i2c| &i2c.writer))
            .chain(self.serial.iter())
    }
}

/// Exclusive-use flag held for the length of one public call.
struct ExclusiveGuard<'a> {
    busy: &'a AtomicBool,
}

impl<'a> ExclusiveGuard<'a> {
    fn enter(busy: &'a AtomicBool, id: usize, op: &'static str) -> Self {
        if busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            error!(channel = id, op, "concurrent use of command channel");
            panic!("concurrent use of command channel {id} detected in {op}");
        }
        Self { busy }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Handle a behavior writes hardware actions through.
///
/// Created by [`Pipeline::command_channel`](crate::Pipeline::command_channel).
pub struct CommandChannel {
    id: usize,
    busy: AtomicBool,
    state: UnsafeCell<ChannelState>,
}

// SAFETY: `state` is only reached through `ExclusiveGuard`, whose CAS on
// `busy` admits one caller at a time and orders its accesses after the
// previous caller's (Acquire on enter, Release on exit).
unsafe impl Sync for CommandChannel {}

impl CommandChannel {
    pub(crate) const fn new(id: usize, state: ChannelState) -> Self {
        Self {
            id,
            busy: AtomicBool::new(false),
            state: UnsafeCell::new(state),
        }
    }

    /// Pipeline-wide id of this channel.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Runs `f` on the state under the guard.
    fn with_state<R>(&self, op: &'static str, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        let _guard = ExclusiveGuard::enter(&self.busy, self.id, op);
        // SAFETY: the guard grants exclusive access until it drops.
        let state = unsafe { &mut *self.state.get() };
        Self::ensure_open(self.id, state, op);
        f(state)
    }

    fn ensure_open(id: usize, state: &ChannelState, op: &'static str) {
        if state.closed {
            error!(channel = id, op, "command channel used after end of stream");
            panic!("command channel {id} used in {op} after end_of_stream");
        }
    }

    fn pin_lane(id: usize, state: &mut ChannelState) -> &mut LaneWriter {
        match state.pins.as_mut() {
            Some(lane) => lane,
            None => panic!("command channel {id} was not built with pin writing"),
        }
    }

    fn i2c_lane(id: usize, state: &mut ChannelState) -> &mut I2cLane {
        match state.i2c.as_mut() {
            Some(lane) => lane,
            None => panic!("command channel {id} was not built with i2c writing"),
        }
    }

    fn serial_lane(id: usize, state: &mut ChannelState) -> &mut LaneWriter {
        match state.serial.as_mut() {
            Some(lane) => lane,
            None => panic!("command channel {id} was not built with serial writing"),
        }
    }

    /// Submits `fragments` (with total footprint `bytes`) on the pin lane.
    fn submit_pins(
        &self,
        op: &'static str,
        bytes: usize,
        fragments: impl IntoIterator<Item = Fragment>,
    ) -> bool {
        let id = self.id;
        self.with_state(op, |state| {
            let lane = Self::pin_lane(id, state);
            if !lane.has_room(bytes) {
                return false;
            }
            lane.submit(fragments);
            true
        })
    }

    /// Sets a pin. Analog connections get an analog set.
    pub fn set_value(&self, connection: Connection, value: i32) -> bool {
        self.submit_pins(
            "set_value",
            PIN_SET_FOOTPRINT,
            [set_fragment(connection, value)],
        )
    }

    /// Sets a pin, then holds the connection for `duration_ms`.
    pub fn set_value_and_block(&self, connection: Connection, value: i32, duration_ms: i64) -> bool {
        self.submit_pins(
            "set_value_and_block",
            PIN_SET_FOOTPRINT + BLOCK_FOOTPRINT,
            [
                set_fragment(connection, value),
                Fragment::BlockConnection {
                    connection,
                    duration_ns: duration_ms.saturating_mul(MS_TO_NS),
                },
            ],
        )
    }

    /// Raises then lowers a digital pin.
    pub fn digital_pulse(&self, connection: Connection) -> bool {
        self.digital_pulse_for(connection, 0)
    }

    /// Raises a digital pin, holds it for `duration_ns`, then lowers it.
    ///
    /// A zero duration sends the bare two-step pulse.
    pub fn digital_pulse_for(&self, connection: Connection, duration_ns: i64) -> bool {
        let on = Fragment::DigitalSet {
            connection,
            value: 1,
        };
        let off = Fragment::DigitalSet {
            connection,
            value: 0,
        };
        if duration_ns > 0 {
            self.submit_pins(
                "digital_pulse",
                2 * PIN_SET_FOOTPRINT + BLOCK_FOOTPRINT,
                [
                    on,
                    Fragment::BlockConnection {
                        connection,
                        duration_ns,
                    },
                    off,
                ],
            )
        } else {
            self.submit_pins("digital_pulse", 2 * PIN_SET_FOOTPRINT, [on, off])
        }
    }

    /// Holds `connection` for `duration_ms`.
    pub fn block_connection(&self, connection: Connection, duration_ms: i64) -> bool {
        self.submit_pins(
            "block_connection",
            BLOCK_FOOTPRINT,
            [Fragment::BlockConnection {
                connection,
                duration_ns: duration_ms.saturating_mul(MS_TO_NS),
            }],
        )
    }

    /// Holds `connection` until `time_ms` on the scheduler's clock.
    pub fn block_until(&self, connection: Connection, time_ms: i64) -> bool {
        self.submit_pins(
            "block_until",
            BLOCK_FOOTPRINT,
            [Fragment::BlockConnectionUntil {
                connection,
                time_ms,
            }],
        )
    }

    /// Holds every lane of this channel for `duration_ms`.
    ///
    /// Either every lane gets its block or none does. With I2C commands
    /// pending, the I2C lane's block joins that batch and runs after them
    /// once it is flushed.
    pub fn block(&self, duration_ms: i64) -> bool {
        let duration_ns = duration_ms.saturating_mul(MS_TO_NS);
        self.with_state("block", |state| {
            if !state
                .lanes_mut()
                .all(|lane| lane.has_room(BLOCK_CHANNEL_FOOTPRINT))
            {
                return false;
            }
            let block = Fragment::BlockChannel { duration_ns };
            if let Some(pins) = state.pins.as_mut() {
                pins.submit([block.clone()]);
            }
            if let Some(i2c) = state.i2c.as_mut() {
                if i2c.running > 0 {
                    i2c.writer.write(block.clone());
                    i2c.writer.data.publish();
                    i2c.running += 1;
                } else {
                    i2c.writer.submit([block.clone()]);
                }
            }
            if let Some(serial) = state.serial.as_mut() {
                serial.submit([block]);
            }
            true
        })
    }

    /// Submits an arbitrary pin action as one batch.
    ///
    /// Steps execute in order. When a step holds a connection, no other lane
    /// reaches that connection before this batch resumes on it. An empty sequence is
    /// released with a count of zero and acknowledged straight away.
    pub fn sequence(&self, steps: &[PinStep]) -> bool {
        let bytes = steps.iter().map(PinStep::footprint).sum();
        self.submit_pins(
            "sequence",
            bytes,
            steps.iter().map(|step| step.into_fragment()),
        )
    }

    /// Writes `payload` to the serial line as one batch.
    pub fn publish_serial(&self, payload: &[u8]) -> bool {
        let id = self.id;
        self.with_state("publish_serial", |state| {
            let lane = Self::serial_lane(id, state);
            if !lane.has_room(SERIAL_HEADER_FOOTPRINT + payload.len()) {
                return false;
            }
            lane.submit([Fragment::SerialWrite {
                payload: payload.to_vec(),
            }]);
            true
        })
    }

    /// Starts an I2C command to `address`.
    ///
    /// Returns `Ok(None)` if the channel cannot take a command of the maximum
    /// configured size right now. The returned writer keeps this channel
    /// busy until it is closed or dropped.
    ///
    /// # Errors
    ///
    /// [`CommandError::TooManyCommands`] if the batch is already full. Waiting
    /// cannot fix this; the batch has to be flushed first.
    pub fn i2c_open(&self, address: Connection) -> Result<Option<I2cWriter<'_>>, CommandError> {
        let guard = ExclusiveGuard::enter(&self.busy, self.id, "i2c_open");
        // SAFETY: guarded; the reference does not outlive this call.
        let state = unsafe { &mut *self.state.get() };
        Self::ensure_open(self.id, state, "i2c_open");
        let i2c = Self::i2c_lane(self.id, state);
        i2c.check_capacity()?;
        let footprint = i2c.command_footprint();
        if !i2c.writer.has_room(footprint) {
            return Ok(None);
        }
        Ok(Some(I2cWriter {
            channel: self,
            _guard: guard,
            address,
            payload: Vec::with_capacity(i2c.max_message),
        }))
    }

    /// Queues a hold on I2C `address` for `duration_ns`.
    ///
    /// Counts toward the running command total like a command does.
    ///
    /// # Errors
    ///
    /// [`CommandError::TooManyCommands`] if the batch is already full.
    pub fn i2c_delay(&self, address: Connection, duration_ns: i64) -> Result<bool, CommandError> {
        let id = self.id;
        self.with_state("i2c_delay", |state| {
            let i2c = Self::i2c_lane(id, state);
            i2c.check_capacity()?;
            if !i2c.writer.has_room(I2C_BLOCK_FOOTPRINT) {
                return Ok(false);
            }
            i2c.writer.write(Fragment::I2cBlockConnection {
                connection: address,
                address,
                duration_ns,
            });
            i2c.writer.data.publish();
            i2c.running += 1;
            Ok(true)
        })
    }

    /// Returns `true` if `commands` more maximum-size I2C commands fit now.
    pub fn i2c_is_ready(&self, commands: usize) -> bool {
        let id = self.id;
        self.with_state("i2c_is_ready", |state| {
            let i2c = Self::i2c_lane(id, state);
            let bytes = i2c.command_footprint() * commands;
            i2c.writer.has_room(bytes)
        })
    }

    /// Releases every I2C command written since the last flush as one batch.
    ///
    /// Returns `false` if the release channel is full; the batch stays
    /// pending and the call can be repeated.
    pub fn i2c_flush_batch(&self) -> bool {
        let id = self.id;
        self.with_state("i2c_flush_batch", |state| {
            let i2c = Self::i2c_lane(id, state);
            if i2c.running == 0 {
                return true;
            }
            if !i2c.writer.release.has_room_for(RELEASE_FOOTPRINT) {
                return false;
            }
            i2c.writer.release(i2c.running);
            i2c.running = 0;
            true
        })
    }

    /// I2C commands written since the last flush.
    pub fn i2c_pending_commands(&self) -> u32 {
        let id = self.id;
        self.with_state("i2c_pending_commands", |state| {
            Self::i2c_lane(id, state).running
        })
    }

    /// Largest number of I2C commands one batch can hold.
    pub fn i2c_max_commands(&self) -> u32 {
        let id = self.id;
        self.with_state("i2c_max_commands", |state| {
            Self::i2c_lane(id, state).max_commands
        })
    }

    /// Drains acknowledgements on every lane; returns how many arrived.
    ///
    /// # Panics
    ///
    /// Panics if an ack channel carries anything but this lane's `Ack`.
    pub fn poll_acks(&self) -> usize {
        self.with_state("poll_acks", |state| {
            state.lanes_mut().map(LaneWriter::poll_acks).sum()
        })
    }

    /// Batches released and not yet acknowledged, across every lane.
    pub fn pending_batches(&self) -> usize {
        self.with_state("pending_batches", |state| {
            state.lanes().map(|lane| lane.outstanding).sum()
        })
    }

    /// Lanes this channel feeds.
    pub fn lanes(&self) -> Vec<(Bus, LaneId)> {
        self.with_state("lanes", |state| {
            let mut lanes = Vec::with_capacity(3);
            if let Some(pins) = &state.pins {
                lanes.push((Bus::Pin, pins.lane));
            }
            if let Some(i2c) = &state.i2c {
                lanes.push((Bus::I2c, i2c.writer.lane));
            }
            if let Some(serial) = &state.serial {
                lanes.push((Bus::Serial, serial.lane));
            }
            lanes
        })
    }

    /// Tells every scheduler this channel feeds that nothing more will come.
    ///
    /// Returns `false`, sending nothing, if a release channel is full. After
    /// `true` every further call on this channel panics.
    pub fn end_of_stream(&self) -> bool {
        let id = self.id;
        self.with_state("end_of_stream", |state| {
            if !state
                .lanes_mut()
                .all(|lane| lane.release.has_room_for(END_OF_STREAM_FOOTPRINT))
            {
                return false;
            }
            if let Some(i2c) = &state.i2c
                && i2c.running > 0
            {
                warn!(channel = id, running = i2c.running, "unflushed i2c commands dropped at end of stream");
            }
            for lane in state.lanes_mut() {
                lane.data.publish();
                if lane.release.push(TrafficMessage::EndOfStream).is_err() {
                    unreachable!("{} release channel lost room it was checked for", lane.lane);
                }
            }
            state.closed = true;
            debug!(channel = id, "end of stream");
            true
        })
    }
}

/// An open I2C command.
///
/// Bytes written through [`io::Write`] accumulate into one payload that
/// [`I2cWriter::close`] publishes. Dropping the writer abandons the command.
pub struct I2cWriter<'a> {
    channel: &'a CommandChannel,
    _guard: ExclusiveGuard<'a>,
    address: Connection,
    payload: Vec<u8>,
}

impl I2cWriter<'_> {
    #[must_use]
    pub const fn address(&self) -> Connection {
        self.address
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Publishes the command and counts it toward the running batch.
    ///
    /// Returns the payload length.
    ///
    /// # Errors
    ///
    /// [`CommandError::TooManyCommands`] if the batch is already full,
    /// [`CommandError::MessageTooLarge`] if the payload outgrew the configured
    /// maximum. Nothing is published in either case.
    pub fn close(self) -> Result<usize, CommandError> {
        // SAFETY: `_guard` still holds the channel exclusively.
        let state = unsafe { &mut *self.channel.state.get() };
        let i2c = CommandChannel::i2c_lane(self.channel.id, state);

        i2c.check_capacity()?;
        let len = self.payload.len();
        if len > i2c.max_message {
            return Err(CommandError::MessageTooLarge {
                len,
                max: i2c.max_message,
            });
        }

        i2c.writer.write(Fragment::I2cCommand {
            address: self.address,
            payload: self.payload,
        });
        i2c.writer.data.publish();
        i2c.running += 1;
        trace!(address = %self.address, len, running = i2c.running, "i2c command closed");
        Ok(len)
    }
}

impl io::Write for I2cWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.payload.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::ChannelConfig;
    use crate::pipeline::{ChannelRequest, Pipeline};
    use crate::PipelineConfig;

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig::default())
    }

    #[test]
    fn test_operations_report_backpressure_without_side_effects() {
        let mut pipeline = Pipeline::new(PipelineConfig::default().with_channel(
            ChannelConfig::default().with_pin_bytes(48),
        ));
        let channel = pipeline
            .command_channel(ChannelRequest::new().pins())
            .unwrap();
        let pin = Connection::digital(2);

        // 48 bytes hold four sets.
        for _ in 0..4 {
            assert!(channel.set_value(pin, 1));
        }
        assert!(!channel.set_value(pin, 1));
        assert!(!channel.digital_pulse(pin));
        assert_eq!(channel.pending_batches(), 4);
    }

    #[test]
    fn test_i2c_batch_accounting() {
        let mut pipeline = pipeline();
        let channel = pipeline
            .command_channel(ChannelRequest::new().i2c(2, 4))
            .unwrap();
        let device = Connection::i2c(0x04);
        let max = channel.i2c_max_commands();
        assert!(max >= 2);

        let mut writer = channel.i2c_open(device).unwrap().unwrap();
        writer.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(writer.close(), Ok(3));
        assert_eq!(channel.i2c_delay(device, 1_000), Ok(true));
        assert_eq!(channel.i2c_pending_commands(), 2);
        assert_eq!(channel.pending_batches(), 0);

        assert!(channel.i2c_flush_batch());
        assert_eq!(channel.i2c_pending_commands(), 0);
        assert_eq!(channel.pending_batches(), 1);
        assert!(channel.i2c_flush_batch(), "empty flush is a no-op");
        assert_eq!(channel.pending_batches(), 1);
    }

    #[test]
    fn test_i2c_message_too_large() {
        let mut pipeline = pipeline();
        let channel = pipeline
            .command_channel(ChannelRequest::new().i2c(4, 2))
            .unwrap();

        let mut writer = channel.i2c_open(Connection::i2c(8)).unwrap().unwrap();
        writer.write_all(&[0; 3]).unwrap();
        assert_eq!(
            writer.close(),
            Err(CommandError::MessageTooLarge { len: 3, max: 2 })
        );
        assert_eq!(channel.i2c_pending_commands(), 0);
    }

    #[test]
    fn test_open_writer_holds_the_channel() {
        let mut pipeline = pipeline();
        let channel = pipeline
            .command_channel(ChannelRequest::new().pins().i2c(4, 4))
            .unwrap();

        let writer = channel.i2c_open(Connection::i2c(8)).unwrap().unwrap();
        let reentered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            channel.set_value(Connection::digital(1), 1)
        }));
        assert!(reentered.is_err());
        drop(writer);

        assert!(channel.set_value(Connection::digital(1), 1));
    }

    #[test]
    fn test_block_covers_every_lane() {
        let mut pipeline = pipeline();
        let channel = pipeline
            .command_channel(ChannelRequest::new().pins().i2c(4, 4).serial())
            .unwrap();

        assert_eq!(channel.lanes().len(), 3);
        assert!(channel.block(5));
        assert_eq!(channel.pending_batches(), 3);
    }

    #[test]
    fn test_block_joins_a_pending_i2c_batch() {
        let mut pipeline = pipeline();
        let channel = pipeline
            .command_channel(ChannelRequest::new().pins().i2c(4, 4))
            .unwrap();

        let mut writer = channel.i2c_open(Connection::i2c(8)).unwrap().unwrap();
        writer.write_all(&[1, 2]).unwrap();
        writer.close().unwrap();

        assert!(channel.block(5));
        assert_eq!(channel.pending_batches(), 1, "only the pin lane released");
        assert_eq!(channel.i2c_pending_commands(), 2);

        assert!(channel.i2c_flush_batch());
        assert_eq!(channel.pending_batches(), 2);
    }

    #[test]
    fn test_full_i2c_batch_fails_open() {
        let mut pipeline = Pipeline::new(PipelineConfig::default().with_channel(
            ChannelConfig::default().with_i2c_bytes(64),
        ));
        let channel = pipeline
            .command_channel(ChannelRequest::new().i2c(2, 20))
            .unwrap();
        let device = Connection::i2c(0x04);

        for _ in 0..2 {
            let mut writer = channel.i2c_open(device).unwrap().unwrap();
            writer.write_all(&[0xaa; 20]).unwrap();
            assert_eq!(writer.close(), Ok(20));
        }

        assert!(matches!(
            channel.i2c_open(device),
            Err(CommandError::TooManyCommands { found: 3, max: 2 })
        ));

        assert!(channel.i2c_flush_batch());
        assert!(
            matches!(channel.i2c_open(device), Ok(None)),
            "a flushed but unconsumed batch is plain backpressure"
        );
    }

    #[test]
    #[should_panic(expected = "after end_of_stream")]
    fn test_use_after_end_of_stream_panics() {
        let mut pipeline = pipeline();
        let channel = pipeline
            .command_channel(ChannelRequest::new().pins())
            .unwrap();

        assert!(channel.end_of_stream());
        channel.set_value(Connection::digital(1), 1);
    }

    #[test]
    #[should_panic(expected = "not built with serial writing")]
    fn test_missing_bus_panics() {
        let mut pipeline = pipeline();
        let channel = pipeline
            .command_channel(ChannelRequest::new().pins())
            .unwrap();

        channel.publish_serial(b"hi");
    }
}
