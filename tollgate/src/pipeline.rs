//! Build-time wiring of command channels to schedulers.
//!
//! Channels are requested first; each request allocates one lane on every bus
//! it asks for. A bus is then sealed by building its scheduler, which takes
//! over every lane allocated on it. Capacity problems surface here, before
//! anything runs.

use thiserror::Error;

use crate::channel;
use crate::command::{ChannelState, CommandChannel, I2cLane, LaneWriter};
use crate::config::{ChannelConfig, PipelineConfig, SchedulerConfig};
use crate::hardware::HardwareBacking;
use crate::protocol::{
    ACK_FOOTPRINT, BLOCK_FOOTPRINT, I2C_HEADER_FOOTPRINT, LaneId, MAX_LANES, PIN_SET_FOOTPRINT,
    RELEASE_FOOTPRINT, SERIAL_HEADER_FOOTPRINT,
};
use crate::scheduler::{LaneReader, TrafficScheduler};
use crate::trace::debug;

/// Largest single pin action: a pulse with a hold.
pub const LARGEST_PIN_ACTION: usize = 2 * PIN_SET_FOOTPRINT + BLOCK_FOOTPRINT;

/// Control records a release or ack channel must hold at minimum.
const MIN_CONTROL_RECORDS: usize = 2;

/// A hardware bus with its own scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bus {
    Pin,
    I2c,
    Serial,
}

impl Bus {
    const ALL: [Self; 3] = [Self::Pin, Self::I2c, Self::Serial];

    const fn slot(self) -> usize {
        match self {
            Self::Pin => 0,
            Self::I2c => 1,
            Self::Serial => 2,
        }
    }
}

/// Fatal configuration errors found while building the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A data channel cannot hold the largest action written to it.
    #[error("{bus:?} channel of {capacity} bytes cannot hold an action of {needed} bytes")]
    ChannelTooSmall {
        bus: Bus,
        capacity: usize,
        needed: usize,
    },
    /// A release or ack channel cannot hold two records.
    #[error("{kind} channel of {capacity} bytes must hold at least {needed} bytes")]
    ReleaseTooSmall {
        kind: &'static str,
        capacity: usize,
        needed: usize,
    },
    /// The I2C channel fits no command of the requested size.
    #[error("i2c channel of {capacity} bytes cannot hold one command of {command} bytes")]
    NoI2cRoom { capacity: usize, command: usize },
    /// The bus already has its scheduler.
    #[error("{0:?} bus is sealed, its scheduler was already built")]
    BusSealed(Bus),
    /// The bus cannot take another lane.
    #[error("{bus:?} bus already feeds the maximum of {max} lanes")]
    TooManyLanes { bus: Bus, max: usize },
    /// A scheduler was requested for a bus nothing writes to.
    #[error("{0:?} bus has no lanes")]
    NoLanes(Bus),
    /// A command channel asked for no bus at all.
    #[error("command channel requests no bus")]
    EmptyRequest,
}

/// Which buses a command channel writes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelRequest {
    pins: bool,
    i2c: Option<(usize, usize)>,
    serial: bool,
    config: Option<ChannelConfig>,
}

impl ChannelRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Digital and analog pin writing.
    #[must_use]
    pub const fn pins(mut self) -> Self {
        self.pins = true;
        self
    }

    /// I2C writing with room for `commands` commands of up to `max_message`
    /// payload bytes each.
    #[must_use]
    pub const fn i2c(mut self, commands: usize, max_message: usize) -> Self {
        self.i2c = Some((commands, max_message));
        self
    }

    /// Serial writing.
    #[must_use]
    pub const fn serial(mut self) -> Self {
        self.serial = true;
        self
    }

    /// Capacities for this channel instead of the pipeline defaults.
    #[must_use]
    pub const fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = Some(config);
        self
    }

    const fn buses(&self) -> [bool; 3] {
        [self.pins, self.i2c.is_some(), self.serial]
    }
}

#[derive(Default)]
struct BusLanes {
    lanes: Vec<LaneReader>,
    sealed: bool,
}

/// Sizing of the I2C channel after growth.
struct I2cSizing {
    capacity: usize,
    max_commands: u32,
    max_message: usize,
}

/// Builder that hands out command channels and schedulers.
pub struct Pipeline {
    config: PipelineConfig,
    buses: [BusLanes; 3],
    next_channel: usize,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            buses: Default::default(),
            next_channel: 0,
        }
    }

    /// Lanes allocated on `bus` so far.
    #[must_use]
    pub fn lane_count(&self, bus: Bus) -> usize {
        self.buses[bus.slot()].lanes.len()
    }

    #[must_use]
    pub fn is_sealed(&self, bus: Bus) -> bool {
        self.buses[bus.slot()].sealed
    }

    /// Creates a command channel writing to the requested buses.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`] other than `NoLanes`; nothing is allocated when
    /// an error is returned.
    pub fn command_channel(&mut self, request: ChannelRequest) -> Result<CommandChannel, PipelineError> {
        let config = request.config.unwrap_or(self.config.channel);
        let wanted = request.buses();
        if !wanted.contains(&true) {
            return Err(PipelineError::EmptyRequest);
        }

        for bus in Bus::ALL.into_iter().filter(|bus| wanted[bus.slot()]) {
            let lanes = &self.buses[bus.slot()];
            if lanes.sealed {
                return Err(PipelineError::BusSealed(bus));
            }
            if lanes.lanes.len() >= MAX_LANES {
                return Err(PipelineError::TooManyLanes {
                    bus,
                    max: MAX_LANES,
                });
            }
        }
        check_control(config)?;
        if request.pins && config.pin_bytes < LARGEST_PIN_ACTION {
            return Err(PipelineError::ChannelTooSmall {
                bus: Bus::Pin,
                capacity: config.pin_bytes,
                needed: LARGEST_PIN_ACTION,
            });
        }
        if request.serial && config.serial_bytes <= SERIAL_HEADER_FOOTPRINT {
            return Err(PipelineError::ChannelTooSmall {
                bus: Bus::Serial,
                capacity: config.serial_bytes,
                needed: SERIAL_HEADER_FOOTPRINT + 1,
            });
        }
        let i2c_sizing = match request.i2c {
            Some((commands, max_message)) => Some(size_i2c(config, commands, max_message)?),
            None => None,
        };

        let id = self.next_channel;
        self.next_channel += 1;

        let pins = request
            .pins
            .then(|| self.open_lane(Bus::Pin, config.pin_bytes, config));
        let i2c = i2c_sizing.map(|sizing| {
            let writer = self.open_lane(Bus::I2c, sizing.capacity, config);
            I2cLane::new(writer, sizing.max_commands, sizing.max_message)
        });
        let serial = request
            .serial
            .then(|| self.open_lane(Bus::Serial, config.serial_bytes, config));

        debug!(
            channel = id,
            pins = request.pins,
            i2c = request.i2c.is_some(),
            serial = request.serial,
            "command channel created"
        );

        Ok(CommandChannel::new(id, ChannelState::new(pins, i2c, serial)))
    }

    /// Allocates the next lane on `bus`.
    fn open_lane(&mut self, bus: Bus, data_bytes: usize, config: ChannelConfig) -> LaneWriter {
        let lanes = &mut self.buses[bus.slot()].lanes;
        let lane = LaneId::new(lanes.len());
        let (data_tx, data_rx) = channel::channel(data_bytes);
        let (release_tx, release_rx) = channel::channel(config.release_bytes);
        let (ack_tx, ack_rx) = channel::channel(config.ack_bytes);
        lanes.push(LaneReader {
            lane,
            data: data_rx,
            release: release_rx,
            ack: ack_tx,
        });
        LaneWriter::new(lane, data_tx, release_tx, ack_rx)
    }

    /// Seals `bus` and builds the scheduler that owns its lanes.
    ///
    /// # Errors
    ///
    /// [`PipelineError::BusSealed`] if the bus already has a scheduler,
    /// [`PipelineError::NoLanes`] if no command channel writes to it.
    pub fn scheduler<H: HardwareBacking>(
        &mut self,
        bus: Bus,
        hardware: H,
        config: SchedulerConfig,
    ) -> Result<TrafficScheduler<H>, PipelineError> {
        let lanes = &mut self.buses[bus.slot()];
        if lanes.sealed {
            return Err(PipelineError::BusSealed(bus));
        }
        if lanes.lanes.is_empty() {
            return Err(PipelineError::NoLanes(bus));
        }
        lanes.sealed = true;
        let readers = std::mem::take(&mut lanes.lanes);
        Ok(TrafficScheduler::new(bus, readers, hardware, config))
    }
}

const fn check_control(config: ChannelConfig) -> Result<(), PipelineError> {
    let release_needed = MIN_CONTROL_RECORDS * RELEASE_FOOTPRINT;
    if config.release_bytes < release_needed {
        return Err(PipelineError::ReleaseTooSmall {
            kind: "release",
            capacity: config.release_bytes,
            needed: release_needed,
        });
    }
    let ack_needed = MIN_CONTROL_RECORDS * ACK_FOOTPRINT;
    if config.ack_bytes < ack_needed {
        return Err(PipelineError::ReleaseTooSmall {
            kind: "ack",
            capacity: config.ack_bytes,
            needed: ack_needed,
        });
    }
    Ok(())
}

/// Grows the I2C channel to fit `commands` commands and derives the batch
/// limit from the final size.
fn size_i2c(config: ChannelConfig, commands: usize, max_message: usize) -> Result<I2cSizing, PipelineError> {
    let command = I2C_HEADER_FOOTPRINT + max_message;
    let capacity = config.i2c_bytes.max(commands.saturating_mul(command));
    let max_commands = capacity / command;
    if max_commands == 0 {
        return Err(PipelineError::NoI2cRoom { capacity, command });
    }
    Ok(I2cSizing {
        capacity,
        max_commands: u32::try_from(max_commands).unwrap_or(u32::MAX),
        max_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedBacking;
    use crate::timing::ManualClock;

    fn hw() -> SimulatedBacking<ManualClock> {
        SimulatedBacking::new(ManualClock::new(0))
    }

    #[test]
    fn test_lanes_are_allocated_per_bus() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        let a = pipeline.command_channel(ChannelRequest::new().pins()).unwrap();
        let b = pipeline
            .command_channel(ChannelRequest::new().pins().i2c(4, 8))
            .unwrap();

        assert_eq!(pipeline.lane_count(Bus::Pin), 2);
        assert_eq!(pipeline.lane_count(Bus::I2c), 1);
        assert_eq!(a.lanes(), vec![(Bus::Pin, LaneId::new(0))]);
        assert_eq!(
            b.lanes(),
            vec![(Bus::Pin, LaneId::new(1)), (Bus::I2c, LaneId::new(0))]
        );
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_i2c_channel_grows_to_fit_commands() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        let channel = pipeline
            .command_channel(ChannelRequest::new().i2c(200, 20))
            .unwrap();

        // 200 * (12 + 20) bytes outgrows the 1024 byte default.
        assert_eq!(channel.i2c_max_commands(), 200);
    }

    #[test]
    fn test_undersized_channels_are_rejected() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());

        let tiny_pins = ChannelConfig::default().with_pin_bytes(LARGEST_PIN_ACTION - 1);
        assert_eq!(
            pipeline
                .command_channel(ChannelRequest::new().pins().with_config(tiny_pins))
                .err(),
            Some(PipelineError::ChannelTooSmall {
                bus: Bus::Pin,
                capacity: LARGEST_PIN_ACTION - 1,
                needed: LARGEST_PIN_ACTION,
            })
        );

        let tiny_release = ChannelConfig::default().with_release_bytes(RELEASE_FOOTPRINT);
        assert!(matches!(
            pipeline.command_channel(ChannelRequest::new().pins().with_config(tiny_release)),
            Err(PipelineError::ReleaseTooSmall { kind: "release", .. })
        ));

        let tiny_i2c = ChannelConfig::default().with_i2c_bytes(8);
        assert!(matches!(
            pipeline.command_channel(ChannelRequest::new().i2c(0, 4).with_config(tiny_i2c)),
            Err(PipelineError::NoI2cRoom { .. })
        ));

        assert_eq!(
            pipeline.command_channel(ChannelRequest::new()).err(),
            Some(PipelineError::EmptyRequest)
        );
        assert_eq!(pipeline.lane_count(Bus::Pin), 0, "failed requests allocate nothing");
    }

    #[test]
    fn test_sealed_bus_rejects_new_lanes() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        let _channel = pipeline.command_channel(ChannelRequest::new().pins()).unwrap();
        let scheduler = pipeline
            .scheduler(Bus::Pin, hw(), SchedulerConfig::default())
            .unwrap();
        assert_eq!(scheduler.lane_count(), 1);
        assert!(pipeline.is_sealed(Bus::Pin));

        assert_eq!(
            pipeline.command_channel(ChannelRequest::new().pins()).err(),
            Some(PipelineError::BusSealed(Bus::Pin))
        );
        assert_eq!(
            pipeline
                .scheduler(Bus::Pin, hw(), SchedulerConfig::default())
                .err(),
            Some(PipelineError::BusSealed(Bus::Pin))
        );
        assert_eq!(
            pipeline
                .scheduler(Bus::Serial, hw(), SchedulerConfig::default())
                .err(),
            Some(PipelineError::NoLanes(Bus::Serial))
        );
    }
}
