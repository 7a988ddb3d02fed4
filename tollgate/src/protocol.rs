//! Messages exchanged between command channels and traffic schedulers.
//!
//! Two families travel over [`channel`](crate::channel)s:
//!
//! - [`Fragment`]: one hardware command, written to a lane's data channel.
//! - [`TrafficMessage`]: lane control. A producer sends `Release`/`EndOfStream`
//!   on the release channel, the scheduler answers with `Ack` on the ack
//!   channel.
//!
//! Every message reports a [`Footprint`] so channel capacity is accounted in
//! bytes, the way a packed wire layout would be.

use std::fmt;

use crate::channel::Footprint;
use crate::hardware::HardwareBacking;

/// Highest connection count a bus can address.
pub const MAX_CONNECTIONS: usize = 127;

/// Added to a pin number to mark it as the analog half of the connection space.
pub const ANALOG_BIT: u8 = 0x40;

/// Nanoseconds per millisecond.
pub const MS_TO_NS: i64 = 1_000_000;

/// Upper bound on lanes feeding one scheduler.
pub const MAX_LANES: usize = 256;

/// Raw bus address used for serial writes.
pub const SERIAL_ADDRESS: i32 = -1;

/// An addressable pin or I2C device.
///
/// Digital pins and I2C addresses occupy `0..0x40`; analog pins carry
/// [`ANALOG_BIT`] so both halves share one id space below
/// [`MAX_CONNECTIONS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Connection(u8);

impl Connection {
    /// Digital pin `port`.
    ///
    /// # Panics
    ///
    /// Panics if `port` collides with the analog half of the id space.
    #[must_use]
    pub const fn digital(port: u8) -> Self {
        assert!(port < ANALOG_BIT, "digital port must be below 0x40");
        Self(port)
    }

    /// Analog pin `port`.
    ///
    /// # Panics
    ///
    /// Panics if the resulting id is not below [`MAX_CONNECTIONS`].
    #[must_use]
    pub const fn analog(port: u8) -> Self {
        assert!(
            port < ANALOG_BIT && ((port | ANALOG_BIT) as usize) < MAX_CONNECTIONS,
            "analog port out of range"
        );
        Self(port | ANALOG_BIT)
    }

    /// I2C device at 7-bit `address`.
    ///
    /// # Panics
    ///
    /// Panics if `address` is not below [`MAX_CONNECTIONS`].
    #[must_use]
    pub const fn i2c(address: u8) -> Self {
        assert!(
            (address as usize) < MAX_CONNECTIONS,
            "i2c address out of range"
        );
        Self(address)
    }

    /// Reconstructs a connection from its raw id, if in range.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        if (raw as usize) < MAX_CONNECTIONS {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Index into per-connection tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_analog(self) -> bool {
        self.0 & ANALOG_BIT != 0
    }

    /// Port number without the analog marker.
    #[inline]
    #[must_use]
    pub const fn port(self) -> u8 {
        self.0 & !ANALOG_BIT
    }

    /// Address handed to [`HardwareBacking::write`].
    #[inline]
    #[must_use]
    pub const fn address(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_analog() {
            write!(f, "A{}", self.port())
        } else {
            write!(f, "D{}", self.0)
        }
    }
}

/// Identifies one producer's release/ack pair on one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId(u16);

impl LaneId {
    /// # Panics
    ///
    /// Panics if `index` is not below [`MAX_LANES`].
    #[must_use]
    pub const fn new(index: usize) -> Self {
        assert!(index < MAX_LANES, "lane index out of range");
        Self(index as u16)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane#{}", self.0)
    }
}

/// One hardware command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    DigitalSet {
        connection: Connection,
        value: i32,
    },
    AnalogSet {
        connection: Connection,
        value: i32,
    },
    /// Hold `connection` for a relative duration.
    BlockConnection {
        connection: Connection,
        duration_ns: i64,
    },
    /// Hold `connection` until an absolute time on the backing's clock.
    BlockConnectionUntil {
        connection: Connection,
        time_ms: i64,
    },
    /// Hold the sending lane itself.
    BlockChannel {
        duration_ns: i64,
    },
    I2cCommand {
        address: Connection,
        payload: Vec<u8>,
    },
    I2cBlockConnection {
        connection: Connection,
        address: Connection,
        duration_ns: i64,
    },
    SerialWrite {
        payload: Vec<u8>,
    },
}

/// Footprint of a fixed-size pin fragment.
pub const PIN_SET_FOOTPRINT: usize = 12;
/// Footprint of a connection block fragment.
pub const BLOCK_FOOTPRINT: usize = 16;
/// Footprint of a lane block fragment.
pub const BLOCK_CHANNEL_FOOTPRINT: usize = 12;
/// Fixed part of an I2C command; the payload adds its length.
pub const I2C_HEADER_FOOTPRINT: usize = 12;
/// Footprint of an I2C connection block.
pub const I2C_BLOCK_FOOTPRINT: usize = 20;
/// Fixed part of a serial write; the payload adds its length.
pub const SERIAL_HEADER_FOOTPRINT: usize = 8;

impl Fragment {
    /// Connection this fragment addresses, if any.
    #[must_use]
    pub const fn connection(&self) -> Option<Connection> {
        match self {
            Self::DigitalSet { connection, .. }
            | Self::AnalogSet { connection, .. }
            | Self::BlockConnection { connection, .. }
            | Self::BlockConnectionUntil { connection, .. }
            | Self::I2cBlockConnection { connection, .. } => Some(*connection),
            Self::I2cCommand { address, .. } => Some(*address),
            Self::BlockChannel { .. } | Self::SerialWrite { .. } => None,
        }
    }

    /// Short name for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DigitalSet { .. } => "DigitalSet",
            Self::AnalogSet { .. } => "AnalogSet",
            Self::BlockConnection { .. } => "BlockConnection",
            Self::BlockConnectionUntil { .. } => "BlockConnectionUntil",
            Self::BlockChannel { .. } => "BlockChannel",
            Self::I2cCommand { .. } => "I2cCommand",
            Self::I2cBlockConnection { .. } => "I2cBlockConnection",
            Self::SerialWrite { .. } => "SerialWrite",
        }
    }

    /// Executes the fragment.
    ///
    /// Output fragments call into `hardware` and report [`Outcome::Dispatched`];
    /// block fragments touch nothing and describe the hold for the scheduler to
    /// register.
    pub fn apply<H: HardwareBacking + ?Sized>(&self, hardware: &mut H) -> Outcome {
        match self {
            Self::DigitalSet { connection, value } => {
                hardware.digital_write(*connection, *value);
                Outcome::Dispatched
            }
            Self::AnalogSet { connection, value } => {
                hardware.analog_write(*connection, *value);
                Outcome::Dispatched
            }
            Self::BlockConnection {
                connection,
                duration_ns,
            }
            | Self::I2cBlockConnection {
                connection,
                duration_ns,
                ..
            } => Outcome::HoldConnection {
                connection: *connection,
                hold: Hold::For(*duration_ns),
            },
            Self::BlockConnectionUntil {
                connection,
                time_ms,
            } => Outcome::HoldConnection {
                connection: *connection,
                hold: Hold::Until(*time_ms),
            },
            Self::BlockChannel { duration_ns } => Outcome::HoldLane {
                hold: Hold::For(*duration_ns),
            },
            Self::I2cCommand { address, payload } => {
                hardware.write(address.address(), payload);
                Outcome::Dispatched
            }
            Self::SerialWrite { payload } => {
                hardware.write(SERIAL_ADDRESS, payload);
                Outcome::Dispatched
            }
        }
    }
}

impl Footprint for Fragment {
    const MIN_FOOTPRINT: usize = SERIAL_HEADER_FOOTPRINT;

    fn footprint(&self) -> usize {
        match self {
            Self::DigitalSet { .. } | Self::AnalogSet { .. } => PIN_SET_FOOTPRINT,
            Self::BlockConnection { .. } | Self::BlockConnectionUntil { .. } => BLOCK_FOOTPRINT,
            Self::BlockChannel { .. } => BLOCK_CHANNEL_FOOTPRINT,
            Self::I2cCommand { payload, .. } => I2C_HEADER_FOOTPRINT + payload.len(),
            Self::I2cBlockConnection { .. } => I2C_BLOCK_FOOTPRINT,
            Self::SerialWrite { payload } => SERIAL_HEADER_FOOTPRINT + payload.len(),
        }
    }
}

/// How long a hold lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    /// Relative, in nanoseconds from now.
    For(i64),
    /// Absolute, in milliseconds on the backing's clock.
    Until(i64),
}

/// Result of applying a [`Fragment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The fragment reached the hardware.
    Dispatched,
    /// No traffic may reach `connection` until the hold ends.
    HoldConnection { connection: Connection, hold: Hold },
    /// The sending lane may not dispatch until the hold ends.
    HoldLane { hold: Hold },
}

/// Lane control records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficMessage {
    /// The next `count` fragments on `lane` form one batch.
    Release { lane: LaneId, count: u32 },
    /// The producer will send nothing more.
    EndOfStream,
    /// Every fragment of the lane's current batch was consumed.
    Ack { lane: LaneId },
}

impl TrafficMessage {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Release { .. } => "Release",
            Self::EndOfStream => "EndOfStream",
            Self::Ack { .. } => "Ack",
        }
    }
}

/// Footprint of a release record.
pub const RELEASE_FOOTPRINT: usize = 12;
/// Footprint of an ack record.
pub const ACK_FOOTPRINT: usize = 8;
/// Footprint of an end-of-stream marker.
pub const END_OF_STREAM_FOOTPRINT: usize = 4;

impl Footprint for TrafficMessage {
    const MIN_FOOTPRINT: usize = END_OF_STREAM_FOOTPRINT;

    fn footprint(&self) -> usize {
        match self {
            Self::Release { .. } => RELEASE_FOOTPRINT,
            Self::EndOfStream => END_OF_STREAM_FOOTPRINT,
            Self::Ack { .. } => ACK_FOOTPRINT,
        }
    }
}
