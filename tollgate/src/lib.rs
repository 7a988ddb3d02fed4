//! Traffic-ordered scheduling of hardware bus commands.
//!
//! Behaviors write pin, I2C and serial actions through a [`CommandChannel`].
//! Each action lands on a lock-free [`channel`] as a batch of
//! [`Fragment`]s followed by a release record. One [`TrafficScheduler`] per bus
//! drains every lane feeding that bus, runs the fragments against a
//! [`HardwareBacking`], keeps other lanes off a connection while a batch holds
//! it, and acknowledges each batch once all its fragments are done.
//!
//! ```text
//! CommandChannel --fragments + Release--> lane --> TrafficScheduler --> HardwareBacking
//!        ^                                                 |
//!        +------------------------- Ack -------------------+
//! ```
//!
//! # Example
//!
//! ```
//! use tollgate::{
//!     Bus, ChannelRequest, Connection, ManualClock, Pipeline, PipelineConfig, SchedulerConfig,
//!     SimulatedBacking,
//! };
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::default());
//! let channel = pipeline.command_channel(ChannelRequest::new().pins()).unwrap();
//!
//! let clock = ManualClock::new(0);
//! let mut scheduler = pipeline
//!     .scheduler(Bus::Pin, SimulatedBacking::new(clock.clone()), SchedulerConfig::default())
//!     .unwrap();
//!
//! let led = Connection::digital(5);
//! assert!(channel.digital_pulse_for(led, 2_000_000));
//!
//! scheduler.run_pass();
//! clock.advance_ms(2);
//! scheduler.run_pass();
//!
//! assert_eq!(scheduler.hardware().journal().values(led), vec![1, 0]);
//! assert_eq!(channel.poll_acks(), 1);
//! ```

pub mod channel;
pub mod command;
pub mod config;
pub mod hardware;
pub mod pipeline;
pub mod protocol;
pub mod runtime;
pub mod scheduler;
pub mod timing;
mod trace;

pub use command::{CommandChannel, CommandError, I2cWriter, PinStep};
pub use config::{ChannelConfig, PipelineConfig, SchedulerConfig};
pub use hardware::{
    HardwareBacking, HardwareError, HardwareEvent, Journal, Loopback, RetryPolicy,
    RetryingBacking, SimulatedBacking, Transport,
};
pub use pipeline::{Bus, ChannelRequest, Pipeline, PipelineError};
pub use protocol::{ANALOG_BIT, Connection, Fragment, LaneId, MAX_CONNECTIONS, TrafficMessage};
pub use runtime::{DriverError, SchedulerThread};
pub use scheduler::{LaneState, RunOutcome, SchedulerStats, TrafficScheduler};
pub use timing::{Clock, ManualClock, MonotonicClock, WaitStrategy};
pub use trace::init_tracing;
