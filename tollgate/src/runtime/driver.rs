//! Scheduler thread.
//!
//! ```text
//! loop {
//!     run_for(pass_budget)
//!         BudgetExhausted -> go again
//!         Idle            -> back off (sleep idle_backoff, or yield)
//!         Shutdown        -> every lane closed, exit
//!         Cancelled       -> shutdown flag raised, exit
//! }
//! ```
//!
//! The thread owns the scheduler, and with it the hardware backing, for its
//! whole life and hands both back on join.
//!
//! # Example
//!
//! ```
//! use tollgate::{
//!     Bus, ChannelRequest, Connection, ManualClock, Pipeline, PipelineConfig, SchedulerConfig,
//!     SchedulerThread, SimulatedBacking,
//! };
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::default());
//! let channel = pipeline.command_channel(ChannelRequest::new().pins()).unwrap();
//! let hardware = SimulatedBacking::new(ManualClock::new(0));
//! let journal = hardware.journal();
//! let scheduler = pipeline
//!     .scheduler(Bus::Pin, hardware, SchedulerConfig::default())
//!     .unwrap();
//!
//! let thread = SchedulerThread::spawn("pins", scheduler).unwrap();
//! assert!(channel.set_value(Connection::digital(4), 1));
//! assert!(channel.end_of_stream());
//!
//! let scheduler = thread.join().unwrap();
//! assert_eq!(journal.values(Connection::digital(4)), vec![1]);
//! assert!(scheduler.is_shutdown_requested());
//! ```

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use core_affinity::CoreId;

use crate::hardware::{HardwareBacking, HardwareError};
use crate::scheduler::{RunOutcome, TrafficScheduler};
use crate::trace::{debug, error, info, warn};

/// Error running a scheduler thread.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The OS refused to start the thread.
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(std::io::Error),
    /// The hardware backing gave up on its transport.
    #[error("scheduler thread stopped on a hardware failure: {0}")]
    Hardware(#[from] HardwareError),
    /// Any other panic, typically a protocol violation.
    #[error("scheduler thread panicked: {0}")]
    Panicked(String),
}

/// Handle to a scheduler running on its own thread.
///
/// Dropping the handle signals shutdown but does not wait for the thread.
/// Use [`SchedulerThread::shutdown`] or [`SchedulerThread::join`] to get the
/// scheduler back.
pub struct SchedulerThread<H: HardwareBacking + 'static> {
    name: String,
    shutdown_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<TrafficScheduler<H>>>,
}

impl<H: HardwareBacking + 'static> SchedulerThread<H> {
    /// Starts `scheduler` on a thread called `name`.
    ///
    /// # Errors
    ///
    /// [`DriverError::Spawn`] if the thread cannot be created.
    pub fn spawn(name: impl Into<String>, scheduler: TrafficScheduler<H>) -> Result<Self, DriverError> {
        let name = name.into();
        let shutdown_flag = scheduler.cancel_flag();

        debug!(thread = %name, bus = ?scheduler.bus(), "spawning scheduler thread");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(scheduler))
            .map_err(|e| {
                error!(error = %e, "failed to spawn scheduler thread");
                DriverError::Spawn(e)
            })?;

        Ok(Self {
            name,
            shutdown_flag,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// `true` once the thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Raises the shutdown flag and waits for the thread.
    ///
    /// # Errors
    ///
    /// See [`SchedulerThread::join`].
    pub fn shutdown(self) -> Result<TrafficScheduler<H>, DriverError> {
        info!(thread = %self.name, "scheduler shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Release);
        self.join()
    }

    /// Waits for the thread to stop on its own, which happens once every lane
    /// has sent end-of-stream.
    ///
    /// # Errors
    ///
    /// [`DriverError::Hardware`] if the backing exhausted its retries,
    /// [`DriverError::Panicked`] for any other panic on the thread.
    ///
    /// # Panics
    ///
    /// Panics if called twice; the handle is consumed, so this cannot happen
    /// through the public API.
    pub fn join(mut self) -> Result<TrafficScheduler<H>, DriverError> {
        let Some(handle) = self.handle.take() else {
            unreachable!("scheduler thread joined twice");
        };
        handle.join().map_err(|payload| {
            let err = panic_error(payload);
            error!(thread = %self.name, error = %err, "scheduler thread failed");
            err
        })
    }
}

impl<H: HardwareBacking + 'static> Drop for SchedulerThread<H> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown_flag.store(true, Ordering::Release);
        }
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> DriverError {
    let payload = match payload.downcast::<HardwareError>() {
        Ok(err) => return DriverError::Hardware(*err),
        Err(payload) => payload,
    };
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    DriverError::Panicked(message)
}

fn run<H: HardwareBacking>(mut scheduler: TrafficScheduler<H>) -> TrafficScheduler<H> {
    if let Some(id) = scheduler.config().core
        && !core_affinity::set_for_current(CoreId { id })
    {
        warn!(core = id, "failed to pin scheduler thread");
    }

    let budget = scheduler.config().pass_budget_ms();
    let backoff = scheduler.config().idle_backoff;
    info!(bus = ?scheduler.bus(), budget_ms = budget, "scheduler thread started");

    loop {
        match scheduler.run_for(budget) {
            RunOutcome::BudgetExhausted => {}
            RunOutcome::Idle => {
                if backoff.is_zero() {
                    thread::yield_now();
                } else {
                    thread::sleep(backoff);
                }
            }
            RunOutcome::Shutdown => {
                info!(bus = ?scheduler.bus(), "every lane closed");
                break;
            }
            RunOutcome::Cancelled => {
                info!(bus = ?scheduler.bus(), "shutdown flag raised");
                break;
            }
        }
    }

    let stats = scheduler.stats();
    info!(
        bus = ?scheduler.bus(),
        passes = stats.passes,
        batches = stats.batches,
        dispatched = stats.dispatched,
        acks = stats.acks,
        "scheduler thread exiting"
    );
    scheduler
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::hardware::{RetryPolicy, RetryingBacking, SimulatedBacking, Transport};
    use crate::pipeline::{Bus, ChannelRequest, Pipeline};
    use crate::protocol::Connection;
    use crate::timing::{ManualClock, MonotonicClock};
    use crate::PipelineConfig;

    struct DeadPort;

    impl Transport for DeadPort {
        fn write(&mut self, _address: i32, _bytes: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn read_into(&mut self, _address: i32, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_shutdown_returns_the_scheduler() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        let _channel = pipeline.command_channel(ChannelRequest::new().pins()).unwrap();
        let scheduler = pipeline
            .scheduler(
                Bus::Pin,
                SimulatedBacking::new(MonotonicClock::new()),
                SchedulerConfig::default(),
            )
            .unwrap();

        let thread = SchedulerThread::spawn("test-pins", scheduler).unwrap();
        assert_eq!(thread.name(), "test-pins");
        let scheduler = thread.shutdown().unwrap();
        assert_eq!(scheduler.bus(), Bus::Pin);
        assert!(!scheduler.is_shutdown_requested());
    }

    #[test]
    fn test_hardware_failure_surfaces_on_join() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        let channel = pipeline.command_channel(ChannelRequest::new().serial()).unwrap();
        let hardware = RetryingBacking::new(
            DeadPort,
            ManualClock::new(0),
            RetryPolicy::default().with_max_attempts(3),
        );
        let scheduler = pipeline
            .scheduler(Bus::Serial, hardware, SchedulerConfig::default())
            .unwrap();

        let thread = SchedulerThread::spawn("test-serial", scheduler).unwrap();
        assert!(channel.publish_serial(b"hello"));

        assert!(matches!(
            thread.join(),
            Err(DriverError::Hardware(HardwareError::WriteExhausted { attempts: 3, .. }))
        ));
    }

    #[test]
    fn test_panic_payloads_become_messages() {
        let err = panic_error(Box::new("boom"));
        assert!(matches!(err, DriverError::Panicked(ref m) if m == "boom"));

        let err = panic_error(Box::new(String::from("bang")));
        assert!(matches!(err, DriverError::Panicked(ref m) if m == "bang"));

        let err = panic_error(Box::new(7_u8));
        assert!(matches!(err, DriverError::Panicked(_)));
    }
}
