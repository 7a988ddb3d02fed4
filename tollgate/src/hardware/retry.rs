//! Backing over a fallible raw transport.
//!
//! Transient failures are retried in place. Running out of attempts is not
//! something a scheduler can recover from, so the failure is logged and the
//! scheduler thread panics with the [`HardwareError`] as payload.

use std::io;
use std::time::Duration;

use thiserror::Error;

use super::{ChannelBlocks, HardwareBacking};
use crate::protocol::LaneId;
use crate::timing::Clock;
use crate::trace::{error, warn};

/// Raw byte transport: a serial port, an I2C device file, a test double.
pub trait Transport: Send {
    /// Writes some prefix of `bytes`, returning how many were taken.
    fn write(&mut self, address: i32, bytes: &[u8]) -> io::Result<usize>;

    /// Reads into `buf`, returning how many bytes arrived. `Ok(0)` means
    /// nothing is available right now.
    fn read_into(&mut self, address: i32, buf: &mut [u8]) -> io::Result<usize>;
}

/// Unrecoverable transport failure.
#[derive(Debug, Error)]
pub enum HardwareError {
    /// Consecutive write attempts made no progress.
    #[error("write to address {address} failed after {attempts} attempts ({written} of {total} bytes written)")]
    WriteExhausted {
        address: i32,
        attempts: u32,
        written: usize,
        total: usize,
        #[source]
        last: Option<io::Error>,
    },
    /// Consecutive read attempts failed.
    #[error("read from address {address} failed after {attempts} attempts")]
    ReadExhausted {
        address: i32,
        attempts: u32,
        #[source]
        last: Option<io::Error>,
    },
}

/// Bounded retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    /// Pause between attempts; zero yields instead of sleeping.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero.
    #[must_use]
    pub const fn new_validated(max_attempts: u32, backoff: Duration) -> Self {
        assert!(max_attempts > 0, "max_attempts must be at least 1");
        Self {
            max_attempts,
            backoff,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(max_attempts > 0, "max_attempts must be at least 1");
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn pause(&self) {
        if self.backoff.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.backoff);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new_validated(25, Duration::ZERO)
    }
}

/// [`HardwareBacking`] that retries a [`Transport`].
pub struct RetryingBacking<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    policy: RetryPolicy,
    lanes: ChannelBlocks,
}

impl<T: Transport, C: Clock> RetryingBacking<T, C> {
    #[must_use]
    pub fn new(transport: T, clock: C, policy: RetryPolicy) -> Self {
        Self {
            transport,
            clock,
            policy,
            lanes: ChannelBlocks::new(),
        }
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[must_use]
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Writes all of `payload`, resuming partial writes.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError::WriteExhausted`] once `max_attempts`
    /// consecutive attempts made no progress.
    pub fn try_write_all(&mut self, address: i32, payload: &[u8]) -> Result<(), HardwareError> {
        let mut written = 0;
        let mut failures = 0;
        let mut last = None;
        while written < payload.len() {
            match self.transport.write(address, &payload[written..]) {
                Ok(0) => {
                    failures += 1;
                }
                Ok(n) => {
                    written += n;
                    failures = 0;
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    failures += 1;
                    last = Some(err);
                }
            }
            if failures >= self.policy.max_attempts {
                return Err(HardwareError::WriteExhausted {
                    address,
                    attempts: failures,
                    written,
                    total: payload.len(),
                    last,
                });
            }
            warn!(address, failures, written, "transport write made no progress, retrying");
            self.policy.pause();
        }
        Ok(())
    }

    /// Reads up to `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError::ReadExhausted`] once `max_attempts`
    /// consecutive attempts failed. "No data" is not a failure.
    pub fn try_read(&mut self, address: i32, length: usize) -> Result<Vec<u8>, HardwareError> {
        let mut buf = vec![0; length];
        let mut failures = 0;
        loop {
            match self.transport.read_into(address, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(Vec::new());
                }
                Err(err) => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        return Err(HardwareError::ReadExhausted {
                            address,
                            attempts: failures,
                            last: Some(err),
                        });
                    }
                    warn!(address, failures, %err, "transport read failed, retrying");
                    self.policy.pause();
                }
            }
        }
    }
}

fn fatal(err: HardwareError) -> ! {
    error!(%err, "hardware transport exhausted its retries");
    std::panic::panic_any(err)
}

impl<T: Transport, C: Clock> HardwareBacking for RetryingBacking<T, C> {
    fn write(&mut self, address: i32, payload: &[u8]) {
        if let Err(err) = self.try_write_all(address, payload) {
            fatal(err);
        }
    }

    fn read(&mut self, address: i32, length: usize) -> Vec<u8> {
        match self.try_read(address, length) {
            Ok(bytes) => bytes,
            Err(err) => fatal(err),
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
}
