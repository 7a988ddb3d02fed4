//! Scheduler and pipeline configuration.
//!
//! # Tuning Guidelines
//!
//! - **Pulse-heavy pin traffic**: `SchedulerConfig::low_latency()` spins
//!   through sub-millisecond remainders and keeps passes short.
//! - **Mixed buses on a shared machine**: the default yields while pacing and
//!   sleeps briefly when a pass found nothing to do.
//! - **Slow peripherals (serial, displays)**: `SchedulerConfig::relaxed()`
//!   coarsens the polling granularity and backs off longer when idle.

use std::time::Duration;

use crate::timing::WaitStrategy;

/// Schedule rates below this get the long default pass budget.
const MIN_SCHEDULE_RATE: Duration = Duration::from_millis(2);

/// Pass budget used when the schedule rate is too fine to be a budget itself.
const DEFAULT_PASS_BUDGET: Duration = Duration::from_millis(100);

/// Runtime tuning for one [`TrafficScheduler`](crate::TrafficScheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long one `run_for` call may keep passing over the lanes while it
    /// still finds work or expects a connection to come free.
    ///
    /// **Default**: 100ms
    pub pass_budget: Duration,

    /// Smallest hold registered with the connection blocker. Whole granules
    /// of a hold are blocked, the remainder is waited out in place.
    ///
    /// Must be a whole number of milliseconds.
    ///
    /// **Default**: 1ms
    pub poll_granularity: Duration,

    /// How remainders below the granularity are waited out.
    ///
    /// **Default**: [`WaitStrategy::Yield`]
    pub wait: WaitStrategy,

    /// Sleep between `run_for` calls that found nothing to do.
    /// Zero yields instead.
    ///
    /// **Default**: 1ms
    pub idle_backoff: Duration,

    /// CPU core the scheduler thread pins itself to, if any.
    ///
    /// **Default**: `None`
    pub core: Option<usize>,
}

impl SchedulerConfig {
    /// Creates a new scheduler configuration with validation.
    ///
    /// # Panics
    ///
    /// Panics if `pass_budget` is zero, or if `poll_granularity` is not a
    /// positive whole number of milliseconds.
    #[must_use]
    pub fn new_validated(
        pass_budget: Duration,
        poll_granularity: Duration,
        wait: WaitStrategy,
        idle_backoff: Duration,
        core: Option<usize>,
    ) -> Self {
        assert!(!pass_budget.is_zero(), "pass_budget must be > 0");
        assert_whole_millis(poll_granularity);

        Self {
            pass_budget,
            poll_granularity,
            wait,
            idle_backoff,
            core,
        }
    }

    /// Spins through short waits and keeps passes short.
    #[must_use]
    pub fn low_latency() -> Self {
        Self::new_validated(
            Duration::from_millis(10),
            Duration::from_millis(1),
            WaitStrategy::Spin,
            Duration::ZERO,
            None,
        )
    }

    /// Coarse timing for slow peripherals.
    #[must_use]
    pub fn relaxed() -> Self {
        Self::new_validated(
            DEFAULT_PASS_BUDGET,
            Duration::from_millis(5),
            WaitStrategy::Yield,
            Duration::from_millis(10),
            None,
        )
    }

    /// Derives the pass budget from the rate the scheduler is driven at.
    ///
    /// Rates under 2ms would make the budget meaninglessly short, so they get
    /// the 100ms default; anything slower uses the rate itself.
    #[must_use]
    pub fn from_schedule_rate(rate: Duration) -> Self {
        let budget = if rate < MIN_SCHEDULE_RATE {
            DEFAULT_PASS_BUDGET
        } else {
            rate
        };
        Self::default().with_pass_budget(budget)
    }

    /// Pass budget in whole milliseconds (at least 1).
    #[inline]
    #[must_use]
    pub fn pass_budget_ms(&self) -> i64 {
        millis(self.pass_budget).max(1)
    }

    /// Polling granularity in whole milliseconds.
    #[inline]
    #[must_use]
    pub fn poll_granularity_ms(&self) -> i64 {
        millis(self.poll_granularity)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new_validated(
            DEFAULT_PASS_BUDGET,
            Duration::from_millis(1),
            WaitStrategy::Yield,
            Duration::from_millis(1),
            None,
        )
    }
}

impl SchedulerConfig {
    /// Builder-style setter for the pass budget.
    ///
    /// # Panics
    ///
    /// Panics if `budget` is zero.
    #[must_use]
    pub fn with_pass_budget(mut self, budget: Duration) -> Self {
        assert!(!budget.is_zero(), "pass_budget must be > 0");
        self.pass_budget = budget;
        self
    }

    /// Builder-style setter for the polling granularity.
    ///
    /// # Panics
    ///
    /// Panics if `granularity` is not a positive whole number of milliseconds.
    #[must_use]
    pub fn with_poll_granularity(mut self, granularity: Duration) -> Self {
        assert_whole_millis(granularity);
        self.poll_granularity = granularity;
        self
    }

    /// Builder-style setter for the wait strategy.
    #[must_use]
    pub const fn with_wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    /// Builder-style setter for the idle back-off.
    #[must_use]
    pub const fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Builder-style setter for CPU pinning.
    #[must_use]
    pub const fn with_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }
}

fn assert_whole_millis(granularity: Duration) {
    assert!(
        granularity >= Duration::from_millis(1) && granularity.subsec_nanos() % 1_000_000 == 0,
        "poll_granularity must be a whole number of milliseconds >= 1ms"
    );
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Channel capacities for one command channel, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Pin fragment channel.
    ///
    /// **Default**: 1024
    pub pin_bytes: usize,

    /// I2C fragment channel, before it grows to fit the requested command
    /// capacity.
    ///
    /// **Default**: 1024
    pub i2c_bytes: usize,

    /// Serial fragment channel.
    ///
    /// **Default**: 4096
    pub serial_bytes: usize,

    /// Release channel of every lane.
    ///
    /// **Default**: 256
    pub release_bytes: usize,

    /// Ack channel of every lane.
    ///
    /// **Default**: 256
    pub ack_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pin_bytes: 1024,
            i2c_bytes: 1024,
            serial_bytes: 4096,
            release_bytes: 256,
            ack_bytes: 256,
        }
    }
}

impl ChannelConfig {
    /// Builder-style setter for the pin channel size.
    #[must_use]
    pub const fn with_pin_bytes(mut self, bytes: usize) -> Self {
        self.pin_bytes = bytes;
        self
    }

    /// Builder-style setter for the base I2C channel size.
    #[must_use]
    pub const fn with_i2c_bytes(mut self, bytes: usize) -> Self {
        self.i2c_bytes = bytes;
        self
    }

    /// Builder-style setter for the serial channel size.
    #[must_use]
    pub const fn with_serial_bytes(mut self, bytes: usize) -> Self {
        self.serial_bytes = bytes;
        self
    }

    /// Builder-style setter for the release channel size.
    #[must_use]
    pub const fn with_release_bytes(mut self, bytes: usize) -> Self {
        self.release_bytes = bytes;
        self
    }

    /// Builder-style setter for the ack channel size.
    #[must_use]
    pub const fn with_ack_bytes(mut self, bytes: usize) -> Self {
        self.ack_bytes = bytes;
        self
    }
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Capacities used by command channels that do not bring their own.
    pub channel: ChannelConfig,
}

impl PipelineConfig {
    #[must_use]
    pub const fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values_are_sensible() {
        let config = SchedulerConfig::default();

        assert_eq!(config.pass_budget, Duration::from_millis(100));
        assert_eq!(config.poll_granularity_ms(), 1);
        assert_eq!(config.wait, WaitStrategy::Yield);
        assert!(config.core.is_none());
    }

    #[test]
    fn test_schedule_rate_maps_to_pass_budget() {
        let fast = SchedulerConfig::from_schedule_rate(Duration::from_micros(500));
        assert_eq!(fast.pass_budget_ms(), 100);

        let edge = SchedulerConfig::from_schedule_rate(Duration::from_millis(2));
        assert_eq!(edge.pass_budget_ms(), 2);

        let slow = SchedulerConfig::from_schedule_rate(Duration::from_millis(40));
        assert_eq!(slow.pass_budget_ms(), 40);
    }

    #[test]
    fn test_presets_are_valid() {
        let low = SchedulerConfig::low_latency();
        assert_eq!(low.wait, WaitStrategy::Spin);
        assert!(low.idle_backoff.is_zero());

        let relaxed = SchedulerConfig::relaxed();
        assert_eq!(relaxed.poll_granularity_ms(), 5);
        assert!(relaxed.idle_backoff > SchedulerConfig::default().idle_backoff);
    }

    #[test]
    fn test_builder_methods_work() {
        let config = SchedulerConfig::default()
            .with_pass_budget(Duration::from_millis(7))
            .with_poll_granularity(Duration::from_millis(2))
            .with_wait(WaitStrategy::Spin)
            .with_idle_backoff(Duration::ZERO)
            .with_core(3);

        assert_eq!(config.pass_budget_ms(), 7);
        assert_eq!(config.poll_granularity_ms(), 2);
        assert_eq!(config.wait, WaitStrategy::Spin);
        assert_eq!(config.core, Some(3));
    }

    #[test]
    #[should_panic(expected = "whole number of milliseconds")]
    fn test_fractional_granularity_panics() {
        let _ = SchedulerConfig::default().with_poll_granularity(Duration::from_micros(1500));
    }

    #[test]
    #[should_panic(expected = "pass_budget must be > 0")]
    fn test_zero_budget_panics() {
        let _ = SchedulerConfig::default().with_pass_budget(Duration::ZERO);
    }

    #[test]
    fn test_channel_config_builders() {
        let config = ChannelConfig::default()
            .with_pin_bytes(64)
            .with_i2c_bytes(128)
            .with_serial_bytes(32)
            .with_release_bytes(24)
            .with_ack_bytes(16);

        assert_eq!(config.pin_bytes, 64);
        assert_eq!(config.i2c_bytes, 128);
        assert_eq!(config.serial_bytes, 32);
        assert_eq!(config.release_bytes, 24);
        assert_eq!(config.ack_bytes, 16);

        let pipeline = PipelineConfig::default().with_channel(config);
        assert_eq!(pipeline.channel, config);
    }
}
