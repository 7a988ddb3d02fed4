//! Command channel to scheduler throughput and round-trip benchmark.
//!
//! Usage:
//!     cargo run --release --bin traffic_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0   Pin the producing thread to CPU 0 (default: 0)
//!     SCHEDULER_CPU=2  Pin the scheduler thread to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::time::Instant;

use tollgate::hardware::ChannelBlocks;
use tollgate::{
    Bus, ChannelConfig, ChannelRequest, Clock, CommandChannel, Connection, HardwareBacking,
    LaneId, MonotonicClock, Pipeline, PipelineConfig, SchedulerConfig, SchedulerThread,
};

const ITERATIONS: usize = 1 << 20;
const PIN_BYTES: usize = 1 << 16;

/// Backing that drops every output.
struct NullBacking {
    clock: MonotonicClock,
    lanes: ChannelBlocks,
    writes: u64,
}

impl HardwareBacking for NullBacking {
    fn write(&mut self, _address: i32, _payload: &[u8]) {
        self.writes += 1;
    }

    fn read(&mut self, _address: i32, _length: usize) -> Vec<u8> {
        Vec::new()
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

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

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let scheduler_cpu = env::var("SCHEDULER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, scheduler_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn start(scheduler_cpu: Option<usize>) -> (CommandChannel, SchedulerThread<NullBacking>) {
    let config = PipelineConfig::default().with_channel(
        ChannelConfig::default()
            .with_pin_bytes(PIN_BYTES)
            .with_release_bytes(PIN_BYTES)
            .with_ack_bytes(PIN_BYTES),
    );
    let mut pipeline = Pipeline::new(config);
    let channel = pipeline
        .command_channel(ChannelRequest::new().pins())
        .unwrap();

    let mut scheduler_config = SchedulerConfig::low_latency();
    if let Some(core) = scheduler_cpu {
        scheduler_config = scheduler_config.with_core(core);
    }
    let hardware = NullBacking {
        clock: MonotonicClock::new(),
        lanes: ChannelBlocks::new(),
        writes: 0,
    };
    let scheduler = pipeline
        .scheduler(Bus::Pin, hardware, scheduler_config)
        .unwrap();
    let thread = SchedulerThread::spawn("bench-pins", scheduler).unwrap();
    (channel, thread)
}

fn bench_throughput(producer_cpu: Option<usize>, scheduler_cpu: Option<usize>) {
    let (channel, thread) = start(scheduler_cpu);
    pin_to_cpu(producer_cpu);
    let pin = Connection::digital(7);

    let start = Instant::now();

    let mut acked = 0;
    for _ in 0..ITERATIONS {
        while !channel.digital_pulse(pin) {
            acked += channel.poll_acks();
            hint::spin_loop();
        }
    }
    while acked < ITERATIONS {
        acked += channel.poll_acks();
        hint::spin_loop();
    }

    let elapsed = start.elapsed();
    assert!(channel.end_of_stream());
    let scheduler = thread.join().unwrap();
    assert_eq!(scheduler.stats().dispatched, 2 * ITERATIONS as u64);
    assert_eq!(scheduler.hardware().writes, 2 * ITERATIONS as u64);

    let pulses_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("{pulses_per_ms} pulses/ms");
}

fn bench_rtt(producer_cpu: Option<usize>, scheduler_cpu: Option<usize>) {
    let (channel, thread) = start(scheduler_cpu);
    pin_to_cpu(producer_cpu);
    let pin = Connection::digital(7);

    let start = Instant::now();

    for _ in 0..ITERATIONS {
        while !channel.set_value(pin, 1) {
            hint::spin_loop();
        }
        while channel.poll_acks() == 0 {
            hint::spin_loop();
        }
    }

    let elapsed = start.elapsed();
    assert!(channel.end_of_stream());
    thread.join().unwrap();

    let rtt_ns = elapsed.as_nanos() / ITERATIONS as u128;
    println!("{rtt_ns} ns release-to-ack RTT");
}

fn main() {
    tollgate::init_tracing();
    let (producer_cpu, scheduler_cpu) = get_cpu_affinity();

    println!("tollgate pin lane (pin_bytes={PIN_BYTES}, iters={ITERATIONS}):");
    bench_throughput(producer_cpu, scheduler_cpu);
    bench_rtt(producer_cpu, scheduler_cpu);
}
