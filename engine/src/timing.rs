use atomic_float::AtomicF64;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::info;

const CPU_LOAD_SMOOTHING: f64 = 0.1;
const PROFILE_INTERVAL: Duration = Duration::from_secs(1);

pub fn poll_timeout(frames: u32, sample_rate: f64) -> Duration {
    if sample_rate <= 0.0 {
        return Duration::ZERO;
    }
    let ms = (1000.0 * frames as f64 / sample_rate).ceil();
    Duration::from_millis(ms as u64)
}

pub fn frames_to_duration(frames: i64, sample_rate: f64) -> Duration {
    if frames <= 0 || sample_rate <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / sample_rate)
}

pub fn stepping_frames(sample_rate: f64) -> u32 {
    16 * (1 + (sample_rate as u32 / 50_000))
}

#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    zero: Instant,
    sample_rate: f64,
}

impl FrameClock {
    pub fn start(sample_rate: f64) -> Self {
        Self {
            zero: Instant::now(),
            sample_rate,
        }
    }

    pub fn now(&self) -> u64 {
        let ns = self.zero.elapsed().as_nanos();
        ((ns * self.sample_rate as u128) / 1_000_000_000_u128) as u64
    }

    pub fn instant_of(&self, frame: u64) -> Instant {
        self.zero + Duration::from_secs_f64(frame as f64 / self.sample_rate)
    }

    pub fn sleep_until_frame(&self, frame: u64) {
        let wake = self.instant_of(frame);
        let now = Instant::now();
        if wake > now {
            std::thread::sleep(wake - now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeInfo {
    pub current_time: f64,
    pub input_adc_time: f64,
    pub output_dac_time: f64,
}

impl TimeInfo {
    pub fn compute(
        current_time: f64,
        sample_rate: f64,
        capture_delay: Option<u32>,
        playback_delay: Option<u32>,
    ) -> Self {
        let input_adc_time = match capture_delay {
            Some(d) if sample_rate > 0.0 => current_time - d as f64 / sample_rate,
            _ => current_time,
        };
        let output_dac_time = match playback_delay {
            Some(d) if sample_rate > 0.0 => current_time + d as f64 / sample_rate,
            _ => current_time,
        };
        Self {
            current_time,
            input_adc_time,
            output_dac_time,
        }
    }
}

/// Exponentially smoothed fraction of the available time spent in the
/// callback. Written by the worker, read from any thread.
#[derive(Debug)]
pub struct CpuLoad {
    value: AtomicF64,
}

impl Default for CpuLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuLoad {
    pub fn new() -> Self {
        Self {
            value: AtomicF64::new(0.0),
        }
    }

    pub fn load(&self) -> f64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0.0, Ordering::Relaxed);
    }

    pub fn measure(&self, elapsed: Duration, frames: u32, sample_rate: f64) {
        if frames == 0 || sample_rate <= 0.0 {
            return;
        }
        let available = frames as f64 / sample_rate;
        let measured = elapsed.as_secs_f64() / available;
        let avg = self.load();
        let next = avg * (1.0 - CPU_LOAD_SMOOTHING) + measured * CPU_LOAD_SMOOTHING;
        self.value.store(next, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub(crate) struct CycleProfiler {
    report_at: Instant,
    cycle_count: u64,
    cycle_time_ns: u128,
    frame_count: u64,
    wait_count: u64,
    wait_time_ns: u128,
    xrun_count: u64,
}

impl CycleProfiler {
    pub(crate) fn new() -> Self {
        Self {
            report_at: Instant::now() + PROFILE_INTERVAL,
            cycle_count: 0,
            cycle_time_ns: 0,
            frame_count: 0,
            wait_count: 0,
            wait_time_ns: 0,
            xrun_count: 0,
        }
    }

    pub(crate) fn record_wait(&mut self, elapsed: Duration) {
        self.wait_count += 1;
        self.wait_time_ns += elapsed.as_nanos();
    }

    pub(crate) fn record_cycle(&mut self, elapsed: Duration, frames: u32) {
        self.cycle_count += 1;
        self.cycle_time_ns += elapsed.as_nanos();
        self.frame_count += frames as u64;
    }

    pub(crate) fn record_xrun(&mut self) {
        self.xrun_count += 1;
    }

    pub(crate) fn maybe_report(&mut self, period_frames: u32, sample_rate: f64, label: &str) {
        let now = Instant::now();
        if now < self.report_at {
            return;
        }
        let cycle_avg_us = if self.cycle_count > 0 {
            (self.cycle_time_ns / self.cycle_count as u128) as f64 / 1_000.0
        } else {
            0.0
        };
        let wait_avg_us = if self.wait_count > 0 {
            (self.wait_time_ns / self.wait_count as u128) as f64 / 1_000.0
        } else {
            0.0
        };
        let expected_cycles_per_sec = if period_frames > 0 {
            sample_rate / period_frames as f64
        } else {
            0.0
        };
        info!(
            "{} profile: expected_cps={:.1} cycles={} frames={} cycle_avg_us={:.1} waits={} wait_avg_us={:.1} xruns={}",
            label,
            expected_cycles_per_sec,
            self.cycle_count,
            self.frame_count,
            cycle_avg_us,
            self.wait_count,
            wait_avg_us,
            self.xrun_count
        );
        *self = Self::new();
    }
}
