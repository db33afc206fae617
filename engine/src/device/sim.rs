use super::{Bounds, DeviceHandle, Direction, HostBuffer};
use crate::error::DeviceError;
use crate::timing::FrameClock;
use std::sync::Arc;
use atomic_float::AtomicF32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const DRAIN_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimSignal {
    Silence,
    Sine { frequency: f64, amplitude: f32 },
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    pub direction: Direction,
    pub channels: (u16, u16),
    pub rates: Vec<f64>,
    pub period_bounds: Bounds,
    pub buffer_bounds: Bounds,
    pub max_periods: u32,
    pub power_of_two_periods: bool,
    pub signal: SimSignal,
    pub start_delay: Option<Duration>,
}

impl SimConfig {
    pub fn capture(name: &str) -> Self {
        Self {
            name: name.to_string(),
            direction: Direction::Capture,
            signal: SimSignal::Sine {
                frequency: 440.0,
                amplitude: 0.25,
            },
            ..Self::playback(name)
        }
    }

    pub fn playback(name: &str) -> Self {
        Self {
            name: name.to_string(),
            direction: Direction::Playback,
            channels: (1, 8),
            rates: vec![44_100.0, 48_000.0, 88_200.0, 96_000.0],
            period_bounds: Bounds::new(32, 8_192),
            buffer_bounds: Bounds::new(64, 65_536),
            max_periods: 16,
            power_of_two_periods: true,
            signal: SimSignal::Silence,
            start_delay: None,
        }
    }
}

/// Counters observable while a simulated device is owned by a stream.
#[derive(Debug)]
pub struct SimMonitor {
    frames: AtomicU64,
    xruns: AtomicU64,
    peak: AtomicF32,
}

impl Default for SimMonitor {
    fn default() -> Self {
        Self {
            frames: AtomicU64::new(0),
            xruns: AtomicU64::new(0),
            peak: AtomicF32::new(0.0),
        }
    }
}

impl SimMonitor {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> f32 {
        self.peak.load(Ordering::Relaxed)
    }

    fn add_frames(&self, n: u32) {
        self.frames.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn note_peak(&self, samples: &[f32]) {
        let peak = samples.iter().fold(0.0_f32, |p, s| p.max(s.abs()));
        self.peak.fetch_max(peak, Ordering::Relaxed);
    }
}

/// A virtual endpoint driven by the wall clock. Capture produces frames
/// and playback consumes them at the configured rate whether or not the
/// application keeps up, so late service overruns or underruns.
#[derive(Debug)]
pub struct SimulatedDevice {
    config: SimConfig,
    channels: u16,
    rate: f64,
    period: u32,
    buffer: u32,
    clock: Option<FrameClock>,
    appl_pos: u64,
    xrun: bool,
    phase: f64,
    monitor: Arc<SimMonitor>,
}

impl SimulatedDevice {
    pub fn new(config: SimConfig) -> Self {
        let channels = config.channels.0;
        let rate = config.rates.first().copied().unwrap_or(48_000.0);
        let period = config.period_bounds.min;
        let buffer = config.buffer_bounds.min;
        Self {
            config,
            channels,
            rate,
            period,
            buffer,
            clock: None,
            appl_pos: 0,
            xrun: false,
            phase: 0.0,
            monitor: Arc::new(SimMonitor::default()),
        }
    }

    pub fn monitor(&self) -> Arc<SimMonitor> {
        self.monitor.clone()
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    fn hw_pos(&self) -> u64 {
        self.clock.map(|c| c.now()).unwrap_or(0)
    }

    fn flag_xrun(&mut self) -> DeviceError {
        if !self.xrun {
            self.xrun = true;
            self.monitor.xruns.fetch_add(1, Ordering::Relaxed);
        }
        DeviceError::Xrun
    }

    fn reset(&mut self) {
        self.clock = None;
        self.appl_pos = 0;
        self.xrun = false;
    }

    fn fill_signal(&mut self, out: &mut [f32], frames: u32) {
        let ch = self.channels as usize;
        match self.config.signal {
            SimSignal::Silence => out[..frames as usize * ch].fill(0.0),
            SimSignal::Sine {
                frequency,
                amplitude,
            } => {
                let step = std::f64::consts::TAU * frequency / self.rate;
                for frame in out.chunks_mut(ch).take(frames as usize) {
                    let v = (self.phase.sin() as f32) * amplitude;
                    frame.fill(v);
                    self.phase = (self.phase + step) % std::f64::consts::TAU;
                }
            }
        }
    }

    fn drain(&mut self) {
        let Some(clock) = self.clock else {
            return;
        };
        let deadline = Instant::now() + DRAIN_LIMIT;
        let target = clock.instant_of(self.appl_pos).min(deadline);
        let now = Instant::now();
        if target > now {
            std::thread::sleep(target - now);
        }
    }
}

impl DeviceHandle for SimulatedDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn direction(&self) -> Direction {
        self.config.direction
    }

    fn channel_bounds(&self) -> (u16, u16) {
        self.config.channels
    }

    fn set_channels(&mut self, channels: u16) -> Result<u16, DeviceError> {
        let (min, max) = self.config.channels;
        if channels < min || channels > max {
            return Err(DeviceError::Rejected(format!(
                "{} channels outside {}..={}",
                channels, min, max
            )));
        }
        self.channels = channels;
        Ok(channels)
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<f64, DeviceError> {
        let nearest = self
            .config
            .rates
            .iter()
            .copied()
            .min_by(|a, b| (a - rate).abs().total_cmp(&(b - rate).abs()))
            .ok_or_else(|| DeviceError::Rejected("no sample rates".to_string()))?;
        self.rate = nearest;
        Ok(nearest)
    }

    fn period_bounds(&self) -> Bounds {
        self.config.period_bounds
    }

    fn buffer_bounds(&self) -> Bounds {
        self.config.buffer_bounds
    }

    fn max_periods(&self) -> u32 {
        self.config.max_periods
    }

    fn test_period(&self, frames: u32) -> bool {
        self.config.period_bounds.contains(frames)
            && (!self.config.power_of_two_periods || frames.is_power_of_two())
    }

    fn set_period(&mut self, frames: u32) -> Result<u32, DeviceError> {
        let mut period = self.config.period_bounds.clamp(frames);
        if self.config.power_of_two_periods && !period.is_power_of_two() {
            let up = period.next_power_of_two();
            let down = up / 2;
            period = if up - period <= period - down && self.config.period_bounds.contains(up) {
                up
            } else {
                down.max(self.config.period_bounds.min.next_power_of_two())
            };
        }
        self.period = period;
        Ok(period)
    }

    fn set_buffer_size(&mut self, frames: u32) -> Result<u32, DeviceError> {
        let buffer = self.config.buffer_bounds.clamp(frames);
        if buffer < self.period * 2 {
            return Err(DeviceError::Rejected(format!(
                "buffer {} cannot hold two periods of {}",
                buffer, self.period
            )));
        }
        self.buffer = buffer;
        Ok(buffer)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if let Some(delay) = self.config.start_delay {
            std::thread::sleep(delay);
        }
        if self.clock.is_none() {
            self.clock = Some(FrameClock::start(self.rate));
            self.xrun = false;
            if self.config.direction == Direction::Capture {
                self.appl_pos = 0;
            }
        }
        Ok(())
    }

    fn stop(&mut self, drain: bool) -> Result<(), DeviceError> {
        if drain && self.config.direction == Direction::Playback && !self.xrun {
            self.drain();
        }
        self.reset();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.clock.is_some()
    }

    fn available_frames(&mut self) -> Result<u32, DeviceError> {
        if self.xrun {
            return Err(DeviceError::Xrun);
        }
        let hw = self.hw_pos();
        match self.config.direction {
            Direction::Capture => {
                let avail = hw.saturating_sub(self.appl_pos);
                if avail > self.buffer as u64 {
                    return Err(self.flag_xrun());
                }
                Ok(avail as u32)
            }
            Direction::Playback => {
                if self.clock.is_some() && hw > self.appl_pos {
                    return Err(self.flag_xrun());
                }
                let queued = self.appl_pos - hw;
                Ok(self.buffer.saturating_sub(queued as u32))
            }
        }
    }

    fn transfer(&mut self, buffer: HostBuffer<'_>, frames: u32) -> Result<u32, DeviceError> {
        let avail = self.available_frames()?;
        let ch = self.channels as usize;
        let n = match buffer {
            HostBuffer::Capture(out) => {
                let n = frames.min(avail).min((out.len() / ch) as u32);
                self.fill_signal(out, n);
                self.monitor.note_peak(&out[..n as usize * ch]);
                n
            }
            HostBuffer::Playback(input) => {
                let n = frames.min(avail).min((input.len() / ch) as u32);
                self.monitor.note_peak(&input[..n as usize * ch]);
                n
            }
        };
        self.appl_pos += n as u64;
        self.monitor.add_frames(n);
        Ok(n)
    }

    fn delay_frames(&mut self) -> Result<u32, DeviceError> {
        if self.xrun {
            return Err(DeviceError::Xrun);
        }
        let hw = self.hw_pos();
        Ok(match self.config.direction {
            Direction::Capture => hw.saturating_sub(self.appl_pos) as u32,
            Direction::Playback => self.appl_pos.saturating_sub(hw) as u32,
        })
    }
}
