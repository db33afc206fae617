#![allow(dead_code)]

use pcmflow_engine::device::{Bounds, DeviceHandle, Direction, HostBuffer};
use pcmflow_engine::{CallbackFlags, DeviceError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const PERIOD: u32 = 256;

/// State of a [`ScriptedDevice`], shared with the test that drives it.
#[derive(Debug, Default)]
pub struct Script {
    /// Availability reported once the queue is empty.
    pub avail: u32,
    /// Availabilities reported before falling back to `avail`.
    pub queue: VecDeque<u32>,
    pub delay: u32,
    /// Report an xrun on this availability query counted while running.
    pub xrun_on_call: Option<u64>,
    /// Report the device as gone from this running query on.
    pub lost_on_call: Option<u64>,
    pub running_calls: u64,
    pub starts: u32,
    pub stops: u32,
    pub transferred: u64,
    pub running: bool,
    /// The `drain` argument of every stop, in order.
    pub drains: Vec<bool>,
    /// Accept at most this many frames per playback transfer.
    pub short_write: Option<u32>,
}

/// A device whose fill level is set by the test. Transfers take `pace`
/// so a callback loop over it does not spin.
pub struct ScriptedDevice {
    name: String,
    direction: Direction,
    channels: u16,
    period: u32,
    pace: Duration,
    script: Arc<Mutex<Script>>,
}

impl ScriptedDevice {
    pub fn new(direction: Direction, avail: u32) -> (Self, Arc<Mutex<Script>>) {
        Self::with_period(direction, PERIOD, avail)
    }

    /// A device that only accepts `period` frames per period, with a
    /// buffer of two to four periods.
    pub fn with_period(
        direction: Direction,
        period: u32,
        avail: u32,
    ) -> (Self, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script {
            avail,
            ..Script::default()
        }));
        (
            Self {
                name: format!("scripted:{direction}"),
                direction,
                channels: 2,
                period,
                pace: Duration::from_millis(1),
                script: script.clone(),
            },
            script,
        )
    }

    /// Makes every transfer take `pace`.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }
}

impl DeviceHandle for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn channel_bounds(&self) -> (u16, u16) {
        (self.channels, self.channels)
    }

    fn set_channels(&mut self, channels: u16) -> Result<u16, DeviceError> {
        Ok(channels)
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<f64, DeviceError> {
        Ok(rate)
    }

    fn period_bounds(&self) -> Bounds {
        Bounds::new(self.period, self.period)
    }

    fn buffer_bounds(&self) -> Bounds {
        Bounds::new(2 * self.period, 4 * self.period)
    }

    fn test_period(&self, frames: u32) -> bool {
        frames == self.period
    }

    fn set_period(&mut self, _frames: u32) -> Result<u32, DeviceError> {
        Ok(self.period)
    }

    fn set_buffer_size(&mut self, frames: u32) -> Result<u32, DeviceError> {
        Ok(self.buffer_bounds().clamp(frames))
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let mut s = self.script.lock().unwrap();
        s.starts += 1;
        s.running = true;
        Ok(())
    }

    fn stop(&mut self, drain: bool) -> Result<(), DeviceError> {
        let mut s = self.script.lock().unwrap();
        s.stops += 1;
        s.drains.push(drain);
        s.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.script.lock().unwrap().running
    }

    fn available_frames(&mut self) -> Result<u32, DeviceError> {
        let mut s = self.script.lock().unwrap();
        if s.running {
            s.running_calls += 1;
            let call = s.running_calls;
            if s.lost_on_call.is_some_and(|k| call >= k) {
                return Err(DeviceError::Lost("unplugged".to_string()));
            }
            if s.xrun_on_call == Some(call) {
                return Err(DeviceError::Xrun);
            }
        }
        let default = s.avail;
        Ok(s.queue.pop_front().unwrap_or(default))
    }

    fn transfer(&mut self, buffer: HostBuffer<'_>, frames: u32) -> Result<u32, DeviceError> {
        let playback = matches!(buffer, HostBuffer::Playback(_));
        if let HostBuffer::Capture(out) = buffer {
            out.fill(0.5);
        }
        std::thread::sleep(self.pace);
        let mut s = self.script.lock().unwrap();
        let frames = match s.short_write {
            Some(limit) if playback => frames.min(limit),
            _ => frames,
        };
        s.transferred += frames as u64;
        Ok(frames)
    }

    fn delay_frames(&mut self) -> Result<u32, DeviceError> {
        Ok(self.script.lock().unwrap().delay)
    }
}

/// Flags seen by a callback, in order.
pub type FlagLog = Arc<Mutex<Vec<CallbackFlags>>>;

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
