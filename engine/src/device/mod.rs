#[cfg(test)]
pub(crate) mod fake;
mod loopback;
mod sim;

pub use loopback::{LoopbackCapture, LoopbackPlayback, loopback_pair};
pub use sim::{SimConfig, SimMonitor, SimSignal, SimulatedDevice};

use crate::error::DeviceError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Capture,
    Playback,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Capture => write!(f, "capture"),
            Direction::Playback => write!(f, "playback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    S32,
    S24,
    S16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Interleaved,
    Planar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: u32,
    pub max: u32,
}

impl Bounds {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: u32) -> u32 {
        value.clamp(self.min, self.max.max(self.min))
    }

    pub fn intersect(&self, other: &Bounds) -> Option<Bounds> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(Bounds { min, max })
    }
}

/// Sample storage handed to [`DeviceHandle::transfer`]. The slice holds
/// `frames * channels` host samples in the handle's [`Layout`].
pub enum HostBuffer<'a> {
    Capture(&'a mut [f32]),
    Playback(&'a [f32]),
}

/// One direction of an audio endpoint.
///
/// After `stop` the handle is prepared: a playback handle accepts writes
/// (used to prime it with silence) and starts consuming on `start`.
pub trait DeviceHandle: Send {
    fn name(&self) -> &str;
    fn direction(&self) -> Direction;

    fn channel_bounds(&self) -> (u16, u16);
    fn set_channels(&mut self, channels: u16) -> Result<u16, DeviceError>;
    fn native_format(&self) -> SampleFormat {
        SampleFormat::F32
    }
    fn layout(&self) -> Layout {
        Layout::Interleaved
    }
    /// Returns the exact rate the device configured.
    fn set_sample_rate(&mut self, rate: f64) -> Result<f64, DeviceError>;

    fn period_bounds(&self) -> Bounds;
    fn buffer_bounds(&self) -> Bounds;
    fn max_periods(&self) -> u32 {
        u32::MAX
    }
    fn test_period(&self, frames: u32) -> bool;
    /// Sets the period nearest to `frames` and returns what was applied.
    fn set_period(&mut self, frames: u32) -> Result<u32, DeviceError>;
    fn set_buffer_size(&mut self, frames: u32) -> Result<u32, DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;
    fn stop(&mut self, drain: bool) -> Result<(), DeviceError>;
    fn is_running(&self) -> bool;

    /// Frames that can be transferred right now; `Err(Xrun)` once the
    /// handle over- or underran.
    fn available_frames(&mut self) -> Result<u32, DeviceError>;
    fn transfer(&mut self, buffer: HostBuffer<'_>, frames: u32) -> Result<u32, DeviceError>;
    /// Capture: frames captured but not yet read. Playback: frames queued
    /// but not yet played.
    fn delay_frames(&mut self) -> Result<u32, DeviceError>;
}

pub(crate) fn host_offset(layout: Layout, channels: usize, frames: usize, frame: usize, ch: usize) -> usize {
    match layout {
        Layout::Interleaved => frame * channels + ch,
        Layout::Planar => ch * frames + frame,
    }
}
