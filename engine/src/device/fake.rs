use super::{Bounds, DeviceHandle, Direction, HostBuffer};
use crate::error::DeviceError;
use std::collections::VecDeque;

/// Deterministic handle for unit tests: availability and delay are set by
/// the test, transfers move no samples.
pub(crate) struct FakeDevice {
    pub(crate) direction: Direction,
    pub(crate) channels: u16,
    pub(crate) avail: u32,
    pub(crate) scripted: VecDeque<Result<u32, DeviceError>>,
    pub(crate) delay: Result<u32, DeviceError>,
    running: bool,
}

impl FakeDevice {
    pub(crate) fn new(direction: Direction, avail: u32) -> Self {
        Self {
            direction,
            channels: 2,
            avail,
            scripted: VecDeque::new(),
            delay: Ok(0),
            running: false,
        }
    }
}

impl DeviceHandle for FakeDevice {
    fn name(&self) -> &str {
        "fake"
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
        Bounds::new(16, 4096)
    }

    fn buffer_bounds(&self) -> Bounds {
        Bounds::new(32, 16384)
    }

    fn test_period(&self, _frames: u32) -> bool {
        true
    }

    fn set_period(&mut self, frames: u32) -> Result<u32, DeviceError> {
        Ok(frames)
    }

    fn set_buffer_size(&mut self, frames: u32) -> Result<u32, DeviceError> {
        Ok(frames)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self, _drain: bool) -> Result<(), DeviceError> {
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn available_frames(&mut self) -> Result<u32, DeviceError> {
        self.scripted.pop_front().unwrap_or(Ok(self.avail))
    }

    fn transfer(&mut self, _buffer: HostBuffer<'_>, frames: u32) -> Result<u32, DeviceError> {
        Ok(frames.min(self.avail))
    }

    fn delay_frames(&mut self) -> Result<u32, DeviceError> {
        self.delay.clone()
    }
}
