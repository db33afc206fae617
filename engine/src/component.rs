use crate::adapter::{HostRegion, HostRegionMut};
use crate::config::SAMPLE_RATE_TOLERANCE;
use crate::device::{DeviceHandle, Direction, HostBuffer, Layout};
use crate::error::{DeviceError, Result, StreamError};
use crate::negotiate::Settled;
use tracing::debug;

/// One direction of a stream: the device handle plus the geometry it was
/// negotiated to.
pub struct StreamComponent {
    handle: Box<dyn DeviceHandle>,
    direction: Direction,
    pub(crate) frames_per_period: u32,
    pub(crate) buffer_frames: u32,
    layout: Layout,
    host_channels: u16,
    user_channels: u16,
    pub(crate) ready: bool,
    host_buffer: Vec<f32>,
}

impl StreamComponent {
    pub(crate) fn configure(
        mut handle: Box<dyn DeviceHandle>,
        direction: Direction,
        user_channels: u16,
        sample_rate: f64,
    ) -> Result<(Self, f64)> {
        if handle.direction() != direction {
            return Err(StreamError::InvalidConfiguration(format!(
                "{} is a {} device, not {}",
                handle.name(),
                handle.direction(),
                direction
            )));
        }
        if user_channels == 0 {
            return Err(StreamError::InvalidConfiguration(format!(
                "{direction} needs at least one channel"
            )));
        }
        let (min_ch, max_ch) = handle.channel_bounds();
        if user_channels > max_ch {
            return Err(StreamError::UnsupportedChannelCount {
                direction,
                requested: user_channels,
                max: max_ch,
            });
        }
        let wanted = user_channels.max(min_ch);
        let host_channels = handle
            .set_channels(wanted)
            .map_err(|e| e.into_stream_error(handle.name()))?;

        let actual = handle
            .set_sample_rate(sample_rate)
            .map_err(|e| e.into_stream_error(handle.name()))?;
        if sample_rate <= 0.0 || (actual - sample_rate).abs() / sample_rate > SAMPLE_RATE_TOLERANCE {
            return Err(StreamError::UnsupportedSampleRate {
                requested: sample_rate,
                actual,
            });
        }
        debug!(
            "{} {} configured: host_channels={} user_channels={} rate={} format={:?}",
            handle.name(),
            direction,
            host_channels,
            user_channels,
            actual,
            handle.native_format()
        );
        let layout = handle.layout();
        Ok((
            Self {
                handle,
                direction,
                frames_per_period: 0,
                buffer_frames: 0,
                layout,
                host_channels,
                user_channels,
                ready: false,
                host_buffer: Vec::new(),
            },
            actual,
        ))
    }

    pub(crate) fn apply(&mut self, settled: Settled) {
        self.frames_per_period = settled.period;
        self.buffer_frames = settled.buffer;
        self.host_buffer = vec![0.0; settled.period as usize * self.host_channels() as usize];
        debug!(
            "{} {} geometry: period={} buffer={} layout={:?}",
            self.name(),
            self.direction,
            settled.period,
            settled.buffer,
            self.layout
        );
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn frames_per_period(&self) -> u32 {
        self.frames_per_period
    }

    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    pub fn host_channels(&self) -> u16 {
        self.host_channels
    }

    pub fn user_channels(&self) -> u16 {
        self.user_channels
    }

    #[cfg(test)]
    pub(crate) fn handle_mut(&mut self) -> &mut dyn DeviceHandle {
        self.handle.as_mut()
    }

    pub(crate) fn negotiation_entry(&mut self, latency: f64) -> (&mut dyn DeviceHandle, f64) {
        (self.handle.as_mut(), latency)
    }

    pub(crate) fn latency_seconds(&self, sample_rate: f64) -> f64 {
        if sample_rate <= 0.0 {
            return 0.0;
        }
        self.buffer_frames.saturating_sub(self.frames_per_period) as f64 / sample_rate
    }

    pub(crate) fn available(&mut self) -> std::result::Result<u32, DeviceError> {
        self.handle.available_frames()
    }

    pub(crate) fn delay(&mut self) -> std::result::Result<u32, DeviceError> {
        self.handle.delay_frames()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub(crate) fn start(&mut self) -> std::result::Result<(), DeviceError> {
        self.handle.start()
    }

    pub(crate) fn stop(&mut self, drain: bool) -> std::result::Result<(), DeviceError> {
        self.ready = false;
        self.handle.stop(drain)
    }

    fn chunk_samples(&self, frames: u32) -> usize {
        frames.min(self.frames_per_period) as usize * self.host_channels as usize
    }

    /// Reads up to one period into the host buffer.
    pub(crate) fn read_host(&mut self, frames: u32) -> std::result::Result<u32, DeviceError> {
        let n = self.chunk_samples(frames);
        let frames = frames.min(self.frames_per_period);
        self.handle
            .transfer(HostBuffer::Capture(&mut self.host_buffer[..n]), frames)
    }

    /// Writes up to one period from the host buffer.
    pub(crate) fn write_host(&mut self, frames: u32) -> std::result::Result<u32, DeviceError> {
        let n = self.chunk_samples(frames);
        let frames = frames.min(self.frames_per_period);
        self.handle
            .transfer(HostBuffer::Playback(&self.host_buffer[..n]), frames)
    }

    pub(crate) fn host_region(&self, frames: u32) -> HostRegion<'_> {
        let n = self.chunk_samples(frames);
        HostRegion::new(
            &self.host_buffer[..n],
            self.host_channels as usize,
            frames.min(self.frames_per_period) as usize,
            self.layout,
        )
    }

    pub(crate) fn host_region_mut(&mut self, frames: u32) -> HostRegionMut<'_> {
        let n = self.chunk_samples(frames);
        HostRegionMut::new(
            &mut self.host_buffer[..n],
            self.host_channels as usize,
            frames.min(self.frames_per_period) as usize,
            self.layout,
        )
    }

    /// Fills whatever the playback buffer can take with silence.
    pub(crate) fn prime_silence(&mut self) -> std::result::Result<u32, DeviceError> {
        self.host_buffer.fill(0.0);
        let mut written = 0;
        while written < self.buffer_frames {
            let avail = self.handle.available_frames()?.min(self.buffer_frames - written);
            if avail == 0 {
                break;
            }
            let n = self.write_host(avail)?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }

    /// Reads and throws away up to one period of input.
    pub(crate) fn discard_input(&mut self, frames: u32) -> std::result::Result<u32, DeviceError> {
        self.read_host(frames)
    }
}

/// Starts the hardware. In callback mode playback is primed with silence
/// and started; in blocking mode it stays prepared until the first period
/// is written.
pub(crate) fn start_all(
    capture: Option<&mut StreamComponent>,
    playback: Option<&mut StreamComponent>,
    callback_mode: bool,
) -> std::result::Result<(), DeviceError> {
    if let Some(p) = playback
        && callback_mode
    {
        p.prime_silence()?;
        p.start()?;
    }
    if let Some(c) = capture {
        c.start()?;
    }
    Ok(())
}

pub(crate) fn stop_all(
    capture: Option<&mut StreamComponent>,
    playback: Option<&mut StreamComponent>,
    drain: bool,
) -> std::result::Result<(), DeviceError> {
    let playback_result = playback.map_or(Ok(()), |p| p.stop(drain));
    let capture_result = capture.map_or(Ok(()), |c| c.stop(false));
    playback_result.and(capture_result)
}
