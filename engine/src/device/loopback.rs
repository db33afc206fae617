use super::{Bounds, DeviceHandle, Direction, HostBuffer};
use crate::error::DeviceError;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

const MIN_PERIOD: u32 = 16;

/// A playback end whose frames come out of the paired capture end.
/// Neither end has a clock: availability is the ring's fill level and
/// stopping keeps queued frames so the capture side can still read them.
pub fn loopback_pair(channels: u16, capacity_frames: u32) -> (LoopbackPlayback, LoopbackCapture) {
    let channels = channels.max(1);
    let capacity_frames = capacity_frames.max(MIN_PERIOD * 2);
    let rb = HeapRb::<f32>::new(capacity_frames as usize * channels as usize);
    let (producer, consumer) = rb.split();
    (
        LoopbackPlayback {
            port: Port::new("loopback:playback", channels, capacity_frames),
            producer,
        },
        LoopbackCapture {
            port: Port::new("loopback:capture", channels, capacity_frames),
            consumer,
        },
    )
}

#[derive(Debug)]
struct Port {
    name: String,
    channels: u16,
    capacity: u32,
    rate: f64,
    running: bool,
}

impl Port {
    fn new(name: &str, channels: u16, capacity: u32) -> Self {
        Self {
            name: name.to_string(),
            channels,
            capacity,
            rate: 48_000.0,
            running: false,
        }
    }

    fn set_channels(&self, channels: u16) -> Result<u16, DeviceError> {
        if channels != self.channels {
            return Err(DeviceError::Rejected(format!(
                "{} carries exactly {} channels",
                self.name, self.channels
            )));
        }
        Ok(channels)
    }

    fn period_bounds(&self) -> Bounds {
        Bounds::new(MIN_PERIOD, self.capacity / 2)
    }

    fn buffer_bounds(&self) -> Bounds {
        Bounds::new(MIN_PERIOD * 2, self.capacity)
    }
}

pub struct LoopbackPlayback {
    port: Port,
    producer: HeapProd<f32>,
}

pub struct LoopbackCapture {
    port: Port,
    consumer: HeapCons<f32>,
}

macro_rules! impl_loopback_common {
    ($ty:ty, $direction:expr, $ring:ident) => {
        impl DeviceHandle for $ty {
            fn name(&self) -> &str {
                &self.port.name
            }

            fn direction(&self) -> Direction {
                $direction
            }

            fn channel_bounds(&self) -> (u16, u16) {
                (self.port.channels, self.port.channels)
            }

            fn set_channels(&mut self, channels: u16) -> Result<u16, DeviceError> {
                self.port.set_channels(channels)
            }

            fn set_sample_rate(&mut self, rate: f64) -> Result<f64, DeviceError> {
                self.port.rate = rate;
                Ok(rate)
            }

            fn period_bounds(&self) -> Bounds {
                self.port.period_bounds()
            }

            fn buffer_bounds(&self) -> Bounds {
                self.port.buffer_bounds()
            }

            fn test_period(&self, frames: u32) -> bool {
                self.port.period_bounds().contains(frames)
            }

            fn set_period(&mut self, frames: u32) -> Result<u32, DeviceError> {
                Ok(self.port.period_bounds().clamp(frames))
            }

            fn set_buffer_size(&mut self, _frames: u32) -> Result<u32, DeviceError> {
                Ok(self.port.capacity)
            }

            fn start(&mut self) -> Result<(), DeviceError> {
                self.port.running = true;
                Ok(())
            }

            fn stop(&mut self, _drain: bool) -> Result<(), DeviceError> {
                self.port.running = false;
                Ok(())
            }

            fn is_running(&self) -> bool {
                self.port.running
            }

            fn available_frames(&mut self) -> Result<u32, DeviceError> {
                Ok(self.available_samples() as u32 / self.port.channels as u32)
            }

            fn transfer(&mut self, buffer: HostBuffer<'_>, frames: u32) -> Result<u32, DeviceError> {
                self.move_samples(buffer, frames)
            }

            fn delay_frames(&mut self) -> Result<u32, DeviceError> {
                Ok(self.$ring.occupied_len() as u32 / self.port.channels as u32)
            }
        }
    };
}

impl LoopbackPlayback {
    fn available_samples(&self) -> usize {
        let ch = self.port.channels as usize;
        self.producer.vacant_len() / ch * ch
    }

    fn move_samples(&mut self, buffer: HostBuffer<'_>, frames: u32) -> Result<u32, DeviceError> {
        let HostBuffer::Playback(input) = buffer else {
            return Err(DeviceError::Io("loopback playback cannot capture".to_string()));
        };
        let ch = self.port.channels as usize;
        let n = (frames as usize * ch).min(input.len()).min(self.available_samples());
        let pushed = self.producer.push_slice(&input[..n]);
        Ok((pushed / ch) as u32)
    }
}

impl LoopbackCapture {
    fn available_samples(&self) -> usize {
        let ch = self.port.channels as usize;
        self.consumer.occupied_len() / ch * ch
    }

    fn move_samples(&mut self, buffer: HostBuffer<'_>, frames: u32) -> Result<u32, DeviceError> {
        let HostBuffer::Capture(out) = buffer else {
            return Err(DeviceError::Io("loopback capture cannot play".to_string()));
        };
        let ch = self.port.channels as usize;
        let n = (frames as usize * ch).min(out.len()).min(self.available_samples());
        let popped = self.consumer.pop_slice(&mut out[..n]);
        Ok((popped / ch) as u32)
    }
}

impl_loopback_common!(LoopbackPlayback, Direction::Playback, producer);
impl_loopback_common!(LoopbackCapture, Direction::Capture, consumer);
