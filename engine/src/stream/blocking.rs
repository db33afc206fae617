use super::StreamCore;
use super::state::{Shared, lock};
use crate::EngineContext;
use crate::adapter::CallbackFlags;
use crate::availability::WaitOutcome;
use crate::component::StreamComponent;
use crate::device::Direction;
use crate::error::{DeviceError, Result, StreamError};
use tracing::debug;

fn side(c: &mut Option<StreamComponent>, direction: Direction) -> Result<&mut StreamComponent> {
    c.as_mut().ok_or(match direction {
        Direction::Capture => StreamError::CanNotReadFromOutputOnlyStream,
        Direction::Playback => StreamError::CanNotWriteToInputOnlyStream,
    })
}

fn start_prepared(c: &mut StreamComponent, shared: &Shared) -> Result<()> {
    let _guard = lock(&shared.state_lock);
    c.start().map_err(|e| e.into_stream_error(c.name()))?;
    debug!("{} started by blocking i/o", c.name());
    Ok(())
}

impl StreamCore {
    pub(crate) fn read_blocking(
        &mut self,
        buffer: &mut [f32],
        shared: &Shared,
        ctx: &EngineContext,
    ) -> Result<CallbackFlags> {
        let channels = side(&mut self.capture, Direction::Capture)?.user_channels() as usize;
        let total = buffer.len() / channels;
        // Idle time between calls is not a stall.
        self.availability.mark_progress();
        let mut done = 0;
        while done < total {
            let capture = side(&mut self.capture, Direction::Capture)?;
            if !capture.is_running() {
                start_prepared(capture, shared)?;
            }
            let want = (total - done) as u32;
            match self.availability.wait(Some(capture), None, Some(want))? {
                WaitOutcome::TimedOut => continue,
                WaitOutcome::Xrun { .. } => {
                    self.recover(true, false, ctx.now_secs(), false, shared)?;
                    continue;
                }
                WaitOutcome::Frames { frames, .. } => {
                    let capture = side(&mut self.capture, Direction::Capture)?;
                    let n = frames.min(want);
                    let got = match capture.read_host(n) {
                        Ok(got) => got,
                        Err(DeviceError::Xrun) => {
                            self.recover(true, false, ctx.now_secs(), false, shared)?;
                            continue;
                        }
                        Err(e) => return Err(e.into_stream_error(capture.name())),
                    };
                    let user = &mut buffer[done * channels..];
                    done += self.adapter.copy_input(capture.host_region(got), user);
                }
            }
        }
        Ok(self.recovery.take_masked(CallbackFlags::INPUT_OVERFLOW))
    }

    pub(crate) fn write_blocking(
        &mut self,
        buffer: &[f32],
        shared: &Shared,
        ctx: &EngineContext,
    ) -> Result<CallbackFlags> {
        let channels = side(&mut self.playback, Direction::Playback)?.user_channels() as usize;
        let total = buffer.len() / channels;
        self.availability.mark_progress();
        let mut done = 0;
        while done < total {
            let playback = side(&mut self.playback, Direction::Playback)?;
            let want = (total - done) as u32;
            match self.availability.wait(None, Some(playback), Some(want))? {
                WaitOutcome::TimedOut => continue,
                WaitOutcome::Xrun { .. } => {
                    self.recover(false, true, ctx.now_secs(), false, shared)?;
                    continue;
                }
                WaitOutcome::Frames { frames, .. } => {
                    let playback = side(&mut self.playback, Direction::Playback)?;
                    let n = frames.min(want).min(playback.frames_per_period());
                    let user = &buffer[done * channels..(done + n as usize) * channels];
                    let copied = self.adapter.copy_output(user, playback.host_region_mut(n));
                    match playback.write_host(copied as u32) {
                        Ok(written) => done += written as usize,
                        Err(DeviceError::Xrun) => {
                            self.recover(false, true, ctx.now_secs(), false, shared)?;
                            continue;
                        }
                        Err(e) => return Err(e.into_stream_error(playback.name())),
                    }
                    // Prepared playback starts once a full period is queued.
                    if !playback.is_running()
                        && playback.delay().unwrap_or(0) >= playback.frames_per_period()
                    {
                        start_prepared(playback, shared)?;
                    }
                }
            }
        }
        Ok(self.recovery.take_masked(CallbackFlags::OUTPUT_UNDERFLOW))
    }

    pub(crate) fn available_blocking(
        &mut self,
        direction: Direction,
        shared: &Shared,
        ctx: &EngineContext,
    ) -> Result<u32> {
        let c = match direction {
            Direction::Capture => side(&mut self.capture, direction)?,
            Direction::Playback => side(&mut self.playback, direction)?,
        };
        match c.available() {
            Ok(n) => return Ok(n),
            Err(DeviceError::Xrun) => {}
            Err(e) => return Err(e.into_stream_error(c.name())),
        }
        let capture = direction == Direction::Capture;
        self.recover(capture, !capture, ctx.now_secs(), false, shared)?;
        let c = match direction {
            Direction::Capture => side(&mut self.capture, direction)?,
            Direction::Playback => side(&mut self.playback, direction)?,
        };
        c.available().map_err(|e| e.into_stream_error(c.name()))
    }
}
