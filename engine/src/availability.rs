use crate::adapter::CallbackFlags;
use crate::component::StreamComponent;
use crate::config::StreamOptions;
use crate::device::Direction;
use crate::error::{DeviceError, Result, StreamError};
use crate::timing::{frames_to_duration, stepping_frames};
use std::time::{Duration, Instant};
use tracing::{debug, error};

const MIN_STEP: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Frames { frames: u32, flags: CallbackFlags },
    Xrun { capture: bool, playback: bool },
    TimedOut,
}

enum Check {
    Ready,
    Pending,
    Xrun,
}

/// Decides when and how many frames a stream iteration may move.
#[derive(Debug)]
pub(crate) struct AvailabilityEngine {
    sample_rate: f64,
    poll_timeout: Duration,
    max_frames: u32,
    never_drop_input: bool,
    margin_divisor: u32,
    skew_threshold_periods: u32,
    stall_timeout: Option<Duration>,
    last_progress: Instant,
}

impl AvailabilityEngine {
    pub(crate) fn new(
        sample_rate: f64,
        poll_timeout: Duration,
        max_frames: u32,
        options: &StreamOptions,
    ) -> Self {
        Self {
            sample_rate,
            poll_timeout,
            max_frames,
            never_drop_input: options.never_drop_input,
            margin_divisor: options.margin_divisor(),
            skew_threshold_periods: options.skew_threshold_periods.max(1),
            stall_timeout: options.stall_timeout(),
            last_progress: Instant::now(),
        }
    }

    pub(crate) fn mark_progress(&mut self) {
        self.last_progress = Instant::now();
    }

    fn check(c: &mut StreamComponent, want: Option<u32>) -> Result<Check> {
        let threshold = want.map_or(c.frames_per_period, |w| w.clamp(1, c.frames_per_period));
        match c.available() {
            Ok(avail) if avail >= threshold => Ok(Check::Ready),
            Ok(_) => Ok(Check::Pending),
            Err(DeviceError::Xrun) => Ok(Check::Xrun),
            Err(e) => Err(e.into_stream_error(c.name())),
        }
    }

    /// Frames the ready side `other` can still absorb before it over- or
    /// underruns, less the safety threshold. `None` when it already has.
    fn margin(&self, other: &mut StreamComponent) -> Result<Option<i64>> {
        let delay = match other.delay() {
            Ok(d) => d as i64,
            Err(DeviceError::Xrun) => return Ok(None),
            Err(e) => return Err(e.into_stream_error(other.name())),
        };
        let slack = match other.direction() {
            Direction::Capture => other.buffer_frames as i64 - delay,
            Direction::Playback => delay,
        };
        Ok(Some(slack - (other.frames_per_period / self.margin_divisor) as i64))
    }

    /// Applies the margin rule for a laggard while `other` is already
    /// ready. Returns whether to keep waiting for the laggard.
    fn continue_waiting(&self, other: &mut StreamComponent, deadline: &mut Instant) -> Result<bool> {
        match self.margin(other)? {
            None => Ok(false),
            Some(m) if m < 0 => {
                debug!("{} margin exhausted, no longer waiting for the other side", other.name());
                Ok(false)
            }
            Some(m) if m < other.frames_per_period as i64 => {
                let until = Instant::now() + frames_to_duration(m, self.sample_rate);
                if until < *deadline {
                    *deadline = until;
                }
                Ok(true)
            }
            Some(_) => Ok(true),
        }
    }

    fn stalled(&self) -> Result<WaitOutcome> {
        if let Some(limit) = self.stall_timeout {
            let idle = self.last_progress.elapsed();
            if idle > limit {
                error!("no frames became available for {:?}", idle);
                return Err(StreamError::DeviceLost(format!(
                    "no frames became available for {idle:?}"
                )));
            }
        }
        Ok(WaitOutcome::TimedOut)
    }

    /// Waits until every required side can move a period (or `want`
    /// frames, when smaller), an xrun is seen, or the poll timeout passes.
    pub(crate) fn wait(
        &mut self,
        mut capture: Option<&mut StreamComponent>,
        mut playback: Option<&mut StreamComponent>,
        want: Option<u32>,
    ) -> Result<WaitOutcome> {
        let duplex = capture.is_some() && playback.is_some();
        if let Some(c) = capture.as_deref_mut() {
            c.ready = false;
        }
        if let Some(p) = playback.as_deref_mut() {
            p.ready = false;
        }
        let mut wait_capture = capture.is_some();
        let mut wait_playback = playback.is_some();
        let mut deadline = Instant::now() + self.poll_timeout;
        let step =
            frames_to_duration(stepping_frames(self.sample_rate) as i64, self.sample_rate).max(MIN_STEP);

        loop {
            if wait_capture && let Some(c) = capture.as_deref_mut() {
                match Self::check(c, want)? {
                    Check::Ready => {
                        c.ready = true;
                        wait_capture = false;
                    }
                    Check::Pending => {}
                    Check::Xrun => {
                        return Ok(WaitOutcome::Xrun {
                            capture: true,
                            playback: false,
                        });
                    }
                }
            }
            if wait_playback && let Some(p) = playback.as_deref_mut() {
                match Self::check(p, want)? {
                    Check::Ready => {
                        p.ready = true;
                        wait_playback = false;
                    }
                    Check::Pending => {}
                    Check::Xrun => {
                        return Ok(WaitOutcome::Xrun {
                            capture: false,
                            playback: true,
                        });
                    }
                }
            }
            if !wait_capture && !wait_playback {
                break;
            }
            if duplex {
                if wait_playback && let Some(c) = capture.as_deref_mut().filter(|c| c.ready) {
                    wait_playback = self.continue_waiting(c, &mut deadline)?;
                }
                if wait_capture && let Some(p) = playback.as_deref_mut().filter(|p| p.ready) {
                    wait_capture = self.continue_waiting(p, &mut deadline)?;
                }
                if !wait_capture && !wait_playback {
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(step.min(deadline - now));
        }

        let capture_ready = capture.as_deref().is_some_and(|c| c.ready);
        let playback_ready = playback.as_deref().is_some_and(|p| p.ready);
        if !capture_ready && !playback_ready {
            return self.stalled();
        }
        self.last_progress = Instant::now();

        let mut capture_avail = None;
        if let Some(c) = capture.as_deref_mut().filter(|c| c.ready) {
            match c.available() {
                Ok(a) => capture_avail = Some(a),
                Err(DeviceError::Xrun) => {
                    return Ok(WaitOutcome::Xrun {
                        capture: true,
                        playback: false,
                    });
                }
                Err(e) => return Err(e.into_stream_error(c.name())),
            }
        }
        let mut playback_avail = None;
        if let Some(p) = playback.as_deref_mut().filter(|p| p.ready) {
            match p.available() {
                Ok(a) => playback_avail = Some(a),
                Err(DeviceError::Xrun) => {
                    return Ok(WaitOutcome::Xrun {
                        capture: false,
                        playback: true,
                    });
                }
                Err(e) => return Err(e.into_stream_error(p.name())),
            }
        }

        match (capture_avail, playback_avail) {
            (Some(ca), Some(pa)) => {
                let cycle = ca.min(pa).min(self.max_frames);
                let limit = capture
                    .as_deref()
                    .map_or(0, |c| c.frames_per_period)
                    .saturating_mul(self.skew_threshold_periods);
                if ca - cycle > limit {
                    debug!("capture backlog of {} frames exceeds {}", ca - cycle, limit);
                    return self.capture_only(capture, playback, ca);
                }
                Ok(WaitOutcome::Frames {
                    frames: ca.min(pa),
                    flags: CallbackFlags::NONE,
                })
            }
            (Some(ca), None) if duplex => self.capture_only(capture, playback, ca),
            (None, Some(pa)) if duplex => Ok(WaitOutcome::Frames {
                frames: pa,
                flags: CallbackFlags::INPUT_UNDERFLOW,
            }),
            (Some(frames), None) | (None, Some(frames)) => Ok(WaitOutcome::Frames {
                frames,
                flags: CallbackFlags::NONE,
            }),
            (None, None) => Ok(WaitOutcome::TimedOut),
        }
    }

    /// Capture is ahead of playback: drop a period of input, or with
    /// `never_drop_input` process input while discarding output.
    fn capture_only(
        &self,
        capture: Option<&mut StreamComponent>,
        playback: Option<&mut StreamComponent>,
        capture_avail: u32,
    ) -> Result<WaitOutcome> {
        let frames = capture_avail.min(self.max_frames);
        if self.never_drop_input {
            if let Some(p) = playback {
                p.ready = false;
            }
            return Ok(WaitOutcome::Frames {
                frames,
                flags: CallbackFlags::OUTPUT_OVERFLOW,
            });
        }
        if let Some(c) = capture {
            c.ready = false;
            match c.discard_input(frames) {
                Ok(_) => {}
                Err(DeviceError::Xrun) => {
                    return Ok(WaitOutcome::Xrun {
                        capture: true,
                        playback: false,
                    });
                }
                Err(e) => return Err(e.into_stream_error(c.name())),
            }
        }
        Ok(WaitOutcome::Frames {
            frames: 0,
            flags: CallbackFlags::INPUT_OVERFLOW,
        })
    }
}
