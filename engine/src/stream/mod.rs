mod blocking;
mod state;
mod worker;

pub use state::{FinishReason, FinishedCallback, StreamState};

use crate::EngineContext;
use crate::adapter::{BlockAdapter, CallbackFlags, SampleAdapter, StreamCallback};
use crate::availability::AvailabilityEngine;
use crate::component::{StreamComponent, start_all, stop_all};
use crate::config::{SAMPLE_RATE_TOLERANCE, StreamOptions};
use crate::device::{DeviceHandle, Direction};
use crate::error::{Result, StreamError};
use crate::negotiate::{HostBufferSizeMode, NegotiationRequest, negotiate};
use crate::xrun::{StreamStats, XrunRecovery};
use state::{Shared, lock};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use tracing::{debug, error, info};
use worker::WorkerSettings;

/// One direction of a stream to be opened.
pub struct DirectionParams {
    pub handle: Box<dyn DeviceHandle>,
    pub channels: u16,
    /// Requested latency in seconds.
    pub suggested_latency: f64,
}

impl DirectionParams {
    pub fn new(handle: Box<dyn DeviceHandle>, channels: u16, suggested_latency: f64) -> Self {
        Self {
            handle,
            channels,
            suggested_latency,
        }
    }
}

pub struct StreamParams {
    pub capture: Option<DirectionParams>,
    pub playback: Option<DirectionParams>,
    pub sample_rate: f64,
    pub frames_per_buffer: Option<u32>,
    pub options: StreamOptions,
}

impl StreamParams {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            capture: None,
            playback: None,
            sample_rate,
            frames_per_buffer: None,
            options: StreamOptions::default(),
        }
    }

    pub fn capture(mut self, params: DirectionParams) -> Self {
        self.capture = Some(params);
        self
    }

    pub fn playback(mut self, params: DirectionParams) -> Self {
        self.playback = Some(params);
        self
    }

    pub fn frames_per_buffer(mut self, frames: u32) -> Self {
        self.frames_per_buffer = Some(frames);
        self
    }

    pub fn options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub sample_rate: f64,
    pub input_latency: f64,
    pub output_latency: f64,
    pub capture_period: Option<u32>,
    pub playback_period: Option<u32>,
    pub capture_buffer: Option<u32>,
    pub playback_buffer: Option<u32>,
    pub host_buffer_mode: HostBufferSizeMode,
    pub max_frames_per_host_buffer: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Blocking,
    Callback,
}

/// The part of a stream the worker owns while it runs.
pub(crate) struct StreamCore {
    pub(crate) capture: Option<StreamComponent>,
    pub(crate) playback: Option<StreamComponent>,
    pub(crate) adapter: Box<dyn SampleAdapter>,
    pub(crate) availability: AvailabilityEngine,
    pub(crate) recovery: XrunRecovery,
}

impl StreamCore {
    pub(crate) fn recover(
        &mut self,
        capture_xrun: bool,
        playback_xrun: bool,
        now: f64,
        callback_mode: bool,
        shared: &Shared,
    ) -> Result<()> {
        self.recovery.recover(
            self.capture.as_mut(),
            self.playback.as_mut(),
            capture_xrun,
            playback_xrun,
            now,
            callback_mode,
            &shared.state_lock,
            &shared.counters,
        )?;
        self.availability.mark_progress();
        Ok(())
    }

    fn reset(&mut self) {
        self.adapter.reset();
        self.recovery.reset();
        self.availability.mark_progress();
    }
}

fn lost_core() -> StreamError {
    StreamError::InternalError("stream worker panicked and took the devices with it".to_string())
}

pub struct Stream {
    ctx: EngineContext,
    mode: Mode,
    options: StreamOptions,
    info: StreamInfo,
    shared: Arc<Shared>,
    core: Option<StreamCore>,
    worker: Option<JoinHandle<StreamCore>>,
}

impl Stream {
    /// Opens a stream driven by `read`/`write`.
    pub fn open_blocking(ctx: &EngineContext, params: StreamParams) -> Result<Self> {
        let (user_in, user_out) = user_channels(&params);
        let adapter = BlockAdapter::blocking(user_in, user_out);
        Self::open(ctx, params, Box::new(adapter), Mode::Blocking)
    }

    /// Opens a stream whose worker thread invokes `callback` once per user
    /// buffer.
    pub fn open_callback(
        ctx: &EngineContext,
        params: StreamParams,
        callback: StreamCallback,
    ) -> Result<Self> {
        let (user_in, user_out) = user_channels(&params);
        let block = params.frames_per_buffer.map(|f| f as usize);
        let adapter = BlockAdapter::new(callback, user_in, user_out, block);
        Self::open(ctx, params, Box::new(adapter), Mode::Callback)
    }

    /// Opens a callback stream around a caller-supplied adapter.
    pub fn open_with_adapter(
        ctx: &EngineContext,
        params: StreamParams,
        adapter: Box<dyn SampleAdapter>,
    ) -> Result<Self> {
        Self::open(ctx, params, adapter, Mode::Callback)
    }

    fn open(
        ctx: &EngineContext,
        params: StreamParams,
        adapter: Box<dyn SampleAdapter>,
        mode: Mode,
    ) -> Result<Self> {
        let options = params.options.with_env_overrides();
        let requested = params.sample_rate;
        if !(requested.is_finite() && requested > 0.0) {
            return Err(StreamError::InvalidConfiguration(format!(
                "sample rate {requested} is not positive"
            )));
        }

        let mut capture = None;
        let mut capture_latency = 0.0;
        let mut sample_rate = None;
        if let Some(p) = params.capture {
            let (c, rate) =
                StreamComponent::configure(p.handle, Direction::Capture, p.channels, requested)?;
            capture = Some(c);
            capture_latency = p.suggested_latency;
            sample_rate = Some(rate);
        }
        let mut playback = None;
        let mut playback_latency = 0.0;
        if let Some(p) = params.playback {
            let (c, rate) =
                StreamComponent::configure(p.handle, Direction::Playback, p.channels, requested)?;
            if let Some(capture_rate) = sample_rate
                && (rate - capture_rate).abs() / capture_rate > SAMPLE_RATE_TOLERANCE
            {
                return Err(StreamError::UnsupportedSampleRate {
                    requested: capture_rate,
                    actual: rate,
                });
            }
            playback = Some(c);
            playback_latency = p.suggested_latency;
            sample_rate = sample_rate.or(Some(rate));
        }
        let Some(sample_rate) = sample_rate else {
            return Err(StreamError::InvalidConfiguration(
                "stream needs at least one direction".to_string(),
            ));
        };

        let request = NegotiationRequest {
            sample_rate,
            frames_per_buffer: params.frames_per_buffer,
            num_periods: options.num_periods(),
        };
        let negotiated = negotiate(
            capture.as_mut().map(|c| c.negotiation_entry(capture_latency)),
            playback.as_mut().map(|c| c.negotiation_entry(playback_latency)),
            &request,
        )?;
        if let (Some(c), Some(s)) = (capture.as_mut(), negotiated.capture) {
            c.apply(s);
        }
        if let (Some(p), Some(s)) = (playback.as_mut(), negotiated.playback) {
            p.apply(s);
        }

        let info = StreamInfo {
            sample_rate,
            input_latency: capture
                .as_ref()
                .map_or(0.0, |c| c.latency_seconds(sample_rate)),
            output_latency: playback
                .as_ref()
                .map_or(0.0, |p| p.latency_seconds(sample_rate)),
            capture_period: capture.as_ref().map(StreamComponent::frames_per_period),
            playback_period: playback.as_ref().map(StreamComponent::frames_per_period),
            capture_buffer: capture.as_ref().map(StreamComponent::buffer_frames),
            playback_buffer: playback.as_ref().map(StreamComponent::buffer_frames),
            host_buffer_mode: negotiated.mode,
            max_frames_per_host_buffer: negotiated.max_frames_per_host_buffer,
        };
        info!(
            "{} opened {:?} stream: rate={} capture={:?} playback={:?} mode={:?}",
            ctx.label(),
            mode,
            sample_rate,
            info.capture_period,
            info.playback_period,
            info.host_buffer_mode
        );

        let availability = AvailabilityEngine::new(
            sample_rate,
            negotiated.poll_timeout,
            negotiated.max_frames_per_host_buffer,
            &options,
        );
        Ok(Self {
            ctx: ctx.clone(),
            mode,
            options,
            info,
            shared: Arc::new(Shared::new()),
            core: Some(StreamCore {
                capture,
                playback,
                adapter,
                availability,
                recovery: XrunRecovery::default(),
            }),
            worker: None,
        })
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == StreamState::Active
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == StreamState::Stopped
    }

    /// Seconds on the engine clock; the time base of [`crate::timing::TimeInfo`].
    pub fn time(&self) -> f64 {
        self.ctx.now_secs()
    }

    pub fn cpu_load(&self) -> f64 {
        self.shared.cpu_load.load()
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.counters.snapshot()
    }

    /// Registers a closure called once whenever a callback run ends.
    pub fn set_finished_callback(&mut self, callback: Option<FinishedCallback>) {
        self.shared.set_finished_callback(callback);
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(core) => self.core = Some(core),
                Err(_) => error!("{} stream worker panicked", self.ctx.label()),
            }
        }
        self.shared.set_state(StreamState::Stopped);
    }

    /// Returns a fatal error raised by the worker, once.
    fn surface_fatal(&mut self) -> Result<()> {
        match self.shared.take_fatal() {
            Some(e) => {
                self.join_worker();
                Err(e)
            }
            None => Ok(()),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.surface_fatal()?;
        match self.state() {
            StreamState::Active => return Ok(()),
            StreamState::CallbackFinished | StreamState::Stopped => self.join_worker(),
        }
        let mut core = self.core.take().ok_or_else(lost_core)?;
        core.reset();
        self.shared.cpu_load.reset();
        self.shared.prepare_run();

        match self.mode {
            Mode::Blocking => {
                let started = {
                    let _guard = lock(&self.shared.state_lock);
                    start_all(core.capture.as_mut(), core.playback.as_mut(), false)
                };
                self.core = Some(core);
                started.map_err(|e| {
                    let e = e.into_stream_error(self.ctx.label());
                    error!("{} failed to start: {}", self.ctx.label(), e);
                    e
                })?;
                self.shared.set_state(StreamState::Active);
                Ok(())
            }
            Mode::Callback => self.spawn_worker(core),
        }
    }

    fn spawn_worker(&mut self, core: StreamCore) -> Result<()> {
        let settings = WorkerSettings {
            sample_rate: self.info.sample_rate,
            mode: self.info.host_buffer_mode,
            max_frames: self.info.max_frames_per_host_buffer,
            realtime: self.options.realtime,
            realtime_priority: self.options.realtime_priority,
            lock_memory: self.options.lock_memory,
        };
        let shared = self.shared.clone();
        let ctx = self.ctx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-worker", self.ctx.label()))
            .spawn(move || worker::run(core, shared, ctx, settings))
            .map_err(|e| StreamError::InternalError(format!("failed to spawn worker: {e}")))?;
        self.worker = Some(handle);

        let timeout = self.options.startup_timeout();
        match self.shared.wait_startup(timeout) {
            Some(Ok(())) => {
                debug!("{} worker confirmed startup", self.ctx.label());
                Ok(())
            }
            Some(Err(e)) => {
                self.join_worker();
                Err(e)
            }
            None => {
                error!(
                    "{} worker did not start within {:?}",
                    self.ctx.label(),
                    timeout
                );
                // The worker notices the abandoned handshake once the device
                // returns and exits; it is joined by the next control call.
                self.shared.abort_requested.store(true, Ordering::Release);
                self.shared.set_state(StreamState::Stopped);
                Err(StreamError::StartupTimedOut(timeout))
            }
        }
    }

    /// Stops after queued output has played.
    pub fn stop(&mut self) -> Result<()> {
        self.halt(false)
    }

    /// Stops immediately, dropping queued output.
    pub fn abort(&mut self) -> Result<()> {
        self.halt(true)
    }

    fn halt(&mut self, abort: bool) -> Result<()> {
        self.surface_fatal()?;
        if self.is_stopped() && self.worker.is_none() {
            return Ok(());
        }
        match self.mode {
            Mode::Callback => {
                let flag = if abort {
                    &self.shared.abort_requested
                } else {
                    &self.shared.stop_requested
                };
                flag.store(true, Ordering::Release);
                self.join_worker();
                self.surface_fatal()
            }
            Mode::Blocking => {
                let core = self.core.as_mut().ok_or_else(lost_core)?;
                let stopped = {
                    let _guard = lock(&self.shared.state_lock);
                    stop_all(core.capture.as_mut(), core.playback.as_mut(), !abort)
                };
                self.shared.set_state(StreamState::Stopped);
                stopped.map_err(|e| e.into_stream_error(self.ctx.label()))
            }
        }
    }

    /// Releases the devices. Fails while the stream is active.
    pub fn close(mut self) -> Result<()> {
        if self.is_active() {
            return Err(StreamError::StreamIsActive);
        }
        self.join_worker();
        self.surface_fatal()
    }

    fn check_blocking(&self, direction: Direction) -> Result<()> {
        if self.mode != Mode::Blocking {
            return Err(StreamError::IncompatibleStreamMode);
        }
        let core = self.core.as_ref().ok_or_else(lost_core)?;
        match direction {
            Direction::Capture if core.capture.is_none() => {
                Err(StreamError::CanNotReadFromOutputOnlyStream)
            }
            Direction::Playback if core.playback.is_none() => {
                Err(StreamError::CanNotWriteToInputOnlyStream)
            }
            _ => Ok(()),
        }
    }

    fn require_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StreamError::StreamIsStopped)
        }
    }

    /// Fills `buffer` with interleaved user frames. Returns
    /// `INPUT_OVERFLOW` when an overrun was recovered since the last read.
    pub fn read(&mut self, buffer: &mut [f32]) -> Result<CallbackFlags> {
        self.surface_fatal()?;
        self.check_blocking(Direction::Capture)?;
        self.require_active()?;
        let core = self.core.as_mut().ok_or_else(lost_core)?;
        core.read_blocking(buffer, &self.shared, &self.ctx)
    }

    /// Queues interleaved user frames for playback. Returns
    /// `OUTPUT_UNDERFLOW` when an underrun was recovered since the last
    /// write.
    pub fn write(&mut self, buffer: &[f32]) -> Result<CallbackFlags> {
        self.surface_fatal()?;
        self.check_blocking(Direction::Playback)?;
        self.require_active()?;
        let core = self.core.as_mut().ok_or_else(lost_core)?;
        core.write_blocking(buffer, &self.shared, &self.ctx)
    }

    /// Frames `read` can return without waiting.
    pub fn read_available(&mut self) -> Result<u32> {
        self.surface_fatal()?;
        self.check_blocking(Direction::Capture)?;
        let core = self.core.as_mut().ok_or_else(lost_core)?;
        core.available_blocking(Direction::Capture, &self.shared, &self.ctx)
    }

    /// Frames `write` can queue without waiting.
    pub fn write_available(&mut self) -> Result<u32> {
        self.surface_fatal()?;
        self.check_blocking(Direction::Playback)?;
        let core = self.core.as_mut().ok_or_else(lost_core)?;
        core.available_blocking(Direction::Playback, &self.shared, &self.ctx)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.as_ref() {
            self.shared.abort_requested.store(true, Ordering::Release);
            if self.is_stopped() && !handle.is_finished() {
                // Abandoned start still inside the device; let it finish alone.
                debug!("{} detaching worker stuck in startup", self.ctx.label());
                self.worker = None;
                return;
            }
            self.join_worker();
        } else if self.mode == Mode::Blocking
            && self.is_active()
            && let Some(core) = self.core.as_mut()
        {
            let _ = stop_all(core.capture.as_mut(), core.playback.as_mut(), false);
        }
    }
}

fn user_channels(params: &StreamParams) -> (usize, usize) {
    (
        params.capture.as_ref().map_or(0, |c| c.channels as usize),
        params.playback.as_ref().map_or(0, |p| p.channels as usize),
    )
}
