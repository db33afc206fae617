use super::StreamCore;
use super::state::{FinishReason, Shared, StreamState, lock};
use crate::EngineContext;
use crate::adapter::{CallbackFlags, CallbackResult};
use crate::availability::WaitOutcome;
use crate::component::{StreamComponent, start_all, stop_all};
use crate::error::{DeviceError, Result, StreamError};
use crate::negotiate::HostBufferSizeMode;
use crate::timing::{CycleProfiler, TimeInfo};
#[cfg(unix)]
use nix::libc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[cfg(unix)]
const RT_POLICY: i32 = libc::SCHED_FIFO;

#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub(crate) sample_rate: f64,
    pub(crate) mode: HostBufferSizeMode,
    pub(crate) max_frames: u32,
    pub(crate) realtime: bool,
    pub(crate) realtime_priority: i32,
    pub(crate) lock_memory: bool,
}

fn configure_rt_thread(name: &str, priority: i32) -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let thread = unsafe { libc::pthread_self() };
        #[cfg(target_os = "linux")]
        {
            let c_name = std::ffi::CString::new(name).map_err(|e| e.to_string())?;
            unsafe {
                let _ = libc::pthread_setname_np(thread, c_name.as_ptr());
            }
        }

        let param = unsafe {
            let mut p = std::mem::zeroed::<libc::sched_param>();
            p.sched_priority = priority;
            p
        };
        let rc = unsafe { libc::pthread_setschedparam(thread, RT_POLICY, &param) };
        if rc != 0 {
            return Err(format!(
                "pthread_setschedparam({}, prio {}) failed with errno {}",
                name, priority, rc
            ));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = name;
        let _ = priority;
        Err("realtime scheduling is not supported on this platform".to_string())
    }
}

fn lock_memory_pages() -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc == 0 {
            Ok(())
        } else {
            Err(format!(
                "mlockall(MCL_CURRENT|MCL_FUTURE) failed: {}",
                std::io::Error::last_os_error()
            ))
        }
    }
    #[cfg(not(unix))]
    {
        Err("mlockall is not supported on this platform".to_string())
    }
}

fn device_error(e: DeviceError, what: &str) -> StreamError {
    match e {
        DeviceError::Xrun => StreamError::DeviceLost(format!("{what}: xrun while starting")),
        other => other.into_stream_error(what),
    }
}

/// Body of the callback thread. Returns the stream core so the control
/// thread gets the devices back when it joins.
pub(crate) fn run(
    mut core: StreamCore,
    shared: Arc<Shared>,
    ctx: EngineContext,
    settings: WorkerSettings,
) -> StreamCore {
    if settings.realtime {
        if let Err(e) = configure_rt_thread(ctx.label(), settings.realtime_priority) {
            warn!("{} worker realtime scheduling not enabled: {}", ctx.label(), e);
        }
        if settings.lock_memory
            && let Err(e) = lock_memory_pages()
        {
            warn!("{} worker memory lock not enabled: {}", ctx.label(), e);
        }
    }

    let started = {
        let _guard = lock(&shared.state_lock);
        start_all(core.capture.as_mut(), core.playback.as_mut(), true)
    };
    if let Err(e) = started {
        let e = device_error(e, ctx.label());
        error!("{} failed to start hardware: {}", ctx.label(), e);
        let _ = stop_all(core.capture.as_mut(), core.playback.as_mut(), false);
        shared.confirm_startup(Err(e));
        return core;
    }
    if !shared.confirm_startup(Ok(())) {
        debug!("{} start was abandoned by the control thread", ctx.label());
        let _ = stop_all(core.capture.as_mut(), core.playback.as_mut(), false);
        return core;
    }

    let reason = match callback_loop(&mut core, &shared, &ctx, &settings) {
        Ok(reason) => reason,
        Err(e) => {
            error!("{} stream failed: {}", ctx.label(), e);
            shared.store_fatal(e);
            FinishReason::Failed
        }
    };

    let drain = matches!(reason, FinishReason::Stopped | FinishReason::Completed);
    let stopped = {
        let _guard = lock(&shared.state_lock);
        stop_all(core.capture.as_mut(), core.playback.as_mut(), drain)
    };
    if let Err(e) = stopped {
        warn!("{} failed to stop hardware: {}", ctx.label(), e);
    }
    shared.cpu_load.reset();
    debug!("{} worker finished: {:?}", ctx.label(), reason);
    shared.notify_finished(reason);
    match reason {
        FinishReason::Completed | FinishReason::CallbackAborted => {
            shared.set_state(StreamState::CallbackFinished)
        }
        FinishReason::Failed => shared.set_state(StreamState::Stopped),
        FinishReason::Stopped | FinishReason::Aborted => {}
    }
    core
}

fn callback_loop(
    core: &mut StreamCore,
    shared: &Shared,
    ctx: &EngineContext,
    settings: &WorkerSettings,
) -> Result<FinishReason> {
    let rate = settings.sample_rate;
    let mut finish: Option<FinishReason> = None;
    let mut profiler = ctx.profiling().then(CycleProfiler::new);
    let period = core
        .capture
        .iter()
        .chain(core.playback.iter())
        .map(StreamComponent::frames_per_period)
        .min()
        .unwrap_or(settings.max_frames);

    loop {
        if shared.abort_requested() {
            return Ok(FinishReason::Aborted);
        }
        if finish.is_none() && shared.stop_requested() {
            finish = Some(FinishReason::Stopped);
        }
        match finish {
            Some(FinishReason::CallbackAborted) => return Ok(FinishReason::CallbackAborted),
            Some(reason) if core.playback.is_none() || core.adapter.is_output_drained() => {
                return Ok(reason);
            }
            _ => {}
        }

        let waited = Instant::now();
        let outcome = core
            .availability
            .wait(core.capture.as_mut(), core.playback.as_mut(), None)?;
        if let Some(p) = profiler.as_mut() {
            p.record_wait(waited.elapsed());
        }
        let (frames, flags) = match outcome {
            WaitOutcome::TimedOut => continue,
            WaitOutcome::Xrun { capture, playback } => {
                core.recover(capture, playback, ctx.now_secs(), true, shared)?;
                if let Some(p) = profiler.as_mut() {
                    p.record_xrun();
                }
                continue;
            }
            WaitOutcome::Frames { frames, flags } => (frames, flags),
        };
        if frames == 0 && flags.contains(CallbackFlags::INPUT_OVERFLOW) {
            shared.counters.note_dropped_input();
        }
        core.recovery.defer(flags);

        let mut remaining = frames;
        while remaining > 0 {
            let chunk = match settings.mode {
                HostBufferSizeMode::Fixed if remaining < settings.max_frames => break,
                HostBufferSizeMode::Fixed => settings.max_frames,
                HostBufferSizeMode::Bounded => remaining.min(settings.max_frames),
            };
            let cycle_start = Instant::now();
            match process_chunk(core, chunk, &mut finish, rate, ctx)? {
                Chunk::Xrun { capture, playback } => {
                    core.recover(capture, playback, ctx.now_secs(), true, shared)?;
                    if let Some(p) = profiler.as_mut() {
                        p.record_xrun();
                    }
                    break;
                }
                Chunk::Done { callback_time } => {
                    shared.cpu_load.measure(callback_time, chunk, rate);
                    if let Some(p) = profiler.as_mut() {
                        p.record_cycle(cycle_start.elapsed(), chunk);
                    }
                }
            }
            remaining -= chunk;
            if finish == Some(FinishReason::CallbackAborted) {
                break;
            }
        }
        if let Some(p) = profiler.as_mut() {
            p.maybe_report(period, rate, ctx.label());
        }
    }
}

fn ready_delay(c: &mut Option<StreamComponent>) -> Option<u32> {
    c.as_mut().filter(|c| c.ready).and_then(|c| c.delay().ok())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Chunk {
    /// `callback_time` is zero when the callback was not invoked.
    Done { callback_time: Duration },
    Xrun { capture: bool, playback: bool },
}

/// Moves one host chunk through the adapter.
fn process_chunk(
    core: &mut StreamCore,
    chunk: u32,
    finish: &mut Option<FinishReason>,
    rate: f64,
    ctx: &EngineContext,
) -> Result<Chunk> {
    let time = TimeInfo::compute(
        ctx.now_secs(),
        rate,
        ready_delay(&mut core.capture),
        ready_delay(&mut core.playback),
    );
    let flags = core.recovery.take_flags();
    core.adapter.begin_cycle(time, flags, chunk as usize);

    if let Some(c) = core.capture.as_mut() {
        if c.ready {
            let got = match c.read_host(chunk) {
                Ok(n) => n,
                Err(DeviceError::Xrun) => {
                    return Ok(Chunk::Xrun {
                        capture: true,
                        playback: false,
                    });
                }
                Err(e) => return Err(e.into_stream_error(c.name())),
            };
            core.adapter.set_input_region(Some(c.host_region(got)));
        } else {
            core.adapter.set_input_region(None);
        }
    }

    let playback_ready = core.playback.as_ref().is_some_and(|p| p.ready);
    core.adapter
        .set_output_region(playback_ready.then_some(chunk as usize));
    let mut callback_time = Duration::ZERO;
    if finish.is_none() {
        let started = Instant::now();
        let result = core.adapter.invoke_user_callback();
        callback_time = started.elapsed();
        match result {
            CallbackResult::Continue => {}
            CallbackResult::Complete => *finish = Some(FinishReason::Completed),
            CallbackResult::Abort => *finish = Some(FinishReason::CallbackAborted),
        }
    }

    match core.playback.as_mut().filter(|p| p.ready) {
        Some(p) => {
            let frames = core.adapter.end_cycle(Some(p.host_region_mut(chunk))) as u32;
            match p.write_host(frames) {
                Ok(written) if written < frames => {
                    warn!(
                        "{} accepted {} of {} frames, dropping the rest",
                        p.name(),
                        written,
                        frames
                    );
                }
                Ok(_) => {}
                Err(DeviceError::Xrun) => {
                    return Ok(Chunk::Xrun {
                        capture: false,
                        playback: true,
                    });
                }
                Err(e) => return Err(e.into_stream_error(p.name())),
            }
        }
        None => {
            core.adapter.end_cycle(None);
        }
    }
    Ok(Chunk::Done { callback_time })
}
