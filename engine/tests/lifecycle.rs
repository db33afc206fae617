mod common;

use common::{init_tracing, ScriptedDevice, wait_until};
use pcmflow_engine::device::{Direction, SimConfig, SimulatedDevice};
use pcmflow_engine::{
    CallbackResult, DirectionParams, EngineContext, FinishReason, Stream, StreamError,
    StreamOptions, StreamParams, StreamState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn ctx() -> EngineContext {
    init_tracing();
    EngineContext::new("test").with_profiling(false)
}

fn sim_playback(config: SimConfig, options: StreamOptions) -> StreamParams {
    StreamParams::new(48_000.0)
        .playback(DirectionParams::new(
            Box::new(SimulatedDevice::new(config)),
            2,
            0.04,
        ))
        .options(options)
}

fn scripted_playback(
    device: ScriptedDevice,
    callback: pcmflow_engine::StreamCallback,
) -> Stream {
    Stream::open_callback(
        &ctx(),
        StreamParams::new(48_000.0).playback(DirectionParams::new(Box::new(device), 2, 0.02)),
        callback,
    )
    .unwrap()
}

fn reasons(stream: &mut Stream) -> Arc<Mutex<Vec<FinishReason>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    stream.set_finished_callback(Some(Box::new(move |r| sink.lock().unwrap().push(r))));
    seen
}

#[test]
fn stop_and_abort_on_a_stopped_stream_are_no_ops() {
    let mut stream = Stream::open_callback(
        &ctx(),
        sim_playback(SimConfig::playback("sim"), StreamOptions::default()),
        Box::new(|_, _, _| CallbackResult::Continue),
    )
    .unwrap();
    assert!(stream.is_stopped());
    stream.stop().unwrap();
    stream.abort().unwrap();
    assert!(stream.is_stopped());
    stream.close().unwrap();
}

#[test]
fn starting_twice_runs_one_worker() {
    let mut stream = Stream::open_callback(
        &ctx(),
        sim_playback(SimConfig::playback("sim"), StreamOptions::default()),
        Box::new(|_, out, _| {
            out.fill(0.0);
            CallbackResult::Continue
        }),
    )
    .unwrap();
    let seen = reasons(&mut stream);
    stream.start().unwrap();
    stream.start().unwrap();
    assert!(stream.is_active());
    std::thread::sleep(Duration::from_millis(50));
    stream.stop().unwrap();
    assert!(stream.is_stopped());
    assert_eq!(*seen.lock().unwrap(), vec![FinishReason::Stopped]);
    assert_eq!(stream.cpu_load(), 0.0);
}

#[test]
fn stream_can_be_restarted_after_abort() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut stream = Stream::open_callback(
        &ctx(),
        sim_playback(SimConfig::playback("sim"), StreamOptions::default()),
        Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            CallbackResult::Continue
        }),
    )
    .unwrap();
    let seen = reasons(&mut stream);
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::Relaxed) > 0));
    stream.abort().unwrap();
    let after_first = calls.load(Ordering::Relaxed);
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        calls.load(Ordering::Relaxed) > after_first
    }));
    stream.stop().unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![FinishReason::Aborted, FinishReason::Stopped]
    );
}

#[test]
fn startup_that_never_confirms_times_out() {
    let mut config = SimConfig::playback("slow");
    config.start_delay = Some(Duration::from_millis(1_500));
    let options = StreamOptions {
        startup_timeout_ms: 100,
        ..StreamOptions::default()
    };
    let mut stream = Stream::open_callback(
        &ctx(),
        sim_playback(config, options),
        Box::new(|_, _, _| CallbackResult::Continue),
    )
    .unwrap();
    let seen = reasons(&mut stream);
    let started = Instant::now();
    assert_eq!(
        stream.start(),
        Err(StreamError::StartupTimedOut(Duration::from_millis(100)))
    );
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert!(stream.is_stopped());
    assert!(!stream.is_active());

    // The worker is still inside the device start; stop waits for it to
    // hand the devices back.
    stream.stop().unwrap();
    assert!(stream.is_stopped());
    assert!(seen.lock().unwrap().is_empty());
    stream.close().unwrap();
}

#[test]
fn dropping_a_stream_stuck_in_startup_returns_promptly() {
    let mut config = SimConfig::playback("slow");
    config.start_delay = Some(Duration::from_millis(1_500));
    let options = StreamOptions {
        startup_timeout_ms: 50,
        ..StreamOptions::default()
    };
    let mut stream = Stream::open_callback(
        &ctx(),
        sim_playback(config, options),
        Box::new(|_, _, _| CallbackResult::Continue),
    )
    .unwrap();
    let started = Instant::now();
    assert!(matches!(stream.start(), Err(StreamError::StartupTimedOut(_))));
    drop(stream);
    assert!(started.elapsed() < Duration::from_millis(1_000));
}

#[test]
fn complete_from_the_callback_finishes_the_stream() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut stream = Stream::open_callback(
        &ctx(),
        sim_playback(SimConfig::playback("sim"), StreamOptions::default()),
        Box::new(move |_, out, _| {
            out.fill(0.1);
            if counter.fetch_add(1, Ordering::Relaxed) == 2 {
                CallbackResult::Complete
            } else {
                CallbackResult::Continue
            }
        }),
    )
    .unwrap();
    let seen = reasons(&mut stream);
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        stream.state() == StreamState::CallbackFinished
    }));
    assert!(!stream.is_active());
    assert!(!stream.is_stopped());
    assert_eq!(calls.load(Ordering::Relaxed), 3);
    assert_eq!(*seen.lock().unwrap(), vec![FinishReason::Completed]);
    stream.stop().unwrap();
    assert!(stream.is_stopped());
}

#[test]
fn abort_from_the_callback_finishes_without_draining() {
    let mut stream = Stream::open_callback(
        &ctx(),
        sim_playback(SimConfig::playback("sim"), StreamOptions::default()),
        Box::new(|_, _, _| CallbackResult::Abort),
    )
    .unwrap();
    let seen = reasons(&mut stream);
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        stream.state() == StreamState::CallbackFinished
    }));
    assert_eq!(*seen.lock().unwrap(), vec![FinishReason::CallbackAborted]);
    // Starting again reaps the finished worker first.
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        stream.state() == StreamState::CallbackFinished
    }));
    stream.abort().unwrap();
}

#[test]
fn lost_device_is_reported_once_on_the_next_control_call() {
    let (dev, script) = ScriptedDevice::new(Direction::Playback, common::PERIOD);
    script.lock().unwrap().lost_on_call = Some(3);
    let mut stream = Stream::open_callback(
        &ctx(),
        StreamParams::new(48_000.0).playback(DirectionParams::new(Box::new(dev), 2, 0.02)),
        Box::new(|_, _, _| CallbackResult::Continue),
    )
    .unwrap();
    let seen = reasons(&mut stream);
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || stream.is_stopped()));
    assert!(matches!(stream.stop(), Err(StreamError::DeviceLost(_))));
    stream.stop().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![FinishReason::Failed]);
    assert!(!script.lock().unwrap().running);
}

#[test]
fn close_refuses_an_active_stream() {
    let mut stream = Stream::open_blocking(
        &ctx(),
        sim_playback(SimConfig::playback("sim"), StreamOptions::default()),
    )
    .unwrap();
    stream.start().unwrap();
    assert_eq!(stream.close(), Err(StreamError::StreamIsActive));
}

#[test]
fn stop_drains_playback_and_abort_drops_it() {
    for (abort, expected) in [(false, true), (true, false)] {
        let (dev, script) = ScriptedDevice::new(Direction::Playback, common::PERIOD);
        let mut stream = scripted_playback(dev, Box::new(|_, _, _| CallbackResult::Continue));
        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            script.lock().unwrap().transferred >= 4 * common::PERIOD as u64
        }));
        if abort {
            stream.abort().unwrap();
        } else {
            stream.stop().unwrap();
        }
        assert_eq!(script.lock().unwrap().drains, vec![expected], "abort={abort}");
    }
}

#[test]
fn callback_result_decides_whether_playback_drains() {
    for (result, expected) in [
        (CallbackResult::Complete, true),
        (CallbackResult::Abort, false),
    ] {
        let (dev, script) = ScriptedDevice::new(Direction::Playback, common::PERIOD);
        let mut stream = scripted_playback(
            dev,
            Box::new(move |_, out, _| {
                out.fill(0.0);
                result
            }),
        );
        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            stream.state() == StreamState::CallbackFinished
        }));
        assert_eq!(script.lock().unwrap().drains, vec![expected], "{result:?}");
        stream.stop().unwrap();
        assert_eq!(script.lock().unwrap().drains.len(), 1);
    }
}

#[test]
fn cpu_load_excludes_device_transfer_time() {
    let (dev, _script) = ScriptedDevice::new(Direction::Playback, common::PERIOD);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    // Each transfer takes most of a 256 frame period at 48 kHz.
    let mut stream = scripted_playback(
        dev.paced(Duration::from_millis(4)),
        Box::new(move |_, out, _| {
            out.fill(0.0);
            counter.fetch_add(1, Ordering::Relaxed);
            CallbackResult::Continue
        }),
    );
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || calls.load(Ordering::Relaxed) >= 30));
    let load = stream.cpu_load();
    stream.stop().unwrap();
    assert!(load < 0.2, "cpu load {load}");
}

#[test]
fn short_playback_writes_do_not_fail_the_stream() {
    let (dev, script) = ScriptedDevice::new(Direction::Playback, common::PERIOD);
    script.lock().unwrap().short_write = Some(common::PERIOD / 2);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut stream = scripted_playback(
        dev,
        Box::new(move |_, out, _| {
            out.fill(0.2);
            counter.fetch_add(1, Ordering::Relaxed);
            CallbackResult::Continue
        }),
    );
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || calls.load(Ordering::Relaxed) >= 6));
    assert!(stream.is_active());
    stream.stop().unwrap();
    let stats = stream.stats();
    assert_eq!(stats.underruns, 0);
    assert_eq!(stats.overruns, 0);
    let s = script.lock().unwrap();
    assert_eq!(s.transferred % (common::PERIOD / 2) as u64, 0);
    assert_eq!(s.drains, vec![true]);
}
