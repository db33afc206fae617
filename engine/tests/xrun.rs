mod common;

use common::{init_tracing, FlagLog, PERIOD, ScriptedDevice, wait_until};
use pcmflow_engine::device::Direction;
use pcmflow_engine::negotiate::HostBufferSizeMode;
use pcmflow_engine::{
    CallbackFlags, CallbackResult, DirectionParams, EngineContext, Stream, StreamOptions,
    StreamParams,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn ctx() -> EngineContext {
    init_tracing();
    EngineContext::new("xrun").with_profiling(false)
}

fn logging_callback(log: &FlagLog) -> pcmflow_engine::StreamCallback {
    let sink = log.clone();
    Box::new(move |_, out, info| {
        out.fill(0.0);
        sink.lock().unwrap().push(info.flags);
        CallbackResult::Continue
    })
}

fn count(log: &FlagLog, flag: CallbackFlags) -> usize {
    log.lock().unwrap().iter().filter(|f| f.contains(flag)).count()
}

#[test]
fn underrun_is_recovered_once_and_flagged_once() {
    let (dev, script) = ScriptedDevice::new(Direction::Playback, PERIOD);
    script.lock().unwrap().xrun_on_call = Some(3);
    let log: FlagLog = Arc::new(Mutex::new(Vec::new()));
    let mut stream = Stream::open_callback(
        &ctx(),
        StreamParams::new(48_000.0).playback(DirectionParams::new(Box::new(dev), 2, 0.02)),
        logging_callback(&log),
    )
    .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.lock().unwrap().len() >= 6));
    stream.stop().unwrap();

    assert_eq!(count(&log, CallbackFlags::OUTPUT_UNDERFLOW), 1);
    assert_eq!(count(&log, CallbackFlags::INPUT_OVERFLOW), 0);
    let stats = stream.stats();
    assert_eq!(stats.underruns, 1);
    assert_eq!(stats.overruns, 0);
    assert!(stats.last_xrun_time.is_some());
    let s = script.lock().unwrap();
    assert_eq!(s.starts, 2);
    assert_eq!(s.stops, 2);
}

#[test]
fn overrun_in_duplex_restarts_both_sides() {
    let (cap, cap_script) = ScriptedDevice::new(Direction::Capture, PERIOD);
    let (play, play_script) = ScriptedDevice::new(Direction::Playback, PERIOD);
    cap_script.lock().unwrap().xrun_on_call = Some(3);
    let log: FlagLog = Arc::new(Mutex::new(Vec::new()));
    let mut stream = Stream::open_callback(
        &ctx(),
        StreamParams::new(48_000.0)
            .capture(DirectionParams::new(Box::new(cap), 2, 0.02))
            .playback(DirectionParams::new(Box::new(play), 2, 0.02)),
        logging_callback(&log),
    )
    .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.lock().unwrap().len() >= 6));
    stream.abort().unwrap();

    assert_eq!(count(&log, CallbackFlags::INPUT_OVERFLOW), 1);
    assert_eq!(stream.stats().overruns, 1);
    assert_eq!(cap_script.lock().unwrap().starts, 2);
    assert_eq!(play_script.lock().unwrap().starts, 2);
}

#[test]
fn capture_backlog_drops_a_period_and_flags_input_overflow() {
    let (cap, cap_script) = ScriptedDevice::new(Direction::Capture, PERIOD);
    let (play, _) = ScriptedDevice::new(Direction::Playback, PERIOD);
    cap_script
        .lock()
        .unwrap()
        .queue
        .extend([3 * PERIOD, 3 * PERIOD]);
    let log: FlagLog = Arc::new(Mutex::new(Vec::new()));
    let mut stream = Stream::open_callback(
        &ctx(),
        StreamParams::new(48_000.0)
            .capture(DirectionParams::new(Box::new(cap), 2, 0.02))
            .playback(DirectionParams::new(Box::new(play), 2, 0.02)),
        logging_callback(&log),
    )
    .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.lock().unwrap().len() >= 3));
    stream.stop().unwrap();

    let flags = log.lock().unwrap();
    assert!(flags[0].contains(CallbackFlags::INPUT_OVERFLOW));
    assert!(!flags[1].contains(CallbackFlags::INPUT_OVERFLOW));
    assert_eq!(stream.stats().dropped_input_periods, 1);
}

#[test]
fn never_drop_input_discards_output_instead() {
    let (cap, cap_script) = ScriptedDevice::new(Direction::Capture, PERIOD);
    let (play, _) = ScriptedDevice::new(Direction::Playback, PERIOD);
    cap_script
        .lock()
        .unwrap()
        .queue
        .extend([3 * PERIOD, 3 * PERIOD]);
    let log: FlagLog = Arc::new(Mutex::new(Vec::new()));
    let options = StreamOptions {
        never_drop_input: true,
        ..StreamOptions::default()
    };
    let mut stream = Stream::open_callback(
        &ctx(),
        StreamParams::new(48_000.0)
            .capture(DirectionParams::new(Box::new(cap), 2, 0.02))
            .playback(DirectionParams::new(Box::new(play), 2, 0.02))
            .options(options),
        logging_callback(&log),
    )
    .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.lock().unwrap().len() >= 3));
    stream.stop().unwrap();

    let flags = log.lock().unwrap();
    assert!(flags[0].contains(CallbackFlags::OUTPUT_OVERFLOW));
    assert!(!flags[0].contains(CallbackFlags::INPUT_OVERFLOW));
    assert!(!flags[1].contains(CallbackFlags::OUTPUT_OVERFLOW));
    assert_eq!(stream.stats().dropped_input_periods, 0);
}

#[test]
fn duplex_with_mismatched_periods_runs_bounded() {
    let (cap, _) = ScriptedDevice::with_period(Direction::Capture, 128, 128);
    let (play, play_script) = ScriptedDevice::with_period(Direction::Playback, 512, 512);
    let frames = Arc::new(Mutex::new(Vec::new()));
    let log: FlagLog = Arc::new(Mutex::new(Vec::new()));
    let (frame_sink, flag_sink) = (frames.clone(), log.clone());
    let mut stream = Stream::open_callback(
        &ctx(),
        StreamParams::new(48_000.0)
            .capture(DirectionParams::new(Box::new(cap), 2, 0.02))
            .playback(DirectionParams::new(Box::new(play), 2, 0.02)),
        Box::new(move |_, out, info| {
            out.fill(0.0);
            frame_sink.lock().unwrap().push(info.frames);
            flag_sink.lock().unwrap().push(info.flags);
            CallbackResult::Continue
        }),
    )
    .unwrap();
    assert_eq!(stream.info().host_buffer_mode, HostBufferSizeMode::Bounded);
    assert_eq!(stream.info().max_frames_per_host_buffer, 128);
    assert_eq!(stream.info().playback_period, Some(512));

    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || log.lock().unwrap().len() >= 6));
    stream.stop().unwrap();

    let frames = frames.lock().unwrap();
    assert!(frames.iter().all(|&n| n > 0 && n <= 128), "{frames:?}");
    assert!(log.lock().unwrap().iter().all(|f| f.is_empty()));
    let stats = stream.stats();
    assert_eq!(stats.underruns, 0);
    assert_eq!(stats.overruns, 0);
    assert!(play_script.lock().unwrap().transferred > 0);
}
