use clap::{Parser, ValueEnum};
use pcmflow_engine::device::{SimConfig, SimMonitor, SimSignal, SimulatedDevice};
use pcmflow_engine::{
    CallbackResult, DirectionParams, EngineContext, Stream, StreamCallback, StreamOptions,
    StreamParams, StreamStats,
};
use serde::Serialize;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Level, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Generate a sine tone on a simulated playback device.
    Playback,
    /// Read a simulated capture device and report its level.
    Capture,
    /// Pass capture straight through to playback.
    Duplex,
}

/// Run a period-based audio stream on simulated devices.
#[derive(Debug, Parser)]
#[command(name = "pcmflow")]
#[command(version)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Playback)]
    mode: Mode,

    #[arg(long, default_value_t = 48_000.0)]
    rate: f64,

    #[arg(long, default_value_t = 2)]
    channels: u16,

    /// Requested latency in seconds.
    #[arg(long, default_value_t = 0.02)]
    latency: f64,

    /// Frames the callback sees per call; host periods are adapted.
    #[arg(long)]
    frames_per_buffer: Option<u32>,

    /// Tone frequency for playback mode.
    #[arg(long, default_value_t = 440.0)]
    frequency: f64,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    seconds: Option<f64>,

    /// Use blocking writes instead of a callback (playback only).
    #[arg(long)]
    blocking: bool,

    /// TOML file with stream options.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print final statistics as JSON.
    #[arg(long)]
    json: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn load_options(path: Option<&Path>) -> Result<StreamOptions, Box<dyn Error>> {
    let options = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            toml::from_str::<StreamOptions>(&text)?
        }
        None => StreamOptions::default(),
    };
    Ok(options)
}

struct Sine {
    phase: f64,
    step: f64,
    channels: usize,
}

impl Sine {
    fn new(frequency: f64, rate: f64, channels: u16) -> Self {
        Self {
            phase: 0.0,
            step: std::f64::consts::TAU * frequency / rate,
            channels: channels.max(1) as usize,
        }
    }

    fn fill(&mut self, out: &mut [f32]) {
        for frame in out.chunks_mut(self.channels) {
            frame.fill((self.phase.sin() * 0.2) as f32);
            self.phase = (self.phase + self.step) % std::f64::consts::TAU;
        }
    }
}

fn callback(cli: &Cli) -> StreamCallback {
    match cli.mode {
        Mode::Playback => {
            let mut sine = Sine::new(cli.frequency, cli.rate, cli.channels);
            Box::new(move |_, out, _| {
                sine.fill(out);
                CallbackResult::Continue
            })
        }
        Mode::Capture => Box::new(|_, _, _| CallbackResult::Continue),
        Mode::Duplex => Box::new(|input, out, _| {
            let n = input.len().min(out.len());
            out[..n].copy_from_slice(&input[..n]);
            out[n..].fill(0.0);
            CallbackResult::Continue
        }),
    }
}

/// Builds the stream parameters and returns the monitors of the devices.
fn params(cli: &Cli, options: StreamOptions) -> (StreamParams, Vec<Arc<SimMonitor>>) {
    let mut params = StreamParams::new(cli.rate).options(options);
    if let Some(frames) = cli.frames_per_buffer {
        params = params.frames_per_buffer(frames);
    }
    let mut monitors = Vec::new();
    if matches!(cli.mode, Mode::Capture | Mode::Duplex) {
        let mut config = SimConfig::capture("sim:capture");
        config.signal = SimSignal::Sine {
            frequency: cli.frequency,
            amplitude: 0.25,
        };
        let dev = SimulatedDevice::new(config);
        monitors.push(dev.monitor());
        params = params.capture(DirectionParams::new(Box::new(dev), cli.channels, cli.latency));
    }
    if matches!(cli.mode, Mode::Playback | Mode::Duplex) {
        let dev = SimulatedDevice::new(SimConfig::playback("sim:playback"));
        monitors.push(dev.monitor());
        params = params.playback(DirectionParams::new(Box::new(dev), cli.channels, cli.latency));
    }
    (params, monitors)
}

async fn wait_for_end(seconds: Option<f64>) {
    match seconds {
        Some(s) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(s.max(0.0))) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[derive(Debug, Serialize)]
struct DeviceReport {
    frames: u64,
    xruns: u64,
    peak: f32,
}

#[derive(Debug, Serialize)]
struct Report {
    stats: StreamStats,
    devices: Vec<DeviceReport>,
}

fn report(stream: &Stream, monitors: &[Arc<SimMonitor>], json: bool) -> Result<(), Box<dyn Error>> {
    let report = Report {
        stats: stream.stats(),
        devices: monitors
            .iter()
            .map(|m| DeviceReport {
                frames: m.frames(),
                xruns: m.xruns(),
                peak: m.peak(),
            })
            .collect(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "underruns={} overruns={} dropped_input_periods={}",
        report.stats.underruns, report.stats.overruns, report.stats.dropped_input_periods
    );
    for d in &report.devices {
        println!("device frames={} xruns={} peak={:.3}", d.frames, d.xruns, d.peak);
    }
    Ok(())
}

async fn run_callback(cli: &Cli, options: StreamOptions) -> Result<(), Box<dyn Error>> {
    let ctx = EngineContext::new("pcmflow");
    let (params, monitors) = params(cli, options);
    let mut stream = Stream::open_callback(&ctx, params, callback(cli))?;
    info!("{:?}", stream.info());
    stream.start()?;

    let ticker = async {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = stream.stats();
            info!(
                "t={:.1}s cpu={:.1}% underruns={} overruns={}",
                stream.time(),
                stream.cpu_load() * 100.0,
                stats.underruns,
                stats.overruns
            );
        }
    };
    tokio::select! {
        _ = ticker => {}
        _ = wait_for_end(cli.seconds) => {}
    }

    stream.stop()?;
    report(&stream, &monitors, cli.json)?;
    stream.close()?;
    Ok(())
}

async fn run_blocking(cli: &Cli, options: StreamOptions) -> Result<(), Box<dyn Error>> {
    if cli.mode != Mode::Playback {
        return Err("blocking mode only supports playback".into());
    }
    let ctx = EngineContext::new("pcmflow");
    let (params, monitors) = params(cli, options);
    let mut stream = Stream::open_blocking(&ctx, params)?;
    info!("{:?}", stream.info());
    let period = stream
        .info()
        .playback_period
        .unwrap_or(256) as usize;
    stream.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let writer_running = running.clone();
    let mut sine = Sine::new(cli.frequency, cli.rate, cli.channels);
    let channels = cli.channels as usize;
    let writer = tokio::task::spawn_blocking(move || {
        let mut chunk = vec![0.0_f32; period * channels];
        while writer_running.load(Ordering::Relaxed) {
            sine.fill(&mut chunk);
            let flags = stream.write(&chunk)?;
            if !flags.is_empty() {
                warn!("write reported {:?}", flags);
            }
        }
        stream.stop()?;
        Ok::<Stream, pcmflow_engine::StreamError>(stream)
    });

    wait_for_end(cli.seconds).await;
    running.store(false, Ordering::Relaxed);
    let stream = writer.await??;
    report(&stream, &monitors, cli.json)?;
    stream.close()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let options = load_options(cli.config.as_deref())?;
    if cli.blocking {
        run_blocking(&cli, options).await
    } else {
        run_callback(&cli, options).await
    }
}
