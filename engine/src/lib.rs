pub mod adapter;
mod availability;
mod component;
pub mod config;
pub mod device;
pub mod error;
pub mod negotiate;
pub mod stream;
pub mod timing;
mod xrun;

pub use adapter::{
    BlockAdapter, CallbackFlags, CallbackInfo, CallbackResult, HostRegion, HostRegionMut,
    SampleAdapter, StreamCallback,
};
pub use config::StreamOptions;
pub use error::{DeviceError, Result, StreamError};
pub use stream::{
    DirectionParams, FinishReason, FinishedCallback, Stream, StreamInfo, StreamParams,
    StreamState,
};
pub use timing::TimeInfo;
pub use xrun::StreamStats;

use std::sync::Arc;
use std::time::Instant;

/// Per-engine context shared by every stream opened through it: the clock
/// stream timestamps are measured on, the label used in logs and thread
/// names, and whether the worker profiler runs.
#[derive(Debug, Clone)]
pub struct EngineContext {
    epoch: Instant,
    label: Arc<str>,
    profile: bool,
}

impl EngineContext {
    pub fn new(label: &str) -> Self {
        Self {
            epoch: Instant::now(),
            label: Arc::from(label),
            profile: config::env_flag(config::PROFILE_ENV),
        }
    }

    pub fn with_profiling(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn profiling(&self) -> bool {
        self.profile
    }

    /// Seconds since the context was created.
    pub fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new("pcmflow")
    }
}
