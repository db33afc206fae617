use serde::Deserialize;
use std::time::Duration;

pub const PROFILE_ENV: &str = "PCMFLOW_PROFILE";
pub const REALTIME_ENV: &str = "PCMFLOW_REALTIME";
pub const NUM_PERIODS_ENV: &str = "PCMFLOW_NUM_PERIODS";

pub const DEFAULT_NUM_PERIODS: u32 = 4;
pub const MIN_NUM_PERIODS: u32 = 2;
pub const SAMPLE_RATE_TOLERANCE: f64 = 0.01;

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

pub fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    pub num_periods: u32,
    pub never_drop_input: bool,
    pub realtime: bool,
    pub realtime_priority: i32,
    pub lock_memory: bool,
    pub startup_timeout_ms: u64,
    pub stall_timeout_ms: Option<u64>,
    pub margin_divisor: u32,
    pub skew_threshold_periods: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            num_periods: DEFAULT_NUM_PERIODS,
            never_drop_input: false,
            realtime: false,
            realtime_priority: 18,
            lock_memory: false,
            startup_timeout_ms: 1_000,
            stall_timeout_ms: Some(2_000),
            margin_divisor: 2,
            skew_threshold_periods: 1,
        }
    }
}

impl StreamOptions {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_u32(NUM_PERIODS_ENV) {
            self.num_periods = n;
        }
        if env_flag(REALTIME_ENV) {
            self.realtime = true;
        }
        self
    }

    pub fn num_periods(&self) -> u32 {
        self.num_periods.max(MIN_NUM_PERIODS)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    pub fn margin_divisor(&self) -> u32 {
        self.margin_divisor.max(1)
    }
}
