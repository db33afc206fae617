use crate::adapter::CallbackFlags;
use crate::component::{StreamComponent, start_all, stop_all};
use crate::error::{DeviceError, Result, StreamError};
use atomic_float::AtomicF64;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct StreamStats {
    pub underruns: u64,
    pub overruns: u64,
    pub dropped_input_periods: u64,
    pub last_xrun_time: Option<f64>,
}

/// Counters shared with the control thread.
#[derive(Debug)]
pub(crate) struct XrunCounters {
    underruns: AtomicU64,
    overruns: AtomicU64,
    dropped_input: AtomicU64,
    last_xrun: AtomicF64,
}

impl Default for XrunCounters {
    fn default() -> Self {
        Self {
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            dropped_input: AtomicU64::new(0),
            last_xrun: AtomicF64::new(0.0),
        }
    }
}

impl XrunCounters {
    pub(crate) fn note_dropped_input(&self) {
        self.dropped_input.fetch_add(1, Ordering::Relaxed);
    }

    fn note_xrun(&self, capture: bool, playback: bool, now: f64) {
        if playback {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        if capture {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        self.last_xrun.store(now, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StreamStats {
        let underruns = self.underruns.load(Ordering::Relaxed);
        let overruns = self.overruns.load(Ordering::Relaxed);
        StreamStats {
            underruns,
            overruns,
            dropped_input_periods: self.dropped_input.load(Ordering::Relaxed),
            last_xrun_time: (underruns + overruns > 0)
                .then(|| self.last_xrun.load(Ordering::Relaxed)),
        }
    }
}

/// Restarts both directions after a discontinuity and remembers which
/// side faulted so the next cycle can report it exactly once.
#[derive(Debug, Default)]
pub(crate) struct XrunRecovery {
    pending: CallbackFlags,
    underrun_time: Option<f64>,
    overrun_time: Option<f64>,
}

impl XrunRecovery {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn recover(
        &mut self,
        mut capture: Option<&mut StreamComponent>,
        mut playback: Option<&mut StreamComponent>,
        capture_xrun: bool,
        playback_xrun: bool,
        now: f64,
        callback_mode: bool,
        state_lock: &Mutex<()>,
        counters: &XrunCounters,
    ) -> Result<()> {
        let _guard = state_lock
            .lock()
            .map_err(|_| StreamError::InternalError("stream state lock poisoned".to_string()))?;
        if playback_xrun {
            if let Some(p) = playback.as_deref() {
                warn!(
                    "{} underrun at {:.6}s (previous {:?})",
                    p.name(),
                    now,
                    self.underrun_time
                );
            }
            self.underrun_time = Some(now);
            self.pending.insert(CallbackFlags::OUTPUT_UNDERFLOW);
        }
        if capture_xrun {
            if let Some(c) = capture.as_deref() {
                warn!(
                    "{} overrun at {:.6}s (previous {:?})",
                    c.name(),
                    now,
                    self.overrun_time
                );
            }
            self.overrun_time = Some(now);
            self.pending.insert(CallbackFlags::INPUT_OVERFLOW);
        }
        counters.note_xrun(capture_xrun, playback_xrun, now);

        let restarted = stop_all(capture.as_deref_mut(), playback.as_deref_mut(), false)
            .and_then(|_| start_all(capture.as_deref_mut(), playback.as_deref_mut(), callback_mode));
        restarted.map_err(|e| {
            let e = match e {
                DeviceError::Xrun => StreamError::DeviceLost("xrun while restarting".to_string()),
                other => other.into_stream_error("xrun recovery"),
            };
            error!("xrun recovery failed: {}", e);
            e
        })
    }

    /// Holds flags raised outside recovery until the next processed cycle.
    pub(crate) fn defer(&mut self, flags: CallbackFlags) {
        self.pending.insert(flags);
    }

    pub(crate) fn take_flags(&mut self) -> CallbackFlags {
        std::mem::take(&mut self.pending)
    }

    /// Takes only the flags in `mask`; the blocking read and write paths
    /// each consume the flag for their own direction.
    pub(crate) fn take_masked(&mut self, mask: CallbackFlags) -> CallbackFlags {
        let hit = self.pending.intersection(mask);
        self.pending.remove(mask);
        hit
    }

    pub(crate) fn reset(&mut self) {
        self.pending = CallbackFlags::NONE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Direction;
    use crate::device::fake::FakeDevice;
    use crate::negotiate::Settled;

    fn component(direction: Direction) -> StreamComponent {
        let (mut c, _) = StreamComponent::configure(
            Box::new(FakeDevice::new(direction, 256)),
            direction,
            2,
            48_000.0,
        )
        .unwrap();
        c.apply(Settled {
            period: 256,
            buffer: 1024,
        });
        c
    }

    #[test]
    fn playback_xrun_flags_underflow_once() {
        let mut play = component(Direction::Playback);
        let lock = Mutex::new(());
        let counters = XrunCounters::default();
        let mut r = XrunRecovery::default();
        r.recover(None, Some(&mut play), false, true, 1.5, true, &lock, &counters)
            .unwrap();
        assert_eq!(r.take_flags(), CallbackFlags::OUTPUT_UNDERFLOW);
        assert_eq!(r.take_flags(), CallbackFlags::NONE);
        assert_eq!(r.underrun_time, Some(1.5));
        assert_eq!(r.overrun_time, None);
        let stats = counters.snapshot();
        assert_eq!(stats.underruns, 1);
        assert_eq!(stats.overruns, 0);
        assert_eq!(stats.last_xrun_time, Some(1.5));
        assert!(play.is_running());
    }

    #[test]
    fn recovery_restarts_both_directions() {
        let mut cap = component(Direction::Capture);
        let mut play = component(Direction::Playback);
        let lock = Mutex::new(());
        let counters = XrunCounters::default();
        let mut r = XrunRecovery::default();
        r.recover(Some(&mut cap), Some(&mut play), true, false, 0.25, true, &lock, &counters)
            .unwrap();
        assert!(cap.is_running());
        assert!(play.is_running());
        assert_eq!(counters.snapshot().overruns, 1);
    }

    #[test]
    fn masked_take_leaves_other_direction_pending() {
        let mut r = XrunRecovery::default();
        r.pending = CallbackFlags::INPUT_OVERFLOW | CallbackFlags::OUTPUT_UNDERFLOW;
        assert_eq!(
            r.take_masked(CallbackFlags::INPUT_OVERFLOW),
            CallbackFlags::INPUT_OVERFLOW
        );
        assert_eq!(r.take_flags(), CallbackFlags::OUTPUT_UNDERFLOW);
    }

    #[test]
    fn no_xrun_means_no_timestamp() {
        assert_eq!(XrunCounters::default().snapshot().last_xrun_time, None);
    }
}
