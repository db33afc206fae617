use crate::config::MIN_NUM_PERIODS;
use crate::device::{Bounds, DeviceHandle};
use crate::error::{Result, StreamError};
use crate::timing::poll_timeout;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBufferSizeMode {
    /// Every iteration moves exactly one period.
    Fixed,
    /// Iterations move at most `max_frames_per_host_buffer` frames.
    Bounded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiationRequest {
    pub sample_rate: f64,
    pub frames_per_buffer: Option<u32>,
    pub num_periods: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub period: u32,
    pub buffer: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Negotiated {
    pub capture: Option<Settled>,
    pub playback: Option<Settled>,
    pub mode: HostBufferSizeMode,
    pub max_frames_per_host_buffer: u32,
    pub poll_timeout: Duration,
}

pub fn nearest_power_of_two(n: u32) -> u32 {
    if n <= 1 {
        return 1;
    }
    let up = n.checked_next_power_of_two().unwrap_or(1 << 31);
    let down = up / 2;
    if up - n <= n - down { up } else { down }
}

/// Period bounds tightened so that `MIN_NUM_PERIODS` periods fit the buffer.
fn effective_period_bounds(dev: &dyn DeviceHandle) -> Bounds {
    let period = dev.period_bounds();
    let buffer = dev.buffer_bounds();
    let max = period.max.min(buffer.max / MIN_NUM_PERIODS);
    Bounds::new(period.min, max)
}

fn periods_for(dev: &dyn DeviceHandle, num_periods: u32) -> u32 {
    num_periods.min(dev.max_periods()).max(MIN_NUM_PERIODS)
}

fn search_outward<F>(start: u32, bounds: Bounds, accepts: F) -> Option<u32>
where
    F: Fn(u32) -> bool,
{
    if bounds.min > bounds.max {
        return None;
    }
    let start = bounds.clamp(start);
    if accepts(start) {
        return Some(start);
    }
    let mut up = start;
    let mut down = start;
    loop {
        up = up.saturating_mul(2);
        down /= 2;
        let up_ok = up <= bounds.max;
        let down_ok = down >= bounds.min && down > 0;
        if !up_ok && !down_ok {
            break;
        }
        if up_ok && accepts(up) {
            return Some(up);
        }
        if down_ok && accepts(down) {
            return Some(down);
        }
    }
    let mut pow2: Vec<u32> = (0..32)
        .map(|s| 1_u32 << s)
        .filter(|p| bounds.contains(*p))
        .collect();
    pow2.sort_by_key(|p| p.abs_diff(start));
    pow2.into_iter()
        .chain([bounds.min, bounds.max])
        .find(|p| accepts(*p))
}

fn align_buffer_to_user(mut buffer: u32, user: u32) -> u32 {
    if buffer > user {
        let rem = buffer % user;
        if rem > user / 2 {
            buffer += user - rem;
        } else {
            buffer -= rem;
        }
    } else if buffer == 0 || user % buffer != 0 {
        if buffer as f64 > user as f64 * 0.75 || buffer == 0 {
            buffer = user;
        } else {
            let mut size = user;
            while size / 2 >= buffer && size > 1 && user % (size / 2) == 0 {
                size /= 2;
            }
            buffer = size;
        }
    }
    buffer
}

/// Picks the host period for one direction.
pub fn choose_period(
    dev: &dyn DeviceHandle,
    latency: f64,
    sample_rate: f64,
    user_frames: Option<u32>,
    num_periods: u32,
) -> Result<u32> {
    let bounds = effective_period_bounds(dev);
    if bounds.min > bounds.max {
        return Err(StreamError::IncompatibleHardwareConstraints(format!(
            "{}: period bounds {}..={} leave no room for {} periods in a {} frame buffer",
            dev.name(),
            dev.period_bounds().min,
            dev.period_bounds().max,
            MIN_NUM_PERIODS,
            dev.buffer_bounds().max
        )));
    }
    let user_frames = user_frames.filter(|u| *u > 0);
    let max_buffer = dev.buffer_bounds().max;
    if let Some(user) = user_frames.filter(|u| *u > max_buffer) {
        return Err(StreamError::BufferTooLarge {
            requested: user,
            max: max_buffer,
        });
    }
    let periods = periods_for(dev, num_periods);
    let latency_frames = (latency.max(0.0) * sample_rate).round() as u32;

    let candidate = match user_frames {
        None => {
            let target = (latency_frames / periods).max(1);
            bounds.clamp(nearest_power_of_two(target))
        }
        Some(user) => {
            let buffer = align_buffer_to_user(dev.buffer_bounds().clamp(latency_frames), user);
            let mut fphb = user;
            if fphb < buffer {
                while buffer / fphb > periods {
                    fphb = fphb.saturating_mul(2);
                }
                if buffer / fphb < periods && fphb / 2 >= 1 {
                    fphb /= 2;
                }
            } else {
                while fphb > 1 && buffer / fphb < periods && user % (fphb / 2) == 0 {
                    fphb /= 2;
                }
            }
            if !dev.test_period(fphb) {
                let (first, second) = if fphb >= user {
                    (fphb.saturating_add(user), fphb.saturating_sub(user))
                } else {
                    (fphb.saturating_mul(2), fphb / 2)
                };
                if dev.test_period(first) {
                    fphb = first;
                } else if second > 0 && dev.test_period(second) {
                    fphb = second;
                }
            }
            bounds.clamp(fphb)
        }
    };

    let period = search_outward(candidate, bounds, |p| dev.test_period(p)).ok_or_else(|| {
        StreamError::IncompatibleHardwareConstraints(format!(
            "{}: no period in {}..={} accepted",
            dev.name(),
            bounds.min,
            bounds.max
        ))
    })?;
    debug!(
        "{} period chosen: candidate={} period={} periods={} latency_frames={}",
        dev.name(),
        candidate,
        period,
        periods,
        latency_frames
    );
    Ok(period)
}

/// Looks for one period both directions accept.
pub fn common_period(
    capture: &dyn DeviceHandle,
    capture_choice: u32,
    playback: &dyn DeviceHandle,
    playback_choice: u32,
    target: u32,
) -> Option<u32> {
    let bounds = effective_period_bounds(capture).intersect(&effective_period_bounds(playback))?;
    let accepts =
        |p: u32| bounds.contains(p) && capture.test_period(p) && playback.test_period(p);
    let mut choices = [capture_choice, playback_choice];
    choices.sort_by_key(|c| c.abs_diff(target));
    if let Some(c) = choices.into_iter().find(|c| accepts(*c)) {
        return Some(c);
    }
    search_outward(nearest_power_of_two(target.max(1)), bounds, accepts)
}

fn settle(dev: &mut dyn DeviceHandle, period: u32, num_periods: u32) -> Result<(Settled, bool)> {
    let actual = dev
        .set_period(period)
        .map_err(|e| e.into_stream_error(dev.name()))?;
    let periods = periods_for(dev, num_periods);
    let wanted = dev.buffer_bounds().clamp(actual.saturating_mul(periods));
    let buffer = dev
        .set_buffer_size(wanted)
        .map_err(|e| e.into_stream_error(dev.name()))?;
    if actual == 0 || buffer < actual.saturating_mul(2) {
        return Err(StreamError::IncompatibleHardwareConstraints(format!(
            "{}: buffer of {} frames cannot hold two periods of {}",
            dev.name(),
            buffer,
            actual
        )));
    }
    Ok((Settled { period: actual, buffer }, actual == period))
}

pub fn negotiate(
    capture: Option<(&mut dyn DeviceHandle, f64)>,
    playback: Option<(&mut dyn DeviceHandle, f64)>,
    req: &NegotiationRequest,
) -> Result<Negotiated> {
    let rate = req.sample_rate;
    let user = req.frames_per_buffer.filter(|u| *u > 0);
    let (capture, playback) = match (capture, playback) {
        (None, None) => {
            return Err(StreamError::InvalidConfiguration(
                "stream needs at least one direction".to_string(),
            ));
        }
        (Some((cap, cap_latency)), Some((play, play_latency))) => {
            let cap_choice = choose_period(&*cap, cap_latency, rate, user, req.num_periods)?;
            let play_choice = choose_period(&*play, play_latency, rate, user, req.num_periods)?;
            let target = match user {
                Some(u) => u,
                None => {
                    let latency = cap_latency.min(play_latency).max(0.0);
                    ((latency * rate).round() as u32 / req.num_periods.max(MIN_NUM_PERIODS)).max(1)
                }
            };
            match common_period(&*cap, cap_choice, &*play, play_choice, target) {
                Some(p) => {
                    let (c, c_exact) = settle(cap, p, req.num_periods)?;
                    let (pl, p_exact) = settle(play, p, req.num_periods)?;
                    let exact = c_exact && p_exact && c.period == pl.period;
                    (Some((c, exact)), Some((pl, exact)))
                }
                None => {
                    debug!(
                        "no common period for {} and {}: capture={} playback={}",
                        cap.name(),
                        play.name(),
                        cap_choice,
                        play_choice
                    );
                    let (c, _) = settle(cap, cap_choice, req.num_periods)?;
                    let (pl, _) = settle(play, play_choice, req.num_periods)?;
                    (Some((c, false)), Some((pl, false)))
                }
            }
        }
        (Some((cap, latency)), None) => {
            let p = choose_period(&*cap, latency, rate, user, req.num_periods)?;
            (Some(settle(cap, p, req.num_periods)?), None)
        }
        (None, Some((play, latency))) => {
            let p = choose_period(&*play, latency, rate, user, req.num_periods)?;
            (None, Some(settle(play, p, req.num_periods)?))
        }
    };

    let exact = capture.is_none_or(|(_, e)| e) && playback.is_none_or(|(_, e)| e);
    let capture = capture.map(|(s, _)| s);
    let playback = playback.map(|(s, _)| s);
    let min_period = [capture, playback]
        .iter()
        .flatten()
        .map(|s| s.period)
        .min()
        .unwrap_or(0);
    let mode = if exact {
        HostBufferSizeMode::Fixed
    } else {
        HostBufferSizeMode::Bounded
    };
    debug!(
        "negotiated: capture={:?} playback={:?} mode={:?} max_frames={}",
        capture, playback, mode, min_period
    );
    Ok(Negotiated {
        capture,
        playback,
        mode,
        max_frames_per_host_buffer: min_period,
        poll_timeout: poll_timeout(min_period, rate),
    })
}
