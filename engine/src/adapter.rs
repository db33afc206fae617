use crate::device::{Layout, host_offset};
use crate::timing::TimeInfo;
use std::collections::VecDeque;

bitflags::bitflags! {
    /// Stream conditions reported to the callback and by blocking I/O.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallbackFlags: u8 {
        const INPUT_UNDERFLOW = 1 << 0;
        const INPUT_OVERFLOW = 1 << 1;
        const OUTPUT_UNDERFLOW = 1 << 2;
        const OUTPUT_OVERFLOW = 1 << 3;
    }
}

impl CallbackFlags {
    pub const NONE: Self = Self::empty();
}

impl Default for CallbackFlags {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    Complete,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallbackInfo {
    pub time: TimeInfo,
    pub flags: CallbackFlags,
    pub frames: usize,
}

pub type StreamCallback =
    Box<dyn FnMut(&[f32], &mut [f32], &CallbackInfo) -> CallbackResult + Send + 'static>;

pub struct HostRegion<'a> {
    samples: &'a [f32],
    channels: usize,
    frames: usize,
    layout: Layout,
}

impl<'a> HostRegion<'a> {
    pub fn new(samples: &'a [f32], channels: usize, frames: usize, layout: Layout) -> Self {
        let frames = frames.min(samples.len() / channels.max(1));
        Self {
            samples,
            channels,
            frames,
            layout,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample(&self, frame: usize, ch: usize) -> f32 {
        self.samples[host_offset(self.layout, self.channels, self.frames, frame, ch)]
    }
}

pub struct HostRegionMut<'a> {
    samples: &'a mut [f32],
    channels: usize,
    frames: usize,
    layout: Layout,
}

impl<'a> HostRegionMut<'a> {
    pub fn new(samples: &'a mut [f32], channels: usize, frames: usize, layout: Layout) -> Self {
        let frames = frames.min(samples.len() / channels.max(1));
        Self {
            samples,
            channels,
            frames,
            layout,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn set(&mut self, frame: usize, ch: usize, value: f32) {
        let idx = host_offset(self.layout, self.channels, self.frames, frame, ch);
        self.samples[idx] = value;
    }
}

/// Bridges host periods and the user callback.
///
/// One host cycle is `begin_cycle`, `set_input_region`,
/// `set_output_region`, `invoke_user_callback`, `end_cycle`. The blocking
/// API uses `copy_input`/`copy_output` instead.
pub trait SampleAdapter: Send {
    fn reset(&mut self);
    fn begin_cycle(&mut self, time: TimeInfo, flags: CallbackFlags, frames: usize);
    /// `None` means no input is available this cycle and silence is used.
    fn set_input_region(&mut self, input: Option<HostRegion<'_>>);
    /// `None` means the output produced this cycle is discarded.
    fn set_output_region(&mut self, frames: Option<usize>);
    fn invoke_user_callback(&mut self) -> CallbackResult;
    /// Writes this cycle's output in host layout and returns the frames written.
    fn end_cycle(&mut self, output: Option<HostRegionMut<'_>>) -> usize;
    fn is_output_drained(&self) -> bool;

    fn copy_input(&mut self, host: HostRegion<'_>, user: &mut [f32]) -> usize;
    fn copy_output(&mut self, user: &[f32], host: HostRegionMut<'_>) -> usize;
}

pub(crate) fn host_to_user(host: &HostRegion<'_>, frame: usize, user: &mut [f32], user_ch: usize) {
    for (c, slot) in user.iter_mut().take(user_ch).enumerate() {
        *slot = if c < host.channels() {
            host.sample(frame, c)
        } else {
            0.0
        };
    }
}

pub(crate) fn user_to_host(user: &[f32], host: &mut HostRegionMut<'_>, frame: usize) {
    let user_ch = user.len();
    for c in 0..host.channels() {
        let v = if c < user_ch {
            user[c]
        } else if user_ch == 1 && c == 1 {
            user[0]
        } else {
            0.0
        };
        host.set(frame, c, v);
    }
}

/// f32 adapter with channel adaption and user/host block-size adaption.
pub struct BlockAdapter {
    callback: StreamCallback,
    user_in: usize,
    user_out: usize,
    block: Option<usize>,
    in_fifo: VecDeque<f32>,
    out_fifo: VecDeque<f32>,
    in_scratch: Vec<f32>,
    out_scratch: Vec<f32>,
    frame_scratch: Vec<f32>,
    time: TimeInfo,
    pending_flags: CallbackFlags,
    frames: usize,
    output_wanted: bool,
    finished: Option<CallbackResult>,
}

impl BlockAdapter {
    pub fn new(
        callback: StreamCallback,
        user_in_channels: usize,
        user_out_channels: usize,
        frames_per_buffer: Option<usize>,
    ) -> Self {
        let mut adapter = Self {
            callback,
            user_in: user_in_channels,
            user_out: user_out_channels,
            block: frames_per_buffer.filter(|b| *b > 0),
            in_fifo: VecDeque::new(),
            out_fifo: VecDeque::new(),
            in_scratch: Vec::new(),
            out_scratch: Vec::new(),
            frame_scratch: vec![0.0; user_in_channels.max(user_out_channels)],
            time: TimeInfo::default(),
            pending_flags: CallbackFlags::NONE,
            frames: 0,
            output_wanted: true,
            finished: None,
        };
        adapter.reset();
        adapter
    }

    /// Adapter for blocking streams: only the copy operations are used.
    pub fn blocking(user_in_channels: usize, user_out_channels: usize) -> Self {
        Self::new(
            Box::new(|_, _, _| CallbackResult::Complete),
            user_in_channels,
            user_out_channels,
            None,
        )
    }

    fn in_frames(&self) -> usize {
        if self.user_in == 0 {
            0
        } else {
            self.in_fifo.len() / self.user_in
        }
    }

    fn out_frames(&self) -> usize {
        if self.user_out == 0 {
            0
        } else {
            self.out_fifo.len() / self.user_out
        }
    }

    fn run_block(&mut self, frames: usize) -> CallbackResult {
        self.in_scratch.clear();
        let take = frames * self.user_in;
        self.in_scratch.extend(self.in_fifo.drain(..take.min(self.in_fifo.len())));
        self.in_scratch.resize(take, 0.0);
        self.out_scratch.clear();
        self.out_scratch.resize(frames * self.user_out, 0.0);
        let info = CallbackInfo {
            time: self.time,
            flags: std::mem::take(&mut self.pending_flags),
            frames,
        };
        let result = (self.callback)(&self.in_scratch, &mut self.out_scratch, &info);
        self.out_fifo.extend(self.out_scratch.iter().copied());
        result
    }
}

impl SampleAdapter for BlockAdapter {
    fn reset(&mut self) {
        self.in_fifo.clear();
        self.out_fifo.clear();
        self.pending_flags = CallbackFlags::NONE;
        self.finished = None;
        self.output_wanted = true;
        if let Some(block) = self.block.filter(|_| self.user_in > 0 && self.user_out > 0) {
            self.out_fifo.resize(block * self.user_out, 0.0);
        }
    }

    fn begin_cycle(&mut self, time: TimeInfo, flags: CallbackFlags, frames: usize) {
        self.time = time;
        self.pending_flags |= flags;
        self.frames = frames;
        self.output_wanted = true;
    }

    fn set_input_region(&mut self, input: Option<HostRegion<'_>>) {
        if self.user_in == 0 || self.finished.is_some() {
            return;
        }
        match input {
            Some(host) => {
                let mut frame_buf = std::mem::take(&mut self.frame_scratch);
                frame_buf.resize(self.user_in, 0.0);
                for frame in 0..host.frames() {
                    host_to_user(&host, frame, &mut frame_buf, self.user_in);
                    self.in_fifo.extend(frame_buf.iter().copied());
                }
                self.frame_scratch = frame_buf;
            }
            None => {
                let n = self.frames * self.user_in;
                self.in_fifo.extend(std::iter::repeat_n(0.0, n));
            }
        }
    }

    fn set_output_region(&mut self, frames: Option<usize>) {
        self.output_wanted = frames.is_some();
        if let Some(f) = frames {
            self.frames = f;
        }
    }

    fn invoke_user_callback(&mut self) -> CallbackResult {
        if let Some(result) = self.finished {
            return result;
        }
        let mut result = CallbackResult::Continue;
        loop {
            let block = self.block.unwrap_or(self.frames);
            if block == 0 {
                break;
            }
            let ready = if self.user_in > 0 {
                self.in_frames() >= block
            } else {
                self.user_out > 0 && self.out_frames() < self.frames
            };
            if !ready {
                break;
            }
            result = self.run_block(block);
            if result != CallbackResult::Continue {
                self.finished = Some(result);
                self.in_fifo.clear();
                break;
            }
            if self.block.is_none() {
                break;
            }
        }
        result
    }

    fn end_cycle(&mut self, output: Option<HostRegionMut<'_>>) -> usize {
        if self.user_out == 0 {
            return 0;
        }
        let Some(mut host) = output.filter(|_| self.output_wanted) else {
            let drop = (self.frames * self.user_out).min(self.out_fifo.len());
            self.out_fifo.drain(..drop);
            return 0;
        };
        let frames = host.frames();
        let mut frame_buf = std::mem::take(&mut self.frame_scratch);
        frame_buf.resize(self.user_out, 0.0);
        for frame in 0..frames {
            for slot in frame_buf.iter_mut() {
                *slot = self.out_fifo.pop_front().unwrap_or(0.0);
            }
            user_to_host(&frame_buf, &mut host, frame);
        }
        self.frame_scratch = frame_buf;
        frames
    }

    fn is_output_drained(&self) -> bool {
        self.out_fifo.is_empty()
    }

    fn copy_input(&mut self, host: HostRegion<'_>, user: &mut [f32]) -> usize {
        if self.user_in == 0 {
            return 0;
        }
        let frames = host.frames().min(user.len() / self.user_in);
        for (frame, chunk) in user.chunks_mut(self.user_in).take(frames).enumerate() {
            host_to_user(&host, frame, chunk, self.user_in);
        }
        frames
    }

    fn copy_output(&mut self, user: &[f32], mut host: HostRegionMut<'_>) -> usize {
        if self.user_out == 0 {
            return 0;
        }
        let frames = host.frames().min(user.len() / self.user_out);
        for (frame, chunk) in user.chunks(self.user_out).take(frames).enumerate() {
            user_to_host(chunk, &mut host, frame);
        }
        frames
    }
}
