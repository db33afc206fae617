use crate::error::{Result, StreamError};
use crate::timing::CpuLoad;
use crate::xrun::XrunCounters;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Active,
    /// The callback ended the stream on its own; the worker still has to be
    /// joined by `stop`, `abort` or the next `start`.
    CallbackFinished,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Active,
            2 => StreamState::CallbackFinished,
            _ => StreamState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StreamState::Stopped => 0,
            StreamState::Active => 1,
            StreamState::CallbackFinished => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stopped,
    Aborted,
    Completed,
    CallbackAborted,
    Failed,
}

pub type FinishedCallback = Box<dyn FnMut(FinishReason) + Send + 'static>;

#[derive(Debug, Default)]
enum Startup {
    #[default]
    Pending,
    Started,
    Failed(StreamError),
    Abandoned,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the control thread and the worker touch concurrently.
pub(crate) struct Shared {
    state: AtomicU8,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) abort_requested: AtomicBool,
    pub(crate) cpu_load: CpuLoad,
    pub(crate) counters: XrunCounters,
    pub(crate) state_lock: Mutex<()>,
    startup: Mutex<Startup>,
    startup_cv: Condvar,
    fatal: Mutex<Option<StreamError>>,
    finished: Mutex<Option<FinishedCallback>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(StreamState::Stopped.as_u8()),
            stop_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            cpu_load: CpuLoad::new(),
            counters: XrunCounters::default(),
            state_lock: Mutex::new(()),
            startup: Mutex::new(Startup::Pending),
            startup_cv: Condvar::new(),
            fatal: Mutex::new(None),
            finished: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn prepare_run(&self) {
        self.stop_requested.store(false, Ordering::Release);
        self.abort_requested.store(false, Ordering::Release);
        *lock(&self.startup) = Startup::Pending;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    /// Called by the worker once hardware is running (or failed to). A
    /// successful start marks the stream active. Returns false when the
    /// control thread already gave up waiting.
    pub(crate) fn confirm_startup(&self, result: Result<()>) -> bool {
        let mut st = lock(&self.startup);
        if matches!(*st, Startup::Abandoned) {
            return false;
        }
        *st = match result {
            Ok(()) => {
                self.set_state(StreamState::Active);
                Startup::Started
            }
            Err(e) => Startup::Failed(e),
        };
        self.startup_cv.notify_all();
        true
    }

    /// Waits for the worker's startup confirmation. `None` on timeout, in
    /// which case a late confirmation is refused.
    pub(crate) fn wait_startup(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut st = lock(&self.startup);
        loop {
            match std::mem::take(&mut *st) {
                Startup::Started => return Some(Ok(())),
                Startup::Failed(e) => return Some(Err(e)),
                Startup::Abandoned | Startup::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                *st = Startup::Abandoned;
                return None;
            }
            st = self
                .startup_cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn store_fatal(&self, e: StreamError) {
        let mut slot = lock(&self.fatal);
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    pub(crate) fn take_fatal(&self) -> Option<StreamError> {
        lock(&self.fatal).take()
    }

    pub(crate) fn set_finished_callback(&self, callback: Option<FinishedCallback>) {
        *lock(&self.finished) = callback;
    }

    pub(crate) fn notify_finished(&self, reason: FinishReason) {
        if let Some(callback) = lock(&self.finished).as_mut() {
            callback(reason);
        }
    }
}
