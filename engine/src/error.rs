use crate::device::Direction;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("incompatible hardware constraints: {0}")]
    IncompatibleHardwareConstraints(String),

    #[error("unsupported sample rate {requested} Hz (device configured {actual} Hz)")]
    UnsupportedSampleRate { requested: f64, actual: f64 },

    #[error("unsupported {direction} channel count {requested} (device maximum {max})")]
    UnsupportedChannelCount {
        direction: Direction,
        requested: u16,
        max: u16,
    },

    #[error("requested buffer of {requested} frames exceeds device maximum of {max}")]
    BufferTooLarge { requested: u32, max: u32 },

    #[error("invalid stream configuration: {0}")]
    InvalidConfiguration(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("stream worker did not confirm startup within {0:?}")]
    StartupTimedOut(Duration),

    #[error("stream is active")]
    StreamIsActive,

    #[error("stream is stopped")]
    StreamIsStopped,

    #[error("operation does not match the stream mode (callback vs blocking)")]
    IncompatibleStreamMode,

    #[error("cannot read from an output-only stream")]
    CanNotReadFromOutputOnlyStream,

    #[error("cannot write to an input-only stream")]
    CanNotWriteToInputOnlyStream,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("xrun")]
    Xrun,

    #[error("device lost: {0}")]
    Lost(String),

    #[error("configuration rejected: {0}")]
    Rejected(String),

    #[error("device i/o failed: {0}")]
    Io(String),
}

impl DeviceError {
    pub fn is_xrun(&self) -> bool {
        matches!(self, DeviceError::Xrun)
    }

    pub(crate) fn into_stream_error(self, name: &str) -> StreamError {
        match self {
            DeviceError::Xrun => {
                StreamError::InternalError(format!("{name}: unrecovered xrun reached control path"))
            }
            DeviceError::Lost(e) | DeviceError::Io(e) => StreamError::DeviceLost(format!("{name}: {e}")),
            DeviceError::Rejected(e) => {
                StreamError::IncompatibleHardwareConstraints(format!("{name}: {e}"))
            }
        }
    }
}
