use crate::format::FormatId;
use nix::libc;
use thiserror::Error;

/// Error reported by a device backend call, with the backend's own text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub errno: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        Self::new(errno, nix::errno::Errno::from_raw(errno).desc())
    }

    /// Interrupted call or underrun; both are cleared by a backend recover.
    pub fn is_transient(&self) -> bool {
        self.errno == libc::EINTR || self.errno == libc::EPIPE
    }
}

#[cfg(target_os = "linux")]
impl From<alsa::Error> for BackendError {
    fn from(err: alsa::Error) -> Self {
        Self::new(err.errno(), err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    HwParamsAny,
    Access,
    Format,
    Rate,
    Channels,
    CommitHw,
    SwParamsCurrent,
    AvailMin,
    StartThreshold,
    CommitSw,
}

impl std::fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HwParamsAny => "init hw params",
            Self::Access => "set access",
            Self::Format => "set format",
            Self::Rate => "set sample rate",
            Self::Channels => "set channel count",
            Self::CommitHw => "set HW parameters",
            Self::SwParamsCurrent => "init sw params",
            Self::AvailMin => "set avail min",
            Self::StartThreshold => "set start threshold",
            Self::CommitSw => "set SW parameters",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unsupported format id {0:?}")]
    UnsupportedFormat(FormatId),
    #[error("invalid bits per channel: {0}")]
    InvalidBitDepth(u32),
    #[error("failed to open {direction} PCM '{device}': {source}")]
    DeviceUnavailable {
        direction: &'static str,
        device: String,
        source: BackendError,
    },
    #[error("failed to {step}: {source}")]
    NegotiationFailed {
        step: NegotiationStep,
        source: BackendError,
    },
    #[error("prepare failed: {0}")]
    PrepareFailed(String),
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("not initialized")]
    NotInitialized,
    #[error("no render source connected")]
    NoRenderSource,
    #[error("initialization failed: {0}")]
    InitializationFailed(Box<BridgeError>),
    #[error("buffer layout mismatch: {0}")]
    BufferLayoutMismatch(String),
    #[error("device write failed: {0}")]
    DeviceWriteFailed(BackendError),
    #[error("device write failed again after recovery: {0}")]
    RecoveryExhausted(BackendError),
    #[error("invalid bus {0}")]
    InvalidBus(u32),
    #[error("{0} not implemented")]
    NotImplemented(&'static str),
    #[error("renderer failed with status {0}")]
    Render(i32),
    #[error("event scheduler: {0}")]
    Scheduler(String),
}

/// Status codes handed back to the host, modelled on audio unit results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoErr,
    ParamErr,
    Unimplemented,
    FormatNotSupported,
    Initialized,
    Uninitialized,
    FailedInitialization,
    NoConnection,
    RenderFailed(i32),
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Self::NoErr => 0,
            Self::ParamErr => -50,
            Self::Unimplemented => -4,
            Self::FormatNotSupported => -10868,
            Self::Initialized => -10849,
            Self::Uninitialized => -10867,
            Self::FailedInitialization => -10875,
            Self::NoConnection => -10876,
            Self::RenderFailed(code) => code,
        }
    }
}

impl BridgeError {
    pub fn status(&self) -> Status {
        match self {
            Self::UnsupportedFormat(_) | Self::InvalidBitDepth(_) => Status::FormatNotSupported,
            Self::AlreadyInitialized => Status::Initialized,
            Self::NotInitialized => Status::Uninitialized,
            Self::DeviceUnavailable { .. }
            | Self::NegotiationFailed { .. }
            | Self::PrepareFailed(_)
            | Self::NoRenderSource
            | Self::InitializationFailed(_)
            | Self::Scheduler(_) => Status::FailedInitialization,
            Self::BufferLayoutMismatch(_) | Self::InvalidBus(_) => Status::ParamErr,
            Self::DeviceWriteFailed(_) | Self::RecoveryExhausted(_) => Status::NoConnection,
            Self::NotImplemented(_) => Status::Unimplemented,
            Self::Render(code) => Status::RenderFailed(*code),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

pub fn status_of<T>(result: &Result<T>) -> Status {
    match result {
        Ok(_) => Status::NoErr,
        Err(e) => e.status(),
    }
}
