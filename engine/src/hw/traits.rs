use crate::error::BackendError;
use crate::format::{AccessLayout, DeviceFormat};
use nix::libc;
use std::os::fd::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Output,
    Input,
}

impl StreamDirection {
    pub fn label(self) -> &'static str {
        match self {
            Self::Output => "playback",
            Self::Input => "capture",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READ: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITE: Self = Self {
        readable: false,
        writable: true,
    };

    pub fn from_poll(bits: libc::c_short) -> Self {
        Self {
            readable: bits & libc::POLLIN != 0,
            writable: bits & libc::POLLOUT != 0,
        }
    }

    pub fn to_poll(self) -> libc::c_short {
        let mut bits = 0;
        if self.readable {
            bits |= libc::POLLIN;
        }
        if self.writable {
            bits |= libc::POLLOUT;
        }
        bits
    }

    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}

/// A pollable descriptor of a prepared stream and the readiness it waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDescriptor {
    pub fd: RawFd,
    pub events: Readiness,
}

pub type DescriptorSet = Vec<PollDescriptor>;

/// Device backend that can open PCM streams by name.
pub trait PcmBackend: Send + Sync + 'static {
    type Stream: PcmStream;

    const LABEL: &'static str;

    fn open(&self, device: &str, direction: StreamDirection) -> Result<Self::Stream, BackendError>;
}

/// Hardware parameter space of an open stream. Dropping it releases it.
pub trait HwParamsOps {
    fn set_access(&self, access: AccessLayout) -> Result<(), BackendError>;
    fn set_format(&self, format: DeviceFormat) -> Result<(), BackendError>;
    /// Returns the rate the backend actually picked.
    fn set_rate_near(&self, rate: u32) -> Result<u32, BackendError>;
    fn set_channels(&self, channels: u32) -> Result<(), BackendError>;
}

pub trait SwParamsOps {
    fn set_avail_min(&self, frames: i64) -> Result<(), BackendError>;
    fn set_start_threshold(&self, frames: i64) -> Result<(), BackendError>;
}

/// One open PCM stream. Closing happens on drop.
pub trait PcmStream: Send + 'static {
    type HwParams<'a>: HwParamsOps
    where
        Self: 'a;
    type SwParams<'a>: SwParamsOps
    where
        Self: 'a;

    fn hw_params_any(&self) -> Result<Self::HwParams<'_>, BackendError>;
    fn commit_hw_params(&self, params: &Self::HwParams<'_>) -> Result<(), BackendError>;
    fn sw_params_current(&self) -> Result<Self::SwParams<'_>, BackendError>;
    fn commit_sw_params(&self, params: &Self::SwParams<'_>) -> Result<(), BackendError>;

    fn prepare(&self) -> Result<(), BackendError>;
    /// Stops the stream, discarding pending frames.
    fn drop_pending(&self) -> Result<(), BackendError>;
    /// Stops the stream after pending frames have played.
    fn drain(&self) -> Result<(), BackendError>;
    fn recover(&self, err: &BackendError) -> Result<(), BackendError>;

    /// Writes whole interleaved frames, returning the frame count accepted.
    fn write_interleaved(&self, data: &[u8]) -> Result<usize, BackendError>;
    /// Writes `frames` frames from one buffer per channel.
    fn write_planar(&self, channels: &[&[u8]], frames: usize) -> Result<usize, BackendError>;

    fn poll_descriptors(&self) -> Result<DescriptorSet, BackendError>;
    /// Translates raw readiness on `pfd` into what the stream is actually ready for.
    fn revents(&self, pfd: &PollDescriptor, raw: Readiness) -> Result<Readiness, BackendError>;
}
