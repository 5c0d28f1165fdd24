use super::traits::{
    DescriptorSet, HwParamsOps, PcmBackend, PcmStream, PollDescriptor, Readiness, StreamDirection,
    SwParamsOps,
};
use crate::error::BackendError;
use crate::format::{AccessLayout, DeviceFormat};
use alsa::pcm::{Access, Frames, HwParams, PCM, SwParams};
use alsa::poll::Flags;
use alsa::{Direction, PollDescriptors, ValueOr};
use nix::libc;

#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaBackend;

impl PcmBackend for AlsaBackend {
    type Stream = AlsaStream;

    const LABEL: &'static str = "ALSA";

    fn open(&self, device: &str, direction: StreamDirection) -> Result<AlsaStream, BackendError> {
        let dir = match direction {
            StreamDirection::Output => Direction::Playback,
            StreamDirection::Input => Direction::Capture,
        };
        let pcm = PCM::new(device, dir, false)?;
        Ok(AlsaStream { pcm })
    }
}

pub struct AlsaStream {
    pcm: PCM,
}

impl std::fmt::Debug for AlsaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlsaStream")
            .field("state", &self.pcm.state())
            .finish()
    }
}

impl HwParamsOps for HwParams<'_> {
    fn set_access(&self, access: AccessLayout) -> Result<(), BackendError> {
        let access = match access {
            AccessLayout::Interleaved => Access::RWInterleaved,
            AccessLayout::NonInterleaved => Access::RWNonInterleaved,
        };
        Ok(HwParams::set_access(self, access)?)
    }

    fn set_format(&self, format: DeviceFormat) -> Result<(), BackendError> {
        Ok(HwParams::set_format(self, format.into())?)
    }

    fn set_rate_near(&self, rate: u32) -> Result<u32, BackendError> {
        Ok(HwParams::set_rate_near(self, rate, ValueOr::Nearest)?)
    }

    fn set_channels(&self, channels: u32) -> Result<(), BackendError> {
        Ok(HwParams::set_channels(self, channels)?)
    }
}

impl SwParamsOps for SwParams<'_> {
    fn set_avail_min(&self, frames: i64) -> Result<(), BackendError> {
        Ok(SwParams::set_avail_min(self, frames as Frames)?)
    }

    fn set_start_threshold(&self, frames: i64) -> Result<(), BackendError> {
        Ok(SwParams::set_start_threshold(self, frames as Frames)?)
    }
}

impl PcmStream for AlsaStream {
    type HwParams<'a> = HwParams<'a>;
    type SwParams<'a> = SwParams<'a>;

    fn hw_params_any(&self) -> Result<HwParams<'_>, BackendError> {
        Ok(HwParams::any(&self.pcm)?)
    }

    fn commit_hw_params(&self, params: &HwParams<'_>) -> Result<(), BackendError> {
        Ok(self.pcm.hw_params(params)?)
    }

    fn sw_params_current(&self) -> Result<SwParams<'_>, BackendError> {
        Ok(self.pcm.sw_params_current()?)
    }

    fn commit_sw_params(&self, params: &SwParams<'_>) -> Result<(), BackendError> {
        Ok(self.pcm.sw_params(params)?)
    }

    fn prepare(&self) -> Result<(), BackendError> {
        Ok(self.pcm.prepare()?)
    }

    fn drop_pending(&self) -> Result<(), BackendError> {
        Ok(self.pcm.drop()?)
    }

    fn drain(&self) -> Result<(), BackendError> {
        Ok(self.pcm.drain()?)
    }

    fn recover(&self, err: &BackendError) -> Result<(), BackendError> {
        Ok(self.pcm.recover(-err.errno, false)?)
    }

    fn write_interleaved(&self, data: &[u8]) -> Result<usize, BackendError> {
        Ok(self.pcm.io_bytes().writei(data)?)
    }

    fn write_planar(&self, channels: &[&[u8]], frames: usize) -> Result<usize, BackendError> {
        let needed = self.pcm.frames_to_bytes(frames as Frames) as usize;
        if channels.iter().any(|c| c.len() * channels.len() < needed) {
            return Err(BackendError::from_errno(libc::EINVAL));
        }
        let ptrs: Vec<*const u8> = channels.iter().map(|c| c.as_ptr()).collect();
        let io = self.pcm.io_bytes();
        // Each slice holds at least `frames` samples of one channel.
        Ok(unsafe { io.writen(&ptrs, frames)? })
    }

    fn poll_descriptors(&self) -> Result<DescriptorSet, BackendError> {
        let fds = PollDescriptors::get(&self.pcm)?;
        Ok(fds
            .iter()
            .map(|p| PollDescriptor {
                fd: p.fd,
                events: Readiness::from_poll(p.events),
            })
            .collect())
    }

    fn revents(&self, pfd: &PollDescriptor, raw: Readiness) -> Result<Readiness, BackendError> {
        let fds = [libc::pollfd {
            fd: pfd.fd,
            events: pfd.events.to_poll(),
            revents: raw.to_poll(),
        }];
        let flags = PollDescriptors::revents(&self.pcm, &fds)?;
        Ok(Readiness {
            readable: flags.contains(Flags::IN),
            writable: flags.contains(Flags::OUT),
        })
    }
}
