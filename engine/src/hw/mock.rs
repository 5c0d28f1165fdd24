//! Scripted in-memory backend for exercising the bridge without a sound card.

use super::traits::{
    DescriptorSet, HwParamsOps, PcmBackend, PcmStream, PollDescriptor, Readiness, StreamDirection,
    SwParamsOps,
};
use crate::error::{BackendError, NegotiationStep};
use crate::format::{AccessLayout, DeviceFormat};
use nix::libc;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub access: AccessLayout,
    pub byte_lens: Vec<usize>,
    pub frames: usize,
    pub silent: bool,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub fail_open: Option<BackendError>,
    pub fail_step: Option<NegotiationStep>,
    pub fail_prepare: Option<BackendError>,
    pub fail_recover: Option<BackendError>,
    /// Consumed one per write call. `Ok(None)` accepts every frame.
    pub write_script: VecDeque<Result<Option<usize>, BackendError>>,
    pub rate_override: Option<u32>,
    pub revents_override: Option<Readiness>,
    pub bytes_per_frame: usize,

    pub writes: Vec<MockWrite>,
    pub live_params: usize,
    pub opened: Vec<StreamDirection>,
    pub open_streams: usize,
    pub recoveries: usize,
    pub prepares: usize,
    pub drops: usize,
    pub drains: usize,
    pub access: Option<AccessLayout>,
    pub format: Option<DeviceFormat>,
    pub channels: Option<u32>,
    pub avail_min: Option<i64>,
    pub start_threshold: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.state().bytes_per_frame = 4;
        backend
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

impl PcmBackend for MockBackend {
    type Stream = MockStream;

    const LABEL: &'static str = "Mock";

    fn open(&self, _device: &str, direction: StreamDirection) -> Result<MockStream, BackendError> {
        let mut st = self.state();
        if let Some(err) = st.fail_open.clone() {
            return Err(err);
        }
        st.opened.push(direction);
        st.open_streams += 1;
        let (read_end, write_end) = pipe();
        Ok(MockStream {
            state: self.state.clone(),
            direction,
            read_end,
            write_end,
        })
    }
}

#[derive(Debug)]
pub struct MockStream {
    state: Arc<Mutex<MockState>>,
    direction: StreamDirection,
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl MockStream {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    fn step(&self, step: NegotiationStep) -> Result<(), BackendError> {
        if self.state().fail_step == Some(step) {
            return Err(BackendError::new(libc::EINVAL, format!("mock rejects {step}")));
        }
        Ok(())
    }

    fn scripted_write(&self) -> Result<Option<usize>, BackendError> {
        self.state().write_script.pop_front().unwrap_or(Ok(None))
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.state().open_streams -= 1;
    }
}

#[derive(Debug)]
pub struct MockParams<'a> {
    stream: &'a MockStream,
}

impl<'a> MockParams<'a> {
    fn new(stream: &'a MockStream) -> Self {
        stream.state().live_params += 1;
        Self { stream }
    }
}

impl Drop for MockParams<'_> {
    fn drop(&mut self) {
        self.stream.state().live_params -= 1;
    }
}

impl HwParamsOps for MockParams<'_> {
    fn set_access(&self, access: AccessLayout) -> Result<(), BackendError> {
        self.stream.step(NegotiationStep::Access)?;
        self.stream.state().access = Some(access);
        Ok(())
    }

    fn set_format(&self, format: DeviceFormat) -> Result<(), BackendError> {
        self.stream.step(NegotiationStep::Format)?;
        self.stream.state().format = Some(format);
        Ok(())
    }

    fn set_rate_near(&self, rate: u32) -> Result<u32, BackendError> {
        self.stream.step(NegotiationStep::Rate)?;
        Ok(self.stream.state().rate_override.unwrap_or(rate))
    }

    fn set_channels(&self, channels: u32) -> Result<(), BackendError> {
        self.stream.step(NegotiationStep::Channels)?;
        self.stream.state().channels = Some(channels);
        Ok(())
    }
}

impl SwParamsOps for MockParams<'_> {
    fn set_avail_min(&self, frames: i64) -> Result<(), BackendError> {
        self.stream.step(NegotiationStep::AvailMin)?;
        self.stream.state().avail_min = Some(frames);
        Ok(())
    }

    fn set_start_threshold(&self, frames: i64) -> Result<(), BackendError> {
        self.stream.step(NegotiationStep::StartThreshold)?;
        self.stream.state().start_threshold = Some(frames);
        Ok(())
    }
}

impl PcmStream for MockStream {
    type HwParams<'a> = MockParams<'a>;
    type SwParams<'a> = MockParams<'a>;

    fn hw_params_any(&self) -> Result<MockParams<'_>, BackendError> {
        self.step(NegotiationStep::HwParamsAny)?;
        Ok(MockParams::new(self))
    }

    fn commit_hw_params(&self, _params: &MockParams<'_>) -> Result<(), BackendError> {
        self.step(NegotiationStep::CommitHw)
    }

    fn sw_params_current(&self) -> Result<MockParams<'_>, BackendError> {
        self.step(NegotiationStep::SwParamsCurrent)?;
        Ok(MockParams::new(self))
    }

    fn commit_sw_params(&self, _params: &MockParams<'_>) -> Result<(), BackendError> {
        self.step(NegotiationStep::CommitSw)
    }

    fn prepare(&self) -> Result<(), BackendError> {
        let mut st = self.state();
        if let Some(err) = st.fail_prepare.clone() {
            return Err(err);
        }
        st.prepares += 1;
        Ok(())
    }

    fn drop_pending(&self) -> Result<(), BackendError> {
        self.state().drops += 1;
        Ok(())
    }

    fn drain(&self) -> Result<(), BackendError> {
        self.state().drains += 1;
        Ok(())
    }

    fn recover(&self, _err: &BackendError) -> Result<(), BackendError> {
        let mut st = self.state();
        st.recoveries += 1;
        match st.fail_recover.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write_interleaved(&self, data: &[u8]) -> Result<usize, BackendError> {
        let scripted = self.scripted_write()?;
        let mut st = self.state();
        let frames = data.len() / st.bytes_per_frame.max(1);
        let written = scripted.unwrap_or(frames).min(frames);
        st.writes.push(MockWrite {
            access: AccessLayout::Interleaved,
            byte_lens: vec![data.len()],
            frames: written,
            silent: data.iter().all(|b| *b == 0),
        });
        Ok(written)
    }

    fn write_planar(&self, channels: &[&[u8]], frames: usize) -> Result<usize, BackendError> {
        let scripted = self.scripted_write()?;
        let written = scripted.unwrap_or(frames).min(frames);
        self.state().writes.push(MockWrite {
            access: AccessLayout::NonInterleaved,
            byte_lens: channels.iter().map(|c| c.len()).collect(),
            frames: written,
            silent: channels.iter().all(|c| c.iter().all(|b| *b == 0)),
        });
        Ok(written)
    }

    fn poll_descriptors(&self) -> Result<DescriptorSet, BackendError> {
        // The write end of an idle pipe always polls writable, the read end never readable.
        let pfd = match self.direction {
            StreamDirection::Output => PollDescriptor {
                fd: self.write_end.as_raw_fd(),
                events: Readiness::WRITE,
            },
            StreamDirection::Input => PollDescriptor {
                fd: self.read_end.as_raw_fd(),
                events: Readiness::READ,
            },
        };
        Ok(vec![pfd])
    }

    fn revents(&self, _pfd: &PollDescriptor, raw: Readiness) -> Result<Readiness, BackendError> {
        Ok(self.state().revents_override.unwrap_or(raw))
    }
}
