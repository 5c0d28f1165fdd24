use crate::error::{BackendError, BridgeError, NegotiationStep, Result};
use crate::format::{AccessLayout, DeviceFormat, SampleFormatDescriptor, translate};
use crate::hw::config::BridgeOptions;
use crate::hw::traits::{
    DescriptorSet, HwParamsOps, PcmBackend, PcmStream, StreamDirection, SwParamsOps,
};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Configuring,
    Ready,
    Started,
}

/// What the device accepted for one direction. Fixed until the stream closes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedConfig {
    pub descriptor: SampleFormatDescriptor,
    pub format: DeviceFormat,
    pub access: AccessLayout,
    pub rate: u32,
}

impl NegotiatedConfig {
    pub fn bytes_per_frame(&self) -> usize {
        self.descriptor.bytes_per_frame as usize
    }

    pub fn channels(&self) -> usize {
        self.descriptor.channels_per_frame as usize
    }
}

#[derive(Debug)]
pub struct DeviceSession<S: PcmStream> {
    label: &'static str,
    direction: StreamDirection,
    state: SessionState,
    stream: Option<S>,
    config: Option<NegotiatedConfig>,
}

fn at(step: NegotiationStep) -> impl FnOnce(BackendError) -> BridgeError {
    move |source| BridgeError::NegotiationFailed { step, source }
}

fn negotiate_stream<S: PcmStream>(
    stream: &S,
    desc: &SampleFormatDescriptor,
    options: &BridgeOptions,
) -> Result<NegotiatedConfig> {
    let format = translate(desc)?;
    let access = desc.access();

    let rate = {
        let hw = stream.hw_params_any().map_err(at(NegotiationStep::HwParamsAny))?;
        hw.set_access(access).map_err(at(NegotiationStep::Access))?;
        hw.set_format(format).map_err(at(NegotiationStep::Format))?;
        let rate = hw
            .set_rate_near(desc.sample_rate.round() as u32)
            .map_err(at(NegotiationStep::Rate))?;
        debug!("Channel count: {}", desc.channels_per_frame);
        hw.set_channels(desc.channels_per_frame)
            .map_err(at(NegotiationStep::Channels))?;
        stream.commit_hw_params(&hw).map_err(at(NegotiationStep::CommitHw))?;
        rate
    };

    let sw = stream
        .sw_params_current()
        .map_err(at(NegotiationStep::SwParamsCurrent))?;
    sw.set_avail_min(options.avail_min)
        .map_err(at(NegotiationStep::AvailMin))?;
    sw.set_start_threshold(options.start_threshold)
        .map_err(at(NegotiationStep::StartThreshold))?;
    stream.commit_sw_params(&sw).map_err(at(NegotiationStep::CommitSw))?;

    Ok(NegotiatedConfig {
        descriptor: *desc,
        format,
        access,
        rate,
    })
}

impl<S: PcmStream> DeviceSession<S> {
    pub fn new(label: &'static str, direction: StreamDirection) -> Self {
        Self {
            label,
            direction,
            state: SessionState::Closed,
            stream: None,
            config: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.state == SessionState::Started
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn config(&self) -> Option<&NegotiatedConfig> {
        self.config.as_ref()
    }

    /// Stream and configuration, available once negotiation succeeded.
    pub fn negotiated(&self) -> Option<(&S, &NegotiatedConfig)> {
        self.stream.as_ref().zip(self.config.as_ref())
    }

    pub fn open<B>(&mut self, backend: &B, device: &str) -> Result<()>
    where
        B: PcmBackend<Stream = S>,
    {
        if self.state != SessionState::Closed {
            return Err(BridgeError::AlreadyInitialized);
        }
        let stream = backend
            .open(device, self.direction)
            .map_err(|source| BridgeError::DeviceUnavailable {
                direction: self.direction.label(),
                device: device.to_string(),
                source,
            })?;
        self.stream = Some(stream);
        self.state = SessionState::Configuring;
        Ok(())
    }

    /// Applies `desc` to the open stream. Any failing step closes the session.
    pub fn negotiate(
        &mut self,
        desc: &SampleFormatDescriptor,
        options: &BridgeOptions,
    ) -> Result<NegotiatedConfig> {
        if self.state != SessionState::Configuring {
            return Err(BridgeError::NotInitialized);
        }
        let Some(stream) = self.stream.as_ref() else {
            return Err(BridgeError::NotInitialized);
        };
        match negotiate_stream(stream, desc, options) {
            Ok(config) => {
                if config.rate as f64 != desc.sample_rate.round() {
                    warn!(
                        "{} {} rate {} not available, device picked {}",
                        self.label,
                        self.direction.label(),
                        desc.sample_rate,
                        config.rate
                    );
                }
                self.config = Some(config);
                self.state = SessionState::Ready;
                Ok(config)
            }
            Err(e) => {
                error!("{} {} negotiation failed: {}", self.label, self.direction.label(), e);
                self.close();
                Err(e)
            }
        }
    }

    /// Prepares the stream for transfer and returns its pollable descriptors.
    pub fn prepare(&mut self) -> Result<DescriptorSet> {
        if self.state != SessionState::Ready {
            return Err(BridgeError::PrepareFailed(format!(
                "{} stream is not ready ({:?})",
                self.direction.label(),
                self.state
            )));
        }
        let Some(stream) = self.stream.as_ref() else {
            return Err(BridgeError::NotInitialized);
        };
        stream
            .prepare()
            .map_err(|e| BridgeError::PrepareFailed(format!("prepare failed: {e}")))?;
        let descriptors = stream
            .poll_descriptors()
            .map_err(|e| BridgeError::PrepareFailed(format!("poll descriptors failed: {e}")))?;
        debug!(
            "{} {} descriptor count: {}",
            self.label,
            self.direction.label(),
            descriptors.len()
        );
        self.state = SessionState::Started;
        Ok(descriptors)
    }

    /// Discards whatever the device still holds and leaves the stream ready.
    pub fn drop_pending(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        if let Err(e) = stream.drop_pending() {
            error!("{} {} drop failed: {}", self.label, self.direction.label(), e);
        }
        if self.state == SessionState::Started {
            self.state = SessionState::Ready;
        }
    }

    /// Blocks until queued frames have played.
    pub fn drain(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        stream.drain().map_err(BridgeError::DeviceWriteFailed)?;
        if self.state == SessionState::Started {
            self.state = SessionState::Ready;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("{} {} closed", self.label, self.direction.label());
        }
        self.config = None;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatFlags;
    use crate::hw::mock::{MockBackend, MockStream};
    use crate::hw::traits::Readiness;

    fn session() -> DeviceSession<MockStream> {
        DeviceSession::new("Mock", StreamDirection::Output)
    }

    fn stereo() -> SampleFormatDescriptor {
        SampleFormatDescriptor::s16le_interleaved(48_000.0, 2)
    }

    #[test]
    fn walks_the_state_machine() {
        let backend = MockBackend::new();
        let mut s = session();
        assert_eq!(s.state(), SessionState::Closed);
        s.open(&backend, "default").unwrap();
        assert_eq!(s.state(), SessionState::Configuring);
        let config = s.negotiate(&stereo(), &BridgeOptions::default()).unwrap();
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(config.format, DeviceFormat::S16Le);
        assert_eq!(config.rate, 48_000);
        let set = s.prepare().unwrap();
        assert_eq!(s.state(), SessionState::Started);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].events, Readiness::WRITE);
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(backend.state().open_streams, 0);
    }

    #[test]
    fn negotiation_applies_every_parameter() {
        let backend = MockBackend::new();
        let mut s = session();
        s.open(&backend, "default").unwrap();
        let desc = SampleFormatDescriptor::linear_pcm(
            44_100.0,
            32,
            4,
            FormatFlags {
                float: true,
                non_interleaved: true,
                ..FormatFlags::default()
            },
        );
        let options = BridgeOptions {
            avail_min: 1024,
            start_threshold: 7,
            ..BridgeOptions::default()
        };
        s.negotiate(&desc, &options).unwrap();
        let st = backend.state();
        assert_eq!(st.access, Some(AccessLayout::NonInterleaved));
        assert_eq!(st.format, Some(DeviceFormat::FloatLe));
        assert_eq!(st.channels, Some(4));
        assert_eq!(st.avail_min, Some(1024));
        assert_eq!(st.start_threshold, Some(7));
        assert_eq!(st.live_params, 0);
    }

    #[test]
    fn twenty_four_bit_negotiates_packed_samples() {
        let backend = MockBackend::new();
        let mut s = session();
        s.open(&backend, "default").unwrap();
        let desc = SampleFormatDescriptor::linear_pcm(
            48_000.0,
            24,
            2,
            FormatFlags {
                signed: true,
                ..FormatFlags::default()
            },
        );
        let config = s.negotiate(&desc, &BridgeOptions::default()).unwrap();
        assert_eq!(config.format, DeviceFormat::S243Le);
        assert_eq!(config.bytes_per_frame(), 6);
        assert_eq!(
            config.bytes_per_frame(),
            config.format.sample_bytes() as usize * config.channels()
        );
        assert_eq!(backend.state().format, Some(DeviceFormat::S243Le));
    }

    #[test]
    fn actual_rate_is_read_back() {
        let backend = MockBackend::new();
        backend.state().rate_override = Some(44_100);
        let mut s = session();
        s.open(&backend, "default").unwrap();
        let config = s.negotiate(&stereo(), &BridgeOptions::default()).unwrap();
        assert_eq!(config.rate, 44_100);
        assert_eq!(s.config().map(|c| c.rate), Some(44_100));
    }

    #[test]
    fn failed_step_releases_params_and_closes() {
        let steps = [
            NegotiationStep::HwParamsAny,
            NegotiationStep::Access,
            NegotiationStep::Format,
            NegotiationStep::Rate,
            NegotiationStep::Channels,
            NegotiationStep::CommitHw,
            NegotiationStep::SwParamsCurrent,
            NegotiationStep::AvailMin,
            NegotiationStep::StartThreshold,
            NegotiationStep::CommitSw,
        ];
        for step in steps {
            let backend = MockBackend::new();
            backend.state().fail_step = Some(step);
            let mut s = session();
            s.open(&backend, "default").unwrap();
            match s.negotiate(&stereo(), &BridgeOptions::default()) {
                Err(BridgeError::NegotiationFailed { step: failed, source }) => {
                    assert_eq!(failed, step);
                    assert!(source.message.contains("mock rejects"));
                }
                other => panic!("step {step:?}: unexpected {other:?}"),
            }
            assert_eq!(s.state(), SessionState::Closed);
            assert!(!s.is_open());
            let st = backend.state();
            assert_eq!(st.live_params, 0, "params leaked at {step:?}");
            assert_eq!(st.open_streams, 0);
        }
    }

    #[test]
    fn bad_format_closes_before_touching_params() {
        let backend = MockBackend::new();
        let mut s = session();
        s.open(&backend, "default").unwrap();
        let mut desc = stereo();
        desc.bits_per_channel = 12;
        assert!(matches!(
            s.negotiate(&desc, &BridgeOptions::default()),
            Err(BridgeError::InvalidBitDepth(12))
        ));
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(backend.state().access, None);
    }

    #[test]
    fn open_failure_reports_backend_text() {
        let backend = MockBackend::new();
        backend.state().fail_open = Some(BackendError::new(16, "Device or resource busy"));
        let mut s = session();
        let err = s.open(&backend, "hw:3").unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to open playback PCM 'hw:3': Device or resource busy"
        );
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn double_open_is_rejected() {
        let backend = MockBackend::new();
        let mut s = session();
        s.open(&backend, "default").unwrap();
        assert!(matches!(
            s.open(&backend, "default"),
            Err(BridgeError::AlreadyInitialized)
        ));
        assert_eq!(backend.state().open_streams, 1);
    }

    #[test]
    fn prepare_requires_ready() {
        let backend = MockBackend::new();
        let mut s = session();
        assert!(matches!(s.prepare(), Err(BridgeError::PrepareFailed(_))));
        s.open(&backend, "default").unwrap();
        assert!(matches!(s.prepare(), Err(BridgeError::PrepareFailed(_))));
        assert_eq!(backend.state().prepares, 0);
    }

    #[test]
    fn prepare_failure_keeps_stream_ready() {
        let backend = MockBackend::new();
        let mut s = session();
        s.open(&backend, "default").unwrap();
        s.negotiate(&stereo(), &BridgeOptions::default()).unwrap();
        backend.state().fail_prepare = Some(BackendError::new(77, "File descriptor in bad state"));
        assert!(matches!(s.prepare(), Err(BridgeError::PrepareFailed(_))));
        assert_eq!(s.state(), SessionState::Ready);
    }

    #[test]
    fn drop_pending_returns_to_ready() {
        let backend = MockBackend::new();
        let mut s = session();
        s.open(&backend, "default").unwrap();
        s.negotiate(&stereo(), &BridgeOptions::default()).unwrap();
        s.prepare().unwrap();
        s.drop_pending();
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(backend.state().drops, 1);
    }

    #[test]
    fn close_is_idempotent() {
        let mut s = session();
        s.close();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
    }
}
