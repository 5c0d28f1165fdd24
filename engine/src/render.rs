use crate::buffer::{AudioBufferGroup, INPUT_BUS, InputConsumer, OUTPUT_BUS, RenderFlags, TimeStamp};
use crate::error::{BackendError, BridgeError, Result};
use crate::format::AccessLayout;
use crate::hw::traits::PcmStream;
use crate::session::{DeviceSession, NegotiatedConfig};
use tracing::{error, trace, warn};

/// Runs `write`, recovering from an interrupt or underrun at most
/// `max_recoveries` times before giving up on the write.
pub fn write_with_recovery<S, F>(
    label: &str,
    stream: &S,
    max_recoveries: usize,
    mut write: F,
) -> Result<usize>
where
    S: PcmStream,
    F: FnMut() -> std::result::Result<usize, BackendError>,
{
    let mut recoveries = 0;
    loop {
        match write() {
            Ok(frames) => return Ok(frames),
            Err(e) if e.is_transient() => {
                if recoveries >= max_recoveries {
                    error!("{label} playback write failed after {recoveries} recoveries: {e}");
                    return Err(BridgeError::RecoveryExhausted(e));
                }
                recoveries += 1;
                warn!("{label} playback write interrupted: {e}; recovering");
                if let Err(re) = stream.recover(&e) {
                    warn!("{label} playback recover failed: {re}");
                }
            }
            Err(e) => {
                error!("{label} playback write failed: {e}");
                return Err(BridgeError::DeviceWriteFailed(e));
            }
        }
    }
}

/// Entry point for audio crossing the bridge, demultiplexed by bus and layout.
pub struct RenderAdapter {
    label: &'static str,
    max_recoveries: usize,
    input_planar: bool,
    input_consumer: Option<Box<dyn InputConsumer>>,
}

impl std::fmt::Debug for RenderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderAdapter")
            .field("label", &self.label)
            .field("max_recoveries", &self.max_recoveries)
            .field("input_planar", &self.input_planar)
            .field("input_consumer", &self.input_consumer.is_some())
            .finish()
    }
}

impl RenderAdapter {
    pub fn new(label: &'static str, max_recoveries: usize) -> Self {
        Self {
            label,
            max_recoveries,
            input_planar: false,
            input_consumer: None,
        }
    }

    pub fn set_input_planar(&mut self, planar: bool) {
        self.input_planar = planar;
    }

    pub fn set_input_consumer(&mut self, consumer: Option<Box<dyn InputConsumer>>) {
        self.input_consumer = consumer;
    }

    pub fn has_input_consumer(&self) -> bool {
        self.input_consumer.is_some()
    }

    pub fn render<S: PcmStream>(
        &mut self,
        output: &DeviceSession<S>,
        flags: &mut RenderFlags,
        timestamp: &TimeStamp,
        bus: u32,
        frames: u32,
        buffers: &AudioBufferGroup,
    ) -> Result<()> {
        match bus {
            OUTPUT_BUS => self.render_output(output, buffers),
            INPUT_BUS => self.render_input(flags, timestamp, frames),
            other => Err(BridgeError::InvalidBus(other)),
        }
    }

    fn render_output<S: PcmStream>(
        &self,
        output: &DeviceSession<S>,
        buffers: &AudioBufferGroup,
    ) -> Result<()> {
        let (stream, config) = output.negotiated().ok_or(BridgeError::NotInitialized)?;
        match config.access {
            AccessLayout::Interleaved => self.write_interleaved(stream, config, buffers),
            AccessLayout::NonInterleaved => self.write_planar(stream, config, buffers),
        }
    }

    fn write_interleaved<S: PcmStream>(
        &self,
        stream: &S,
        config: &NegotiatedConfig,
        buffers: &AudioBufferGroup,
    ) -> Result<()> {
        let bpf = config.bytes_per_frame().max(1);
        for buffer in &buffers.buffers {
            let bytes = buffer.byte_len();
            trace!("Writing {bytes} bytes into sound card");
            let frames = bytes / bpf;
            if bytes % bpf != 0 {
                warn!(
                    "{} buffer of {} bytes is not a whole number of {}-byte frames",
                    self.label, bytes, bpf
                );
            }
            if frames == 0 {
                continue;
            }
            let data = &buffer.data[..frames * bpf];
            let written = write_with_recovery(self.label, stream, self.max_recoveries, || {
                stream.write_interleaved(data)
            })?;
            if written < frames {
                error!(
                    "{} playback short write: {} of {} frames",
                    self.label, written, frames
                );
            }
        }
        Ok(())
    }

    fn write_planar<S: PcmStream>(
        &self,
        stream: &S,
        config: &NegotiatedConfig,
        buffers: &AudioBufferGroup,
    ) -> Result<()> {
        if buffers.len() != config.channels() {
            error!(
                "{} incorrect buffer count for planar audio: {} for {} channels",
                self.label,
                buffers.len(),
                config.channels()
            );
            return Err(BridgeError::BufferLayoutMismatch(format!(
                "{} buffers for {} channels",
                buffers.len(),
                config.channels()
            )));
        }
        let size = buffers.byte_len();
        if let Some(idx) = buffers.buffers.iter().position(|b| b.byte_len() != size) {
            error!("{} bad buffer size in buffer {}", self.label, idx);
            return Err(BridgeError::BufferLayoutMismatch(format!(
                "buffer {} holds {} bytes, expected {}",
                idx,
                buffers.buffers[idx].byte_len(),
                size
            )));
        }

        let frames = size / config.bytes_per_frame().max(1);
        if frames == 0 {
            return Ok(());
        }
        let channels: Vec<&[u8]> = buffers.buffers.iter().map(|b| b.data.as_slice()).collect();
        let written = write_with_recovery(self.label, stream, self.max_recoveries, || {
            stream.write_planar(&channels, frames)
        })?;
        if written < frames {
            error!(
                "{} playback short write: {} of {} frames",
                self.label, written, frames
            );
        }
        Ok(())
    }

    fn render_input(
        &mut self,
        flags: &RenderFlags,
        timestamp: &TimeStamp,
        frames: u32,
    ) -> Result<()> {
        if self.input_consumer.is_none() {
            // Input is pulled by the host, nothing is pushed.
            return Ok(());
        }
        trace!(
            "input render requested: {frames} frames at {}, silence={}",
            timestamp.sample_time,
            flags.output_is_silence
        );
        if self.input_planar {
            Err(BridgeError::NotImplemented("planar input render"))
        } else {
            Err(BridgeError::NotImplemented("interleaved input render"))
        }
    }
}
