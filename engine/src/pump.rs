use crate::buffer::{AudioBufferGroup, OUTPUT_BUS, PullRenderer, RenderRequest, TimeStamp};
use crate::error::{BridgeError, Result};
use crate::hw::traits::{PcmStream, StreamDirection};
use crate::render::RenderAdapter;
use crate::session::DeviceSession;
use tracing::{error, trace};

/// Moves one quantum per readiness event between the host renderer and the device.
#[derive(Debug)]
pub struct IoPump {
    label: &'static str,
    quantum: usize,
    should_allocate_buffer: bool,
    sample_time: f64,
    capture_reported: bool,
}

impl IoPump {
    pub fn new(label: &'static str, quantum: usize, should_allocate_buffer: bool) -> Self {
        Self {
            label,
            quantum: quantum.max(1),
            should_allocate_buffer,
            sample_time: 0.0,
            capture_reported: false,
        }
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    pub fn reset_clock(&mut self) {
        self.sample_time = 0.0;
        self.capture_reported = false;
    }

    /// Pulls one quantum from `renderer` and hands it to the adapter's output bus.
    pub fn on_write_ready<S: PcmStream>(
        &mut self,
        renderer: &mut dyn PullRenderer,
        adapter: &mut RenderAdapter,
        output: &DeviceSession<S>,
    ) -> Result<()> {
        let desc = output
            .config()
            .map(|c| c.descriptor)
            .ok_or(BridgeError::NotInitialized)?;
        let buffers = if self.should_allocate_buffer {
            AudioBufferGroup::allocate(&desc, self.quantum)
        } else {
            AudioBufferGroup::placeholder(&desc)
        };
        let mut request = RenderRequest::output(self.quantum as u32, buffers);
        request.timestamp = TimeStamp {
            sample_time: self.sample_time,
            host_time: 0,
        };
        trace!("{} pulling {} frames", self.label, self.quantum);

        if let Err(status) = renderer.render(&mut request) {
            error!("{} render callback failed with error {}", self.label, status);
            // Keep the device fed; the failure may be temporary.
            request.buffers = AudioBufferGroup::silence(&desc, self.quantum);
            request.flags.output_is_silence = true;
        }
        self.sample_time += self.quantum as f64;

        if request.buffers.buffers.iter().all(|b| b.data.is_empty()) {
            trace!("{} renderer produced no data", self.label);
            return Ok(());
        }

        adapter.render(
            output,
            &mut request.flags,
            &request.timestamp,
            OUTPUT_BUS,
            request.frames,
            &request.buffers,
        )
    }

    /// Capture is not transferred; the event is only reported.
    pub fn on_read_ready(&mut self, direction: StreamDirection) {
        if !self.capture_reported {
            error!("{} audio capture unsupported ({})", self.label, direction.label());
            self.capture_reported = true;
        } else {
            trace!("{} capture event ignored", self.label);
        }
    }
}
