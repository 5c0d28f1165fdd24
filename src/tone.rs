use pcmbridge_engine::{PullRenderer, RenderRequest};

/// Sine generator feeding interleaved signed 16-bit frames.
#[derive(Debug, Clone)]
pub struct Tone {
    phase: f64,
    step: f64,
    amplitude: f64,
    channels: usize,
}

impl Tone {
    pub fn new(frequency: f64, sample_rate: f64, amplitude: f64, channels: u32) -> Self {
        Self {
            phase: 0.0,
            step: std::f64::consts::TAU * frequency / sample_rate.max(1.0),
            amplitude: amplitude.clamp(0.0, 1.0),
            channels: channels.max(1) as usize,
        }
    }

    fn next_sample(&mut self) -> i16 {
        let v = (self.phase.sin() * self.amplitude * f64::from(i16::MAX)) as i16;
        self.phase = (self.phase + self.step) % std::f64::consts::TAU;
        v
    }
}

impl PullRenderer for Tone {
    fn render(&mut self, request: &mut RenderRequest) -> Result<(), i32> {
        let Some(buffer) = request.buffers.buffers.first_mut() else {
            return Ok(());
        };
        let frames = request.frames as usize;
        let frame_bytes = self.channels * 2;
        if buffer.data.len() < frames * frame_bytes {
            buffer.data.resize(frames * frame_bytes, 0);
        }
        for frame in buffer.data.chunks_exact_mut(frame_bytes).take(frames) {
            let sample = self.next_sample().to_le_bytes();
            for ch in frame.chunks_exact_mut(2) {
                ch.copy_from_slice(&sample);
            }
        }
        Ok(())
    }
}
