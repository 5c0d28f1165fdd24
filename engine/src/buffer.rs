use crate::format::SampleFormatDescriptor;

pub const OUTPUT_BUS: u32 = 0;
pub const INPUT_BUS: u32 = 1;

/// One raw buffer. Interleaved groups hold a single buffer carrying every
/// channel; planar groups hold one single-channel buffer per channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioBuffer {
    pub channels: u32,
    pub data: Vec<u8>,
}

impl AudioBuffer {
    pub fn zeroed(channels: u32, bytes: usize) -> Self {
        Self {
            channels,
            data: vec![0; bytes],
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioBufferGroup {
    pub buffers: Vec<AudioBuffer>,
}

impl AudioBufferGroup {
    /// Destination sized for `frames` frames of `desc`, ready for the renderer to fill.
    pub fn allocate(desc: &SampleFormatDescriptor, frames: usize) -> Self {
        let bytes = desc.bytes_per_frame as usize * frames;
        let buffers = if desc.is_planar() {
            (0..desc.channels_per_frame)
                .map(|_| AudioBuffer::zeroed(1, bytes))
                .collect()
        } else {
            vec![AudioBuffer::zeroed(desc.channels_per_frame, bytes)]
        };
        Self { buffers }
    }

    /// Empty slots the renderer is expected to supply memory for.
    pub fn placeholder(desc: &SampleFormatDescriptor) -> Self {
        let slots = if desc.is_planar() {
            desc.channels_per_frame as usize
        } else {
            1
        };
        Self {
            buffers: vec![AudioBuffer::default(); slots],
        }
    }

    pub fn silence(desc: &SampleFormatDescriptor, frames: usize) -> Self {
        Self::allocate(desc, frames)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Byte size of the first buffer; zero for a group without data.
    pub fn byte_len(&self) -> usize {
        self.buffers.first().map(AudioBuffer::byte_len).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderFlags {
    pub output_is_silence: bool,
    pub pre_render: bool,
    pub post_render: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeStamp {
    pub sample_time: f64,
    pub host_time: u64,
}

/// One pull: bus, frame count, destination buffers and flags the renderer may set.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub bus: u32,
    pub frames: u32,
    pub timestamp: TimeStamp,
    pub flags: RenderFlags,
    pub buffers: AudioBufferGroup,
}

impl RenderRequest {
    pub fn output(frames: u32, buffers: AudioBufferGroup) -> Self {
        Self {
            bus: OUTPUT_BUS,
            frames,
            timestamp: TimeStamp::default(),
            flags: RenderFlags::default(),
            buffers,
        }
    }
}

/// Host side that produces audio on demand.
pub trait PullRenderer: Send {
    /// Fills `request.buffers` with `request.frames` frames. An `Err` carries the
    /// host's status code.
    fn render(&mut self, request: &mut RenderRequest) -> Result<(), i32>;
}

impl<F> PullRenderer for F
where
    F: FnMut(&mut RenderRequest) -> Result<(), i32> + Send,
{
    fn render(&mut self, request: &mut RenderRequest) -> Result<(), i32> {
        self(request)
    }
}

/// Host side that wants captured audio pushed to it.
pub trait InputConsumer: Send {
    fn input_available(
        &mut self,
        flags: &RenderFlags,
        timestamp: &TimeStamp,
        frames: u32,
    ) -> Result<(), i32>;
}
