#[cfg(not(unix))]
compile_error!("pcmbridge-engine needs a unix poll(2)");

pub mod bridge;
pub mod buffer;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod hw;
pub mod pump;
pub mod render;
pub mod session;

pub use bridge::{PcmBridge, Scope};
pub use buffer::{
    AudioBuffer, AudioBufferGroup, INPUT_BUS, InputConsumer, OUTPUT_BUS, PullRenderer,
    RenderFlags, RenderRequest, TimeStamp,
};
pub use error::{BackendError, BridgeError, NegotiationStep, Result, Status};
pub use format::{AccessLayout, DeviceFormat, FormatFlags, FormatId, SampleFormatDescriptor};
pub use hw::config::BridgeOptions;
pub use hw::traits::{PcmBackend, PcmStream, StreamDirection};

#[cfg(target_os = "linux")]
pub use hw::alsa::AlsaBackend;
