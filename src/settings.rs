use pcmbridge_engine::{BridgeOptions, FormatFlags, SampleFormatDescriptor};
use serde::Deserialize;
use std::path::Path;

pub const LOG_ENV: &str = "PCMBRIDGE_LOG";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bridge: BridgeOptions,
    pub tone: ToneSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToneSettings {
    pub frequency: f64,
    pub amplitude: f64,
    pub sample_rate: f64,
    pub channels: u32,
}

impl Default for ToneSettings {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            amplitude: 0.25,
            sample_rate: 48_000.0,
            channels: 2,
        }
    }
}

impl ToneSettings {
    pub fn descriptor(&self) -> SampleFormatDescriptor {
        SampleFormatDescriptor::linear_pcm(
            self.sample_rate,
            16,
            self.channels,
            FormatFlags {
                signed: true,
                ..FormatFlags::default()
            },
        )
    }
}

impl Settings {
    /// Reads `path` when given; environment overrides apply either way.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let mut settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
                Self::parse(&text)?
            }
            None => Self::default(),
        };
        settings.bridge = settings.bridge.with_env_overrides();
        Ok(settings)
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("invalid settings: {e}"))
    }
}
