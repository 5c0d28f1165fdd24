use serde::Deserialize;

pub const DEVICE_ENV: &str = "PCMBRIDGE_DEVICE";
pub const QUANTUM_ENV: &str = "PCMBRIDGE_QUANTUM";
pub const ALLOCATE_ENV: &str = "PCMBRIDGE_ALLOCATE";

pub const DEFAULT_FRAME_QUANTUM: usize = 4096;
pub const DEFAULT_AVAIL_MIN: i64 = 4096;
pub const DEFAULT_START_THRESHOLD: i64 = 0;
pub const DEFAULT_MAX_RECOVERIES: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    pub device: String,
    /// Frames pulled from the renderer and written per write-ready event.
    pub frame_quantum: usize,
    pub avail_min: i64,
    pub start_threshold: i64,
    /// Recover-and-retry attempts for one write hitting an interrupt or underrun.
    pub max_recoveries: usize,
    /// The pump hands the renderer preallocated buffers instead of empty slots.
    pub should_allocate_buffer: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            frame_quantum: DEFAULT_FRAME_QUANTUM,
            avail_min: DEFAULT_AVAIL_MIN,
            start_threshold: DEFAULT_START_THRESHOLD,
            max_recoveries: DEFAULT_MAX_RECOVERIES,
            should_allocate_buffer: true,
        }
    }
}

impl BridgeOptions {
    /// Defaults with `PCMBRIDGE_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var(DEVICE_ENV) {
            let device = device.trim();
            if !device.is_empty() {
                self.device = device.to_string();
            }
        }
        if let Some(quantum) = env_usize(QUANTUM_ENV).filter(|q| *q > 0) {
            self.frame_quantum = quantum;
        }
        if std::env::var_os(ALLOCATE_ENV).is_some() {
            self.should_allocate_buffer = env_flag(ALLOCATE_ENV);
        }
        self
    }
}

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

pub fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
