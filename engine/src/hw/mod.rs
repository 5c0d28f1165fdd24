pub mod config;
pub mod traits;

#[cfg(target_os = "linux")]
pub mod alsa;
#[cfg(test)]
pub mod mock;
