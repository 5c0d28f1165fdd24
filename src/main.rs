mod settings;
mod tone;

use settings::{LOG_ENV, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, error, info};

fn init_logging() {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}

#[cfg(target_os = "linux")]
async fn run(settings: Settings) -> Result<(), String> {
    use pcmbridge_engine::{AlsaBackend, PcmBridge, StreamDirection};

    let mut bridge =
        PcmBridge::new(AlsaBackend, settings.bridge.clone()).map_err(|e| e.to_string())?;
    bridge
        .set_stream_format(StreamDirection::Output, settings.tone.descriptor())
        .map_err(|e| e.to_string())?;
    let rate = settings.tone.sample_rate;
    bridge.init().map_err(|e| e.to_string())?;
    let actual = bridge
        .negotiated_rate(StreamDirection::Output)
        .map_or(rate, f64::from);
    bridge.set_render_source(tone::Tone::new(
        settings.tone.frequency,
        actual,
        settings.tone.amplitude,
        settings.tone.channels,
    ));
    bridge.start().map_err(|e| e.to_string())?;
    info!(
        "playing {} Hz on '{}' at {} Hz, ctrl-c to stop",
        settings.tone.frequency, settings.bridge.device, actual
    );

    let mut watch = tokio::time::interval(std::time::Duration::from_millis(250));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| e.to_string())?;
                break;
            }
            _ = watch.tick() => {
                if let Some(status) = bridge.last_error() {
                    error!("device connection lost ({:?}, code {})", status, status.code());
                    break;
                }
            }
        }
    }
    info!("stopping");
    if let Err(e) = bridge.drain() {
        error!("drain failed: {}", e);
    }
    bridge.stop().map_err(|e| e.to_string())?;
    bridge.deinit().map_err(|e| e.to_string())
}

#[cfg(not(target_os = "linux"))]
async fn run(_settings: Settings) -> Result<(), String> {
    Err("no PCM backend for this platform".to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = match Settings::load(path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
