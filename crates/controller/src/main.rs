use anyhow::Context;
use capture::{EngineSettings, SharedEngine, SyntheticEngine, share};
use clap::Parser;
use common::{Environment, setup_logging};
use controller::{CameraConfig, CameraService};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[derive(Parser, Debug)]
#[command(name = "camctl")]
#[command(about = "Single-camera control daemon driven through named pipes")]
#[command(version)]
struct Args {
    /// JSON configuration file. Built-in defaults apply when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Index of the V4L2 capture device
    #[arg(short = 'i', long, default_value_t = 0)]
    device: u32,

    /// Serve generated frames instead of opening a camera
    #[arg(long)]
    synthetic: bool,
}

#[cfg(feature = "v4l")]
fn open_device(settings: EngineSettings) -> anyhow::Result<SharedEngine> {
    let engine = capture::V4lEngine::open(settings)
        .context("Failed to initialize camera - check V4L2 device availability")?;
    Ok(share(engine))
}

#[cfg(not(feature = "v4l"))]
fn open_device(_settings: EngineSettings) -> anyhow::Result<SharedEngine> {
    anyhow::bail!("Built without V4L2 support, run with --synthetic")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = CameraConfig::load(args.config.as_deref())?;

    let _log_guard = setup_logging(Environment::from_env(), config.log_target().as_ref())
        .with_context(|| format!("Failed to open log file {}", config.log_file.display()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");
    tracing::debug!("Config: {:?}", config);

    let engine = if args.synthetic {
        tracing::info!("Using synthetic capture engine");
        share(SyntheticEngine::new(config.video_width, config.video_height))
    } else {
        open_device(config.engine_settings(args.device))?
    };

    let service = CameraService::new(config, engine, shutdown)
        .context("Failed to initialize camera state")?;

    match service.run() {
        Ok(()) => {
            tracing::info!("camctl stopped gracefully");
            Ok(())
        }
        Err(e) => {
            tracing::error!("camctl failed: {:#}", e);
            Err(e)
        }
    }
}
