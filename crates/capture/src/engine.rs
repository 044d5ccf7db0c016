use anyhow::Result;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture engine is not started")]
    NotStarted,

    #[error("No frame received within {0:?}")]
    FrameTimeout(Duration),
}

/// Device tuning knobs exposed over the control pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tuning {
    Brightness,
    Contrast,
    Saturation,
    Sharpness,
    Exposure,
    Gain,
}

impl Tuning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tuning::Brightness => "brightness",
            Tuning::Contrast => "contrast",
            Tuning::Saturation => "saturation",
            Tuning::Sharpness => "sharpness",
            Tuning::Exposure => "exposure",
            Tuning::Gain => "gain",
        }
    }
}

impl fmt::Display for Tuning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tuning {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brightness" => Ok(Tuning::Brightness),
            "contrast" => Ok(Tuning::Contrast),
            "saturation" => Ok(Tuning::Saturation),
            "sharpness" => Ok(Tuning::Sharpness),
            "exposure" => Ok(Tuning::Exposure),
            "gain" => Ok(Tuning::Gain),
            other => Err(format!("unknown tuning control: {}", other)),
        }
    }
}

/// What an engine needs to know to open the device.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    /// Frames handed to the motion detector are downsampled to at most this width.
    pub motion_width: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1920,
            height: 1080,
            motion_width: 320,
        }
    }
}

/// The capture collaborator: sensor streaming, frame grabs and encoding.
///
/// Calls are expected to return promptly; the daemon serialises access
/// through [`SharedEngine`] and holds the lock only for the duration of a
/// single call.
pub trait CaptureEngine: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn is_started(&self) -> bool;

    /// Release the device. The engine is not used afterwards.
    fn close(&mut self) -> Result<()>;

    /// Next low-resolution luma buffer for motion analysis.
    fn luma_frame(&mut self) -> Result<crate::LumaFrame>;

    /// Full-resolution still, JPEG encoded.
    fn still_jpeg(&mut self) -> Result<Vec<u8>>;

    /// Downscaled preview, JPEG encoded.
    fn preview_jpeg(&mut self, width: u32, height: u32) -> Result<Vec<u8>>;

    fn start_encoder(&mut self, output: &Path, bitrate: u32) -> Result<()>;

    fn stop_encoder(&mut self) -> Result<()>;

    fn encoder_running(&self) -> bool;

    fn set_control(&mut self, control: Tuning, value: i64) -> Result<()>;
}

pub type SharedEngine = Arc<Mutex<Box<dyn CaptureEngine>>>;

pub fn share(engine: impl CaptureEngine + 'static) -> SharedEngine {
    Arc::new(Mutex::new(Box::new(engine)))
}

/// Lock the engine, recovering it if a previous holder panicked.
pub fn lock_engine(engine: &SharedEngine) -> MutexGuard<'_, Box<dyn CaptureEngine>> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}
