use crate::engine::{EngineSettings, Tuning};
use anyhow::{Context, Result, anyhow};
use common::retry::retry_with_backoff;
use v4l::{
    Device, FourCC,
    control::{Control, Value},
    video::Capture,
};

const FOURCC_YUYV: FourCC = FourCC { repr: *b"YUYV" };
const FOURCC_MJPG: FourCC = FourCC { repr: *b"MJPG" };

// V4L2 control IDs (from videodev2.h)
const V4L2_CID_BRIGHTNESS: u32 = 0x0098_0900;
const V4L2_CID_CONTRAST: u32 = 0x0098_0901;
const V4L2_CID_SATURATION: u32 = 0x0098_0902;
const V4L2_CID_GAIN: u32 = 0x0098_0913;
const V4L2_CID_SHARPNESS: u32 = 0x0098_091b;
const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

const V4L2_EXPOSURE_MANUAL: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
}

fn find_usable_camera() -> Option<u32> {
    v4l::context::enum_devices()
        .into_iter()
        .find(|dev| {
            Device::with_path(dev.path())
                .and_then(|d| d.query_caps())
                .map(|caps| {
                    caps.capabilities
                        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                })
                .unwrap_or(false)
        })
        .map(|dev| dev.index() as u32)
}

fn open_device(index: u32) -> Result<(Device, u32)> {
    if let Ok(dev) = Device::new(index as usize)
        && dev.query_caps().is_ok()
    {
        return Ok((dev, index));
    }

    tracing::debug!(
        "Camera index {} busy or missing, scanning alternatives...",
        index
    );

    let best_idx = find_usable_camera().ok_or_else(|| anyhow!("No usable video devices found"))?;
    let dev = Device::new(best_idx as usize).context("Failed to open fallback camera device")?;
    Ok((dev, best_idx))
}

/// Select best pixel format: prefer MJPEG (stills and recordings need no
/// re-encode), fallback to YUYV
fn select_format(device: &Device) -> Result<PixelFormat> {
    let formats = device.enum_formats()?;

    tracing::debug!("Available formats:");
    for fmt in &formats {
        tracing::debug!("  {:?}: {}", fmt.fourcc, fmt.description);
    }

    if formats.iter().any(|f| f.fourcc == FOURCC_MJPG) {
        return Ok(PixelFormat::Mjpeg);
    }

    if formats.iter().any(|f| f.fourcc == FOURCC_YUYV) {
        return Ok(PixelFormat::Yuyv);
    }

    Err(anyhow!(
        "Camera supports neither MJPEG nor YUYV - available: {:?}",
        formats.iter().map(|f| f.fourcc).collect::<Vec<_>>()
    ))
}

fn control_id(tuning: Tuning) -> u32 {
    match tuning {
        Tuning::Brightness => V4L2_CID_BRIGHTNESS,
        Tuning::Contrast => V4L2_CID_CONTRAST,
        Tuning::Saturation => V4L2_CID_SATURATION,
        Tuning::Sharpness => V4L2_CID_SHARPNESS,
        Tuning::Exposure => V4L2_CID_EXPOSURE_ABSOLUTE,
        Tuning::Gain => V4L2_CID_GAIN,
    }
}

/// The device opened for format negotiation and control changes.
///
/// Streaming happens on a second handle owned by the capture thread.
pub struct CameraDevice {
    pub device: Device,
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub max_fps: f64,
}

impl CameraDevice {
    pub fn open(settings: &EngineSettings) -> Result<Self> {
        let (device, index) =
            retry_with_backoff(|| open_device(settings.device_index), 10, 200, "Camera init")?;

        let caps = device.query_caps()?;
        tracing::info!("Camera opened: {} ({}) at index {}", caps.card, caps.driver, index);

        let pixel_format = select_format(&device)?;
        let fourcc = match pixel_format {
            PixelFormat::Yuyv => FOURCC_YUYV,
            PixelFormat::Mjpeg => FOURCC_MJPG,
        };

        let mut format = device.format()?;
        format.fourcc = fourcc;
        format.width = settings.width;
        format.height = settings.height;
        let format = device.set_format(&format)?;

        tracing::info!(
            "Capture format: {}x{} {:?} ({:?})",
            format.width,
            format.height,
            format.fourcc,
            pixel_format
        );

        let params = device.params()?;
        let fps = params.interval.denominator as f64 / params.interval.numerator.max(1) as f64;
        tracing::info!("Frame rate: {:.1} fps", fps);

        Ok(Self {
            device,
            index,
            width: format.width,
            height: format.height,
            pixel_format,
            max_fps: fps,
        })
    }

    /// Apply a tuning value, clamped to the range the driver advertises.
    pub fn apply_tuning(&self, tuning: Tuning, value: i64) -> Result<()> {
        let id = control_id(tuning);
        let controls = self
            .device
            .query_controls()
            .context("Failed to query camera controls")?;

        let desc = controls
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow!("Camera does not expose {} control", tuning))?;
        let clamped = value.clamp(desc.minimum, desc.maximum);

        // Absolute exposure only takes effect in manual exposure mode
        if tuning == Tuning::Exposure && controls.iter().any(|c| c.id == V4L2_CID_EXPOSURE_AUTO) {
            self.device
                .set_control(Control {
                    id: V4L2_CID_EXPOSURE_AUTO,
                    value: Value::Integer(V4L2_EXPOSURE_MANUAL),
                })
                .context("Failed to switch to manual exposure")?;
        }

        self.device
            .set_control(Control {
                id,
                value: Value::Integer(clamped),
            })
            .with_context(|| format!("Failed to set {}", tuning))?;

        if clamped != value {
            tracing::info!("{} clamped from {} to {}", tuning, value, clamped);
        } else {
            tracing::info!("{} set to {}", tuning, clamped);
        }
        Ok(())
    }
}
