use crate::decoder::{FrameDecoder, MjpegDecoder, YuyvDecoder};
use crate::device::{CameraDevice, PixelFormat};
use crate::encode::{self, STILL_QUALITY};
use crate::engine::{CaptureEngine, CaptureError, EngineSettings, Tuning};
use crate::luma::LumaFrame;
use anyhow::{Context, Result, anyhow, bail};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use v4l::{
    Device,
    buffer::Type,
    io::{mmap::Stream, traits::CaptureStream},
    video::Capture,
};

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_ERRORS: u32 = 50;
const STREAM_BUFFERS: u32 = 4;
/// Frames discarded right after streaming starts while auto-exposure settles
const WARMUP_FRAMES: usize = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Latest raw frame published by the capture thread.
#[derive(Default)]
struct FrameSlot {
    seq: u64,
    frame: Option<Vec<u8>>,
}

/// Raw MJPEG recording: every captured frame appended as a JPEG.
struct Recorder {
    writer: BufWriter<File>,
    path: PathBuf,
    frames: u64,
}

impl Recorder {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create recording {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            frames: 0,
        })
    }

    fn write_jpeg(&mut self, jpeg: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(jpeg)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer
            .get_ref()
            .sync_all()
            .context("Failed to finalise recording")?;
        tracing::info!(
            "Recording {} closed after {} frames",
            self.path.display(),
            self.frames
        );
        Ok(())
    }
}

struct Shared {
    slot: Mutex<FrameSlot>,
    fresh: Condvar,
    recorder: Mutex<Option<Recorder>>,
    running: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            slot: Mutex::new(FrameSlot::default()),
            fresh: Condvar::new(),
            recorder: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn publish(&self, frame: &[u8]) {
        {
            let mut slot = lock(&self.slot);
            slot.seq += 1;
            slot.frame = Some(frame.to_vec());
        }
        self.fresh.notify_all();
    }

    /// Called once the capture thread is gone, for whatever reason.
    /// Wakes any waiter so it sees the stream has ended.
    fn pump_exited(&self) {
        // Flip under the slot lock so a waiter cannot miss the wakeup
        let _slot = lock(&self.slot);
        self.running.store(false, Ordering::SeqCst);
        self.fresh.notify_all();
    }

    /// Wait for a frame newer than `after` and return a copy of it.
    fn frame_after(&self, after: u64, timeout: Duration) -> Result<(u64, Vec<u8>)> {
        let slot = lock(&self.slot);
        let (slot, wait) = self
            .fresh
            .wait_timeout_while(slot, timeout, |s| {
                self.is_running() && (s.seq <= after || s.frame.is_none())
            })
            .unwrap_or_else(PoisonError::into_inner);

        if !self.is_running() {
            return Err(CaptureError::NotStarted.into());
        }
        if wait.timed_out() {
            return Err(CaptureError::FrameTimeout(timeout).into());
        }
        let frame = slot.frame.clone().ok_or_else(|| anyhow!("Frame slot empty"))?;
        Ok((slot.seq, frame))
    }
}

struct PumpConfig {
    index: u32,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// Capture engine backed by a V4L2 device.
///
/// A capture thread streams frames from its own device handle into a
/// single-frame slot and feeds the active recording; engine calls read
/// the most recent frame out of that slot.
pub struct V4lEngine {
    camera: CameraDevice,
    settings: EngineSettings,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
    decoder: Box<dyn FrameDecoder>,
    last_luma_seq: u64,
}

impl V4lEngine {
    pub fn open(settings: EngineSettings) -> Result<Self> {
        let camera = CameraDevice::open(&settings)?;
        let decoder: Box<dyn FrameDecoder> = match camera.pixel_format {
            PixelFormat::Yuyv => Box::new(YuyvDecoder::new()),
            PixelFormat::Mjpeg => Box::new(MjpegDecoder::new()?),
        };

        Ok(Self {
            camera,
            settings,
            shared: Arc::new(Shared::new()),
            pump: None,
            decoder,
            last_luma_seq: 0,
        })
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.is_started() {
            return Err(CaptureError::NotStarted.into());
        }
        Ok(())
    }

    fn frame_after(&self, after: u64) -> Result<(u64, Vec<u8>)> {
        self.shared.frame_after(after, FRAME_TIMEOUT)
    }

    fn latest_frame(&self) -> Result<Vec<u8>> {
        self.frame_after(0).map(|(_, frame)| frame)
    }

    /// Collect a capture thread that gave up on its own.
    fn reap_dead_pump(&mut self) {
        if self.shared.is_running() {
            return;
        }
        if let Some(handle) = self.pump.take() {
            if handle.join().is_err() {
                tracing::error!("Capture thread panicked");
            }
            if let Err(e) = self.stop_encoder() {
                tracing::warn!("Failed to close recording of dead stream: {:#}", e);
            }
            *lock(&self.shared.slot) = FrameSlot::default();
            self.last_luma_seq = 0;
        }
    }
}

impl CaptureEngine for V4lEngine {
    fn start(&mut self) -> Result<()> {
        self.reap_dead_pump();
        if self.pump.is_some() {
            return Ok(());
        }

        let config = PumpConfig {
            index: self.camera.index,
            width: self.camera.width,
            height: self.camera.height,
            pixel_format: self.camera.pixel_format,
        };
        let shared = Arc::clone(&self.shared);
        shared.running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("capture-pump".into())
            .spawn(move || {
                run_pump(config, &shared, ready_tx);
                shared.pump_exited();
            })
            .context("Failed to spawn capture thread")?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => {
                self.pump = Some(handle);
                tracing::info!(
                    "Capture started at {}x{} ({:.1} fps max)",
                    self.camera.width,
                    self.camera.height,
                    self.camera.max_fps
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.shared.running.store(false, Ordering::SeqCst);
                bail!("Capture thread did not come up within {:?}", STARTUP_TIMEOUT)
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.stop_encoder()?;
        let Some(handle) = self.pump.take() else {
            return Ok(());
        };

        self.shared.running.store(false, Ordering::SeqCst);
        if handle.join().is_err() {
            tracing::error!("Capture thread panicked");
        }

        *lock(&self.shared.slot) = FrameSlot::default();
        self.last_luma_seq = 0;
        tracing::info!("Capture stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.pump.is_some() && self.shared.is_running()
    }

    fn close(&mut self) -> Result<()> {
        self.stop()
    }

    fn luma_frame(&mut self) -> Result<LumaFrame> {
        self.ensure_started()?;
        let (seq, raw) = self.frame_after(self.last_luma_seq)?;
        self.last_luma_seq = seq;

        let luma = self
            .decoder
            .luma(&raw, self.camera.width, self.camera.height)?;
        Ok(luma.downsample(self.settings.motion_width))
    }

    fn still_jpeg(&mut self) -> Result<Vec<u8>> {
        self.ensure_started()?;
        let raw = self.latest_frame()?;
        match self.camera.pixel_format {
            PixelFormat::Mjpeg => Ok(raw),
            PixelFormat::Yuyv => {
                let frame = self
                    .decoder
                    .decode(&raw, self.camera.width, self.camera.height)?;
                encode::jpeg_from_rgb(frame.rgb, frame.width, frame.height, STILL_QUALITY)
            }
        }
    }

    fn preview_jpeg(&mut self, width: u32, height: u32) -> Result<Vec<u8>> {
        self.ensure_started()?;
        let raw = self.latest_frame()?;
        let frame = self
            .decoder
            .decode(&raw, self.camera.width, self.camera.height)?;
        encode::preview_from_rgb(frame.rgb.to_vec(), frame.width, frame.height, width, height)
    }

    fn start_encoder(&mut self, output: &Path, bitrate: u32) -> Result<()> {
        self.ensure_started()?;
        let mut recorder = lock(&self.shared.recorder);
        if recorder.is_some() {
            bail!("Encoder already running");
        }
        *recorder = Some(Recorder::create(output)?);
        tracing::debug!(
            "Recording {} as MJPEG (requested bitrate {} ignored)",
            output.display(),
            bitrate
        );
        Ok(())
    }

    fn stop_encoder(&mut self) -> Result<()> {
        let recorder = lock(&self.shared.recorder).take();
        match recorder {
            Some(recorder) => recorder.finish(),
            None => Ok(()),
        }
    }

    fn encoder_running(&self) -> bool {
        lock(&self.shared.recorder).is_some()
    }

    fn set_control(&mut self, control: Tuning, value: i64) -> Result<()> {
        self.camera.apply_tuning(control, value)
    }
}

impl Drop for V4lEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Failed to stop capture on drop: {:#}", e);
        }
    }
}

fn open_stream_device(config: &PumpConfig) -> Result<Device> {
    let device = Device::new(config.index as usize).context("Failed to open capture handle")?;
    let mut format = device.format()?;
    format.width = config.width;
    format.height = config.height;
    device.set_format(&format)?;
    Ok(device)
}

fn run_pump(config: PumpConfig, shared: &Shared, ready: mpsc::Sender<Result<()>>) {
    let device = match open_stream_device(&config) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(anyhow!(e).context("Failed to create capture stream")));
            return;
        }
    };

    let flushed = (0..WARMUP_FRAMES)
        .take_while(|_| stream.next().is_ok())
        .count();
    if flushed > 0 {
        tracing::debug!("Flushed {} stale frames on stream start", flushed);
    }
    let _ = ready.send(Ok(()));

    // YUYV recordings need a JPEG per frame
    let mut yuyv = (config.pixel_format == PixelFormat::Yuyv).then(YuyvDecoder::new);
    let mut frame_count = 0u64;
    let mut dropped_frames = 0u64;
    let mut consecutive_errors = 0u32;

    while shared.running.load(Ordering::Relaxed) {
        let (buf, meta) = match stream.next() {
            Ok(frame) => {
                consecutive_errors = 0;
                frame
            }
            Err(e) => {
                dropped_frames += 1;
                consecutive_errors += 1;
                tracing::warn!("Frame #{} capture error: {}", frame_count, e);
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!("Capture stream failing repeatedly, giving up");
                    break;
                }
                continue;
            }
        };

        if let Some(recorder) = lock(&shared.recorder).as_mut() {
            let written = match yuyv.as_mut() {
                None => recorder.write_jpeg(buf).map_err(anyhow::Error::from),
                Some(decoder) => decoder
                    .decode(buf, config.width, config.height)
                    .and_then(|f| encode::jpeg_from_rgb(f.rgb, f.width, f.height, STILL_QUALITY))
                    .and_then(|jpeg| recorder.write_jpeg(&jpeg).map_err(Into::into)),
            };
            if let Err(e) = written {
                tracing::warn!("Recording write error: {}", e);
            }
        }

        shared.publish(buf);
        frame_count += 1;

        if frame_count.is_multiple_of(300) {
            tracing::debug!(
                "Status: [Frames: {}] [Dropped: {}] [V4L seq: {}]",
                frame_count,
                dropped_frames,
                meta.sequence
            );
        }
    }

    tracing::info!(
        "Capture thread exiting: {} frames captured, {} dropped.",
        frame_count,
        dropped_frames
    );
}
