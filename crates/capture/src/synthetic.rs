//! Device-free engine: serves scripted (or flat) luma frames and encodes
//! them as grayscale JPEGs. Used for `--synthetic` runs and in tests, where
//! a [`SyntheticProbe`] lets the caller feed frames and observe engine calls.

use crate::encode::{self, STILL_QUALITY};
use crate::engine::{CaptureEngine, CaptureError, Tuning};
use crate::luma::LumaFrame;
use anyhow::{Context, Result, bail};
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const BACKGROUND_LEVEL: u8 = 16;

#[derive(Debug, Default)]
struct ProbeState {
    queued: VecDeque<LumaFrame>,
    starts: u32,
    stops: u32,
    closed: bool,
    stills: u32,
    recordings: Vec<PathBuf>,
    controls: Vec<(Tuning, i64)>,
    fail_start: bool,
}

/// Shared window into a [`SyntheticEngine`].
#[derive(Debug, Clone, Default)]
pub struct SyntheticProbe {
    inner: Arc<Mutex<ProbeState>>,
}

impl SyntheticProbe {
    fn state(&self) -> MutexGuard<'_, ProbeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_frame(&self, frame: LumaFrame) {
        self.state().queued.push_back(frame);
    }

    pub fn push_frames(&self, frames: impl IntoIterator<Item = LumaFrame>) {
        self.state().queued.extend(frames);
    }

    pub fn queued_frames(&self) -> usize {
        self.state().queued.len()
    }

    pub fn starts(&self) -> u32 {
        self.state().starts
    }

    pub fn stops(&self) -> u32 {
        self.state().stops
    }

    pub fn closed(&self) -> bool {
        self.state().closed
    }

    pub fn stills(&self) -> u32 {
        self.state().stills
    }

    /// Outputs of every recording started so far, in order.
    pub fn recordings(&self) -> Vec<PathBuf> {
        self.state().recordings.clone()
    }

    pub fn controls(&self) -> Vec<(Tuning, i64)> {
        self.state().controls.clone()
    }

    /// Make subsequent `start()` calls fail, simulating a missing sensor.
    pub fn set_fail_start(&self, fail: bool) {
        self.state().fail_start = fail;
    }
}

pub struct SyntheticEngine {
    started: bool,
    last: LumaFrame,
    encoder: Option<File>,
    probe: SyntheticProbe,
}

impl SyntheticEngine {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            started: false,
            last: LumaFrame::flat(width, height, BACKGROUND_LEVEL),
            encoder: None,
            probe: SyntheticProbe::default(),
        }
    }

    pub fn probe(&self) -> SyntheticProbe {
        self.probe.clone()
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.started {
            return Err(CaptureError::NotStarted.into());
        }
        Ok(())
    }
}

impl CaptureEngine for SyntheticEngine {
    fn start(&mut self) -> Result<()> {
        let mut state = self.probe.state();
        if state.fail_start {
            bail!("Synthetic sensor configured to fail");
        }
        state.starts += 1;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.started {
            self.probe.state().stops += 1;
        }
        self.started = false;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn close(&mut self) -> Result<()> {
        self.encoder = None;
        self.started = false;
        self.probe.state().closed = true;
        Ok(())
    }

    fn luma_frame(&mut self) -> Result<LumaFrame> {
        self.ensure_started()?;
        if let Some(frame) = self.probe.state().queued.pop_front() {
            self.last = frame;
        }
        Ok(self.last.clone())
    }

    fn still_jpeg(&mut self) -> Result<Vec<u8>> {
        self.ensure_started()?;
        let jpeg = encode::jpeg_from_gray(
            &self.last.data,
            self.last.width,
            self.last.height,
            STILL_QUALITY,
        )?;
        self.probe.state().stills += 1;
        Ok(jpeg)
    }

    fn preview_jpeg(&mut self, width: u32, height: u32) -> Result<Vec<u8>> {
        self.ensure_started()?;
        encode::preview_from_gray(
            self.last.data.clone(),
            self.last.width,
            self.last.height,
            width,
            height,
        )
    }

    fn start_encoder(&mut self, output: &Path, _bitrate: u32) -> Result<()> {
        self.ensure_started()?;
        if self.encoder.is_some() {
            bail!("Encoder already running");
        }
        let file = File::create(output)
            .with_context(|| format!("Failed to create recording {}", output.display()))?;
        self.encoder = Some(file);
        self.probe.state().recordings.push(output.to_path_buf());
        Ok(())
    }

    fn stop_encoder(&mut self) -> Result<()> {
        if let Some(file) = self.encoder.take() {
            file.sync_all().context("Failed to finalise recording")?;
        }
        Ok(())
    }

    fn encoder_running(&self) -> bool {
        self.encoder.is_some()
    }

    fn set_control(&mut self, control: Tuning, value: i64) -> Result<()> {
        self.probe.state().controls.push((control, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn frames_require_started_engine() {
        let mut engine = SyntheticEngine::new(8, 8);
        let err = engine.luma_frame().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::NotStarted)
        ));
    }

    #[test]
    fn serves_queued_frames_then_repeats_last() {
        let mut engine = SyntheticEngine::new(4, 4);
        let probe = engine.probe();
        engine.start().unwrap();

        probe.push_frames([LumaFrame::flat(4, 4, 1), LumaFrame::flat(4, 4, 2)]);

        assert_eq!(engine.luma_frame().unwrap().data[0], 1);
        assert_eq!(engine.luma_frame().unwrap().data[0], 2);
        assert_eq!(engine.luma_frame().unwrap().data[0], 2);
        assert_eq!(probe.queued_frames(), 0);
    }

    #[test]
    fn counts_start_and_stop() {
        let mut engine = SyntheticEngine::new(4, 4);
        let probe = engine.probe();

        engine.start().unwrap();
        engine.stop().unwrap();
        engine.stop().unwrap();
        engine.start().unwrap();

        assert_eq!(probe.starts(), 2);
        assert_eq!(probe.stops(), 1);
        assert!(engine.is_started());
    }

    #[test]
    fn failing_start_leaves_engine_halted() {
        let mut engine = SyntheticEngine::new(4, 4);
        engine.probe().set_fail_start(true);

        assert!(engine.start().is_err());
        assert!(!engine.is_started());
    }

    #[test]
    fn encoder_creates_output_file() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("vi_0001.mjpeg");
        let mut engine = SyntheticEngine::new(4, 4);
        let probe = engine.probe();
        engine.start().unwrap();

        engine.start_encoder(&output, 17_000_000).unwrap();
        assert!(engine.encoder_running());
        assert!(engine.start_encoder(&output, 17_000_000).is_err());
        engine.stop_encoder().unwrap();

        assert!(!engine.encoder_running());
        assert!(output.exists());
        assert_eq!(probe.recordings(), vec![output]);
    }

    #[test]
    fn still_is_jpeg() {
        let mut engine = SyntheticEngine::new(16, 16);
        engine.start().unwrap();

        let jpeg = engine.still_jpeg().unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(engine.probe().stills(), 1);
    }

    #[test]
    fn records_controls() {
        let mut engine = SyntheticEngine::new(4, 4);
        engine.set_control(Tuning::Brightness, 60).unwrap();
        assert_eq!(engine.probe().controls(), vec![(Tuning::Brightness, 60)]);
    }
}
