use crate::command::{CommandCode, CommandRecord, Origin};
use crate::config::MotionMode;
use crate::motion::MotionTuning;
use crate::state::CameraState;
use anyhow::{Context, Result, bail};
use capture::{SharedEngine, lock_engine};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StillKind {
    Image,
    Lapse,
}

struct StillWorker {
    kind: StillKind,
    path: PathBuf,
    handle: JoinHandle<Result<()>>,
}

fn capture_still(engine: &SharedEngine, path: &Path) -> Result<()> {
    // The engine lock is released before the file is written
    let jpeg = lock_engine(engine).still_jpeg()?;
    fs::write(path, &jpeg).with_context(|| format!("Failed to write {}", path.display()))
}

fn parse_arg<T: FromStr>(record: &CommandRecord) -> Result<T> {
    record
        .argument
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid argument {:?} for {}", record.argument, record.code))
}

/// Applies queued commands to the camera state.
///
/// Still captures run on worker threads; their handles are kept here and
/// collected by [`Executor::reap`] on the owning thread.
pub struct Executor {
    workers: Vec<StillWorker>,
    tuning: Arc<MotionTuning>,
    last_lapse: Option<Instant>,
}

impl Executor {
    pub fn new(tuning: Arc<MotionTuning>) -> Self {
        Self {
            workers: Vec::new(),
            tuning,
            last_lapse: None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.workers.len()
    }

    /// Dispatch one command, then republish the status.
    pub fn execute(&mut self, state: &mut CameraState, record: &CommandRecord) {
        tracing::info!(code = %record.code, argument = %record.argument, "Executing command");

        let recompute = match self.dispatch(state, record) {
            Ok(recompute) => recompute,
            Err(e) => {
                tracing::error!(code = %record.code, "{:#}", e);
                true
            }
        };

        if recompute {
            state.set_status(None);
        }
    }

    /// Returns false when the command already published its own status.
    fn dispatch(&mut self, state: &mut CameraState, record: &CommandRecord) -> Result<bool> {
        match record.code {
            CommandCode::Restart => {
                if record.argument.trim() == "0" {
                    state.stop_all();
                    self.last_lapse = None;
                    state.set_status(Some("halted"));
                } else {
                    state.restart()?;
                }
                return Ok(false);
            }
            CommandCode::Image => self.trigger_still(state, StillKind::Image)?,
            CommandCode::Record => {
                let result = if record.flag() {
                    state.start_recording()
                } else {
                    state.stop_recording()
                };
                // Motion-driven toggles must not wipe the detector that issued them
                if record.origin == Origin::ControlPipe {
                    state.reset_motion_state();
                }
                result?;
            }
            CommandCode::MotionDetect => {
                state.set_motion_detection(record.flag());
                tracing::info!("Motion detection {}", if record.flag() { "on" } else { "off" });
            }
            CommandCode::Timelapse => {
                state.timelapse_on = record.flag();
                self.last_lapse = None;
                tracing::info!("Timelapse {}", if state.timelapse_on { "on" } else { "off" });
            }
            CommandCode::TimelapseInterval => {
                state.config.timelapse_interval = parse_arg(record)?;
            }
            CommandCode::Rescan => state.make_filecounts(),
            CommandCode::MotionThreshold => {
                let threshold: f64 = parse_arg(record)?;
                state.config.motion_threshold = threshold;
                self.tuning.update(|p| p.threshold = threshold);
            }
            CommandCode::MotionInitFrames => {
                let frames: u32 = parse_arg(record)?;
                state.config.motion_initframes = frames;
                self.tuning.update(|p| p.init_frames = frames);
            }
            CommandCode::MotionStartFrames => {
                let frames: u32 = parse_arg(record)?;
                state.config.motion_startframes = frames;
                self.tuning.update(|p| p.start_frames = frames);
            }
            CommandCode::MotionStopFrames => {
                let frames: u32 = parse_arg(record)?;
                state.config.motion_stopframes = frames;
                self.tuning.update(|p| p.stop_frames = frames);
            }
            CommandCode::MotionMode => {
                let mode = match record.argument.trim() {
                    "0" => MotionMode::Internal,
                    "1" => MotionMode::External,
                    other => bail!("Invalid motion mode {:?}", other),
                };
                state.config.motion_mode = mode;
                self.tuning.update(|p| p.mode = mode);
            }
            CommandCode::Bitrate => {
                state.config.video_bitrate = parse_arg(record)?;
            }
            CommandCode::Brightness
            | CommandCode::Contrast
            | CommandCode::Saturation
            | CommandCode::Sharpness
            | CommandCode::Shutter
            | CommandCode::Gain => {
                let Some(tuning) = record.code.tuning() else {
                    bail!("{} is not a device control", record.code);
                };
                let value: i64 = parse_arg(record)?;
                lock_engine(state.engine())
                    .set_control(tuning, value)
                    .with_context(|| format!("Failed to set {} to {}", tuning, value))?;
            }
        }
        Ok(true)
    }

    fn trigger_still(&mut self, state: &mut CameraState, kind: StillKind) -> Result<()> {
        if state.capturing_still {
            tracing::info!("Still capture already in progress. Ignore");
            return Ok(());
        }

        let template = match kind {
            StillKind::Image => &state.config.image_output_path,
            StillKind::Lapse => &state.config.lapse_output_path,
        };
        let path = state.make_filename(template);
        let engine = Arc::clone(state.engine());
        let target = path.clone();

        let handle = thread::Builder::new()
            .name("still-capture".into())
            .spawn(move || capture_still(&engine, &target))
            .context("Failed to spawn still capture")?;

        state.capturing_still = true;
        self.workers.push(StillWorker { kind, path, handle });
        Ok(())
    }

    fn finish(state: &mut CameraState, worker: StillWorker) {
        match worker.handle.join() {
            Ok(Ok(())) => {
                state.still_image_index += 1;
                tracing::info!(kind = ?worker.kind, "Captured {}", worker.path.display());
            }
            Ok(Err(e)) => {
                tracing::error!(kind = ?worker.kind, "Still capture failed: {:#}", e);
            }
            Err(_) => tracing::error!(kind = ?worker.kind, "Still capture thread panicked"),
        }
    }

    /// Collect finished still workers. Returns true if any completed.
    pub fn reap(&mut self, state: &mut CameraState) -> bool {
        let (finished, pending): (Vec<_>, Vec<_>) = self
            .workers
            .drain(..)
            .partition(|w| w.handle.is_finished());
        self.workers = pending;

        if finished.is_empty() {
            return false;
        }
        for worker in finished {
            Self::finish(state, worker);
        }
        if self.workers.is_empty() {
            state.capturing_still = false;
            state.set_status(None);
        }
        true
    }

    /// Fire a timelapse still when one is due.
    pub fn tick(&mut self, state: &mut CameraState, now: Instant) {
        if !state.timelapse_on || state.capturing_still {
            return;
        }

        let period = state.config.timelapse_period();
        if self
            .last_lapse
            .is_some_and(|last| now.saturating_duration_since(last) < period)
        {
            return;
        }

        self.last_lapse = Some(now);
        match self.trigger_still(state, StillKind::Lapse) {
            Ok(()) => state.set_status(None),
            Err(e) => tracing::warn!("Timelapse capture failed: {:#}", e),
        }
    }

    /// Wait for every outstanding still worker.
    pub fn join_all(&mut self, state: &mut CameraState) {
        let pending = self.workers.len();
        if pending > 0 {
            tracing::info!("Waiting for {} still capture(s)", pending);
        }
        for worker in self.workers.drain(..) {
            Self::finish(state, worker);
        }
        state.capturing_still = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::parse_batch;
    use crate::config::CameraConfig;
    use crate::motion::{MotionParams, MotionSwitch};
    use crate::state::Status;
    use capture::{SyntheticEngine, SyntheticProbe, Tuning, share};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        state: CameraState,
        executor: Executor,
        probe: SyntheticProbe,
        tuning: Arc<MotionTuning>,
        switch: Arc<MotionSwitch>,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let media = dir.path().join("media");
        let config = CameraConfig {
            preview_path: dir.path().join("preview.jpg"),
            image_output_path: format!("{}/im_%i.jpg", media.display()),
            lapse_output_path: format!("{}/tl_%i.jpg", media.display()),
            video_output_path: format!("{}/vi_%v.mjpeg", media.display()),
            media_path: media,
            status_file: dir.path().join("status.txt"),
            log_size: 0,
            ..CameraConfig::default()
        };

        let engine = SyntheticEngine::new(16, 16);
        let probe = engine.probe();
        let switch = Arc::new(MotionSwitch::new());
        let tuning = Arc::new(MotionTuning::new(MotionParams::from_config(&config)));
        let state = CameraState::initialize(config, share(engine), Arc::clone(&switch)).unwrap();

        Fixture {
            state,
            executor: Executor::new(Arc::clone(&tuning)),
            probe,
            tuning,
            switch,
            dir,
        }
    }

    impl Fixture {
        fn run(&mut self, code: CommandCode, argument: &str) {
            let record = CommandRecord::new(code, argument);
            self.executor.execute(&mut self.state, &record);
        }

        fn status_file(&self) -> String {
            fs::read_to_string(self.dir.path().join("status.txt")).unwrap()
        }
    }

    #[test]
    fn recording_toggle() {
        let mut f = fixture();

        f.run(CommandCode::Record, "1");
        assert!(f.state.capturing_video);
        assert_eq!(f.status_file(), "video");
        assert!(f.dir.path().join("media/vi_0001.mjpeg").exists());

        f.run(CommandCode::Record, "0");
        assert!(!f.state.capturing_video);
        assert_eq!(f.state.video_file_index, 2);
        assert_eq!(f.status_file(), "ready");
    }

    #[test]
    fn recording_with_motion_reports_video_motion() {
        let mut f = fixture();
        f.run(CommandCode::MotionDetect, "1");
        f.run(CommandCode::Record, "1");
        assert_eq!(f.state.current_status, Status::VideoMotion);
    }

    #[test]
    fn motion_toggle_touches_no_hardware() {
        let mut f = fixture();

        f.run(CommandCode::MotionDetect, "1");

        assert!(f.state.motion_detection);
        assert!(f.switch.is_enabled());
        assert_eq!(f.status_file(), "motion");
        assert_eq!(f.probe.starts(), 1);
        assert_eq!(f.probe.stops(), 0);
        assert!(f.probe.recordings().is_empty());

        f.run(CommandCode::MotionDetect, "0");
        assert!(!f.switch.is_enabled());
        assert_eq!(f.status_file(), "ready");
    }

    #[test]
    fn still_capture_runs_in_background() {
        let mut f = fixture();

        f.run(CommandCode::Image, "");
        assert!(f.state.capturing_still);
        assert_eq!(f.status_file(), "image");

        f.executor.join_all(&mut f.state);

        assert!(!f.state.capturing_still);
        assert_eq!(f.state.still_image_index, 2);
        assert!(f.dir.path().join("media/im_0001.jpg").exists());
    }

    #[test]
    fn second_still_while_busy_is_ignored() {
        let mut f = fixture();

        f.run(CommandCode::Image, "");
        f.run(CommandCode::Image, "");
        assert_eq!(f.executor.in_flight(), 1);

        f.executor.join_all(&mut f.state);
        assert_eq!(f.probe.stills(), 1);
    }

    #[test]
    fn reap_collects_finished_worker() {
        let mut f = fixture();
        f.run(CommandCode::Image, "");

        while !f.executor.reap(&mut f.state) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert!(!f.state.capturing_still);
        assert_eq!(f.executor.in_flight(), 0);
        assert_eq!(f.status_file(), "ready");
    }

    #[test]
    fn failed_still_keeps_index() {
        let mut f = fixture();
        f.run(CommandCode::Restart, "0");

        f.run(CommandCode::Image, "");
        f.executor.join_all(&mut f.state);

        assert_eq!(f.state.still_image_index, 1);
        assert_eq!(f.status_file(), "halted");
    }

    #[test]
    fn restart_zero_halts_everything() {
        let mut f = fixture();
        f.run(CommandCode::Record, "1");
        f.run(CommandCode::MotionDetect, "1");
        f.run(CommandCode::Timelapse, "1");

        f.run(CommandCode::Restart, "0");

        assert!(!f.state.capturing_video);
        assert!(!f.state.motion_detection);
        assert!(!f.state.timelapse_on);
        assert_eq!(f.state.current_status, Status::Halted);
        assert_eq!(f.status_file(), "halted");
    }

    #[test]
    fn restart_brings_engine_back() {
        let mut f = fixture();
        f.run(CommandCode::Restart, "0");

        f.run(CommandCode::Restart, "1");

        assert_eq!(f.probe.starts(), 2);
        assert_eq!(f.status_file(), "ready");
    }

    #[test]
    fn failed_restart_reports_halted() {
        let mut f = fixture();
        f.probe.set_fail_start(true);

        f.run(CommandCode::Restart, "1");

        assert_eq!(f.status_file(), "halted");
    }

    #[test]
    fn unknown_code_changes_nothing() {
        let mut f = fixture();
        let before = f.status_file();

        for record in parse_batch(b"zz 1\n") {
            f.executor.execute(&mut f.state, &record);
        }

        assert!(!f.state.capturing_video);
        assert!(!f.state.capturing_still);
        assert!(!f.state.motion_detection);
        assert!(!f.state.timelapse_on);
        assert_eq!(f.status_file(), before);
    }

    #[test]
    fn motion_tuning_reaches_detector() {
        let mut f = fixture();

        f.run(CommandCode::MotionThreshold, "12.5");
        f.run(CommandCode::MotionInitFrames, "4");
        f.run(CommandCode::MotionStartFrames, "2");
        f.run(CommandCode::MotionStopFrames, "9");
        f.run(CommandCode::MotionMode, "1");

        let params = f.tuning.get();
        assert_eq!(params.threshold, 12.5);
        assert_eq!(params.init_frames, 4);
        assert_eq!(params.start_frames, 2);
        assert_eq!(params.stop_frames, 9);
        assert_eq!(params.mode, MotionMode::External);
        assert_eq!(f.state.config.motion_threshold, 12.5);
    }

    #[test]
    fn bad_arguments_are_rejected_quietly() {
        let mut f = fixture();

        f.run(CommandCode::MotionThreshold, "lots");
        f.run(CommandCode::MotionMode, "7");
        f.run(CommandCode::Brightness, "");

        assert_eq!(f.tuning.get().threshold, 7.0);
        assert_eq!(f.tuning.get().mode, MotionMode::Internal);
        assert!(f.probe.controls().is_empty());
        assert_eq!(f.status_file(), "ready");
    }

    #[test]
    fn device_tuning_goes_to_engine() {
        let mut f = fixture();

        f.run(CommandCode::Brightness, "60");
        f.run(CommandCode::Shutter, "200");

        assert_eq!(
            f.probe.controls(),
            vec![(Tuning::Brightness, 60), (Tuning::Exposure, 200)]
        );
    }

    #[test]
    fn bitrate_applies_to_next_recording() {
        let mut f = fixture();
        f.run(CommandCode::Bitrate, "8000000");
        assert_eq!(f.state.config.video_bitrate, 8_000_000);
    }

    #[test]
    fn timelapse_fires_on_interval() {
        let mut f = fixture();
        f.run(CommandCode::TimelapseInterval, "10");
        f.run(CommandCode::Timelapse, "1");
        let start = Instant::now();

        f.executor.tick(&mut f.state, start);
        f.executor.join_all(&mut f.state);
        assert!(f.dir.path().join("media/tl_0001.jpg").exists());

        f.executor.tick(&mut f.state, start + std::time::Duration::from_millis(500));
        assert_eq!(f.executor.in_flight(), 0);

        f.executor.tick(&mut f.state, start + std::time::Duration::from_secs(1));
        assert_eq!(f.executor.in_flight(), 1);
        f.executor.join_all(&mut f.state);
        assert!(f.dir.path().join("media/tl_0002.jpg").exists());
    }

    #[test]
    fn timelapse_off_never_fires() {
        let mut f = fixture();
        f.executor.tick(&mut f.state, Instant::now());
        assert_eq!(f.executor.in_flight(), 0);
    }

    #[test]
    fn rescan_picks_up_new_files() {
        let mut f = fixture();
        fs::write(f.dir.path().join("media/im_0041.jpg"), b"").unwrap();

        f.run(CommandCode::Rescan, "");

        assert_eq!(f.state.still_image_index, 42);
    }
}
