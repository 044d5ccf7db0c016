use crate::config::CameraConfig;
use crate::motion::MotionSwitch;
use anyhow::{Context, Result};
use bridge::StatusFile;
use bridge::paths::part_path;
use capture::{SharedEngine, lock_engine};
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STILL_PREFIX: &str = "im_";
const VIDEO_PREFIX: &str = "vi_";
const INDEX_DIGITS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ready,
    Video,
    VideoMotion,
    Image,
    Motion,
    Halted,
    Custom(String),
}

impl Status {
    /// Status implied by the activity flags of a running engine.
    pub fn from_flags(capturing_video: bool, capturing_still: bool, motion_detection: bool) -> Self {
        match (capturing_video, capturing_still, motion_detection) {
            (true, _, true) => Status::VideoMotion,
            (true, _, false) => Status::Video,
            (false, true, _) => Status::Image,
            (false, false, true) => Status::Motion,
            (false, false, false) => Status::Ready,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Ready => "ready",
            Status::Video => "video",
            Status::VideoMotion => "video_motion",
            Status::Image => "image",
            Status::Motion => "motion",
            Status::Halted => "halted",
            Status::Custom(token) => token,
        }
    }
}

impl From<&str> for Status {
    fn from(token: &str) -> Self {
        match token {
            "ready" => Status::Ready,
            "video" => Status::Video,
            "video_motion" => Status::VideoMotion,
            "image" => Status::Image,
            "motion" => Status::Motion,
            "halted" => Status::Halted,
            other => Status::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next free still and video indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCounts {
    pub still: u32,
    pub video: u32,
}

fn artifact_index(name: &str, prefix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?.get(..INDEX_DIGITS)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Next indices given the names found in the media directory.
pub fn scan_filecounts<I, S>(names: I) -> FileCounts
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let (mut still, mut video) = (0, 0);
    for name in names {
        let name = name.as_ref();
        if let Some(i) = artifact_index(name, STILL_PREFIX) {
            still = still.max(i);
        } else if let Some(i) = artifact_index(name, VIDEO_PREFIX) {
            video = video.max(i);
        }
    }
    FileCounts {
        still: still + 1,
        video: video + 1,
    }
}

/// Expand `%i %v %Y %M %D %h %m %s` in `template` at the instant `at`.
/// Unknown tokens are kept verbatim.
pub fn expand_template(template: &str, still_index: u32, video_index: u32, at: NaiveDateTime) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('i') => out.push_str(&format!("{:04}", still_index)),
            Some('v') => out.push_str(&format!("{:04}", video_index)),
            Some('Y') => out.push_str(&format!("{:04}", at.year())),
            Some('M') => out.push_str(&format!("{:02}", at.month())),
            Some('D') => out.push_str(&format!("{:02}", at.day())),
            Some('h') => out.push_str(&format!("{:02}", at.hour())),
            Some('m') => out.push_str(&format!("{:02}", at.minute())),
            Some('s') => out.push_str(&format!("{:02}", at.second())),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Live daemon state. Owned by the executor thread.
pub struct CameraState {
    pub config: CameraConfig,
    pub still_image_index: u32,
    pub video_file_index: u32,
    pub capturing_video: bool,
    pub capturing_still: bool,
    pub motion_detection: bool,
    pub timelapse_on: bool,
    pub current_status: Status,
    pub current_video_path: Option<PathBuf>,
    engine: SharedEngine,
    status_file: StatusFile,
    motion: Arc<MotionSwitch>,
}

impl CameraState {
    /// Bare state with nothing started and nothing written.
    pub fn new(config: CameraConfig, engine: SharedEngine, motion: Arc<MotionSwitch>) -> Self {
        let status_file = StatusFile::new(&config.status_file);
        Self {
            config,
            still_image_index: 1,
            video_file_index: 1,
            capturing_video: false,
            capturing_still: false,
            motion_detection: false,
            timelapse_on: false,
            current_status: Status::Halted,
            current_video_path: None,
            engine,
            status_file,
            motion,
        }
    }

    /// Prepare directories, counters and the engine, then publish the first status.
    pub fn initialize(
        config: CameraConfig,
        engine: SharedEngine,
        motion: Arc<MotionSwitch>,
    ) -> Result<Self> {
        let mut state = Self::new(config, engine, motion);

        for dir in state.config.output_dirs() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        state.make_filecounts();

        if state.config.autostart {
            lock_engine(&state.engine)
                .start()
                .context("Failed to start capture engine")?;
            tracing::info!("Capture engine autostarted");

            if state.config.motion_detection {
                state.set_motion_detection(true);
                tracing::info!("Motion detection enabled at startup");
            }
        } else {
            tracing::info!("no autostart");
        }

        state.set_status(None);
        Ok(state)
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub fn motion_switch(&self) -> &Arc<MotionSwitch> {
        &self.motion
    }

    pub fn engine_started(&self) -> bool {
        lock_engine(&self.engine).is_started()
    }

    /// Recompute (or override) the status token and publish it.
    pub fn set_status(&mut self, custom: Option<&str>) {
        self.current_status = match custom {
            Some(token) => Status::from(token),
            None if !self.engine_started() => Status::Halted,
            None => Status::from_flags(
                self.capturing_video,
                self.capturing_still,
                self.motion_detection,
            ),
        };

        if let Err(e) = self.status_file.publish(self.current_status.as_str()) {
            tracing::error!(
                error = %e,
                path = %self.status_file.path().display(),
                "Failed to publish status"
            );
        }
    }

    pub fn reset_motion_state(&self) {
        self.motion.request_reset();
    }

    pub fn set_motion_detection(&mut self, enabled: bool) {
        self.motion_detection = enabled;
        if enabled {
            self.motion.enable();
        } else {
            self.motion.disable();
        }
        self.reset_motion_state();
    }

    pub fn start_recording(&mut self) -> Result<()> {
        if self.capturing_video {
            tracing::info!("Already capturing. Ignore");
            return Ok(());
        }

        let path = self.make_filename(&self.config.video_output_path);
        lock_engine(&self.engine)
            .start_encoder(&path, self.config.video_bitrate)
            .with_context(|| format!("Failed to start recording {}", path.display()))?;

        tracing::info!("Capturing started: {}", path.display());
        self.current_video_path = Some(path);
        self.capturing_video = true;
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<()> {
        if !self.capturing_video {
            tracing::info!("Already stopped. Ignore");
            return Ok(());
        }

        self.capturing_video = false;
        let path = self.current_video_path.take();
        lock_engine(&self.engine)
            .stop_encoder()
            .context("Failed to stop recording")?;

        self.video_file_index += 1;
        if let Some(path) = path {
            tracing::info!("Capturing stopped: {}", path.display());
        }
        Ok(())
    }

    /// Stop and start the engine. An in-flight recording is finalised first.
    pub fn restart(&mut self) -> Result<()> {
        if let Err(e) = self.stop_recording() {
            tracing::warn!("{:#}", e);
        }

        {
            let mut engine = lock_engine(&self.engine);
            engine.stop().context("Failed to stop capture engine")?;
            engine.start().context("Failed to restart capture engine")?;
        }

        tracing::info!("Capture engine restarted");
        self.set_status(Some("ready"));
        Ok(())
    }

    /// Halt the encoder and the engine and clear every activity flag.
    pub fn stop_all(&mut self) {
        {
            let mut engine = lock_engine(&self.engine);
            if engine.encoder_running()
                && let Err(e) = engine.stop_encoder()
            {
                tracing::warn!("Failed to stop encoder: {:#}", e);
            }
            if let Err(e) = engine.stop() {
                tracing::warn!("Failed to stop capture engine: {:#}", e);
            }
        }

        if self.capturing_video {
            self.video_file_index += 1;
        }
        self.capturing_video = false;
        self.capturing_still = false;
        self.timelapse_on = false;
        self.current_video_path = None;
        self.set_motion_detection(false);
        tracing::info!("All capture stopped");
    }

    pub fn make_filename(&self, template: &str) -> PathBuf {
        self.make_filename_at(template, Local::now().naive_local())
    }

    pub fn make_filename_at(&self, template: &str, at: NaiveDateTime) -> PathBuf {
        PathBuf::from(expand_template(
            template,
            self.still_image_index,
            self.video_file_index,
            at,
        ))
    }

    /// Rescan the media directory for the next free indices.
    pub fn make_filecounts(&mut self) {
        let names: Vec<String> = match fs::read_dir(&self.config.media_path) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    "Failed to scan {}: {}",
                    self.config.media_path.display(),
                    e
                );
                Vec::new()
            }
        };

        let counts = scan_filecounts(&names);
        self.still_image_index = counts.still;
        self.video_file_index = counts.video;
        tracing::info!(
            still = counts.still,
            video = counts.video,
            "File counters updated"
        );
    }

    /// Release the engine and remove transient preview files.
    pub fn teardown(&mut self) {
        self.stop_all();
        if let Err(e) = lock_engine(&self.engine).close() {
            tracing::warn!("Failed to close capture engine: {:#}", e);
        }

        remove_if_present(&self.config.preview_path);
        remove_if_present(&part_path(&self.config.preview_path));
        tracing::info!("Teardown complete");
    }
}
