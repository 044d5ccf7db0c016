use bridge::paths::{
    DEFAULT_CONTROL_PIPE, DEFAULT_MOTION_PIPE, DEFAULT_PREVIEW_PATH, DEFAULT_STATUS_FILE,
};
use capture::EngineSettings;
use common::LogFile;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Who acts on a motion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionMode {
    /// The daemon starts and stops recordings itself.
    Internal,
    /// Events only go out on the motion pipe.
    #[serde(alias = "monitor")]
    External,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub preview_size: [u32; 2],
    pub preview_path: PathBuf,
    pub preview_interval_ms: u64,
    pub preview_enabled: bool,
    pub image_output_path: String,
    pub lapse_output_path: String,
    pub video_output_path: String,
    pub media_path: PathBuf,
    pub status_file: PathBuf,
    pub control_file: PathBuf,
    pub motion_pipe: PathBuf,
    pub video_width: u32,
    pub video_height: u32,
    pub video_bitrate: u32,
    pub motion_mode: MotionMode,
    pub motion_threshold: f64,
    pub motion_initframes: u32,
    pub motion_startframes: u32,
    pub motion_stopframes: u32,
    pub motion_interval_ms: u64,
    /// Tenths of a second between timelapse stills.
    pub timelapse_interval: u32,
    pub poll_interval_ms: u64,
    pub autostart: bool,
    pub motion_detection: bool,
    pub log_file: PathBuf,
    /// Zero disables the log file.
    pub log_size: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            preview_size: [512, 288],
            preview_path: PathBuf::from(DEFAULT_PREVIEW_PATH),
            preview_interval_ms: 200,
            preview_enabled: true,
            image_output_path: "/tmp/media/im_%i_%Y%M%D_%h%m%s.jpg".to_string(),
            lapse_output_path: "/tmp/media/tl_%i_%Y%M%D_%h%m%s.jpg".to_string(),
            video_output_path: "/tmp/media/vi_%v_%Y%M%D_%h%m%s.mjpeg".to_string(),
            media_path: PathBuf::from("/tmp/media"),
            status_file: PathBuf::from(DEFAULT_STATUS_FILE),
            control_file: PathBuf::from(DEFAULT_CONTROL_PIPE),
            motion_pipe: PathBuf::from(DEFAULT_MOTION_PIPE),
            video_width: 1920,
            video_height: 1080,
            video_bitrate: 17_000_000,
            motion_mode: MotionMode::Internal,
            motion_threshold: 7.0,
            motion_initframes: 0,
            motion_startframes: 3,
            motion_stopframes: 50,
            motion_interval_ms: 50,
            timelapse_interval: 30,
            poll_interval_ms: 50,
            autostart: true,
            motion_detection: false,
            log_file: PathBuf::from("/tmp/camctl.log"),
            log_size: 5_000_000,
        }
    }
}

impl CameraConfig {
    /// Defaults overlaid with the JSON file at `path`, if one is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn engine_settings(&self, device_index: u32) -> EngineSettings {
        EngineSettings {
            device_index,
            width: self.video_width,
            height: self.video_height,
            ..EngineSettings::default()
        }
    }

    pub fn log_target(&self) -> Option<LogFile> {
        (self.log_size > 0).then(|| LogFile {
            path: self.log_file.clone(),
            max_bytes: self.log_size,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms.max(1))
    }

    pub fn motion_interval(&self) -> Duration {
        Duration::from_millis(self.motion_interval_ms.max(1))
    }

    pub fn timelapse_period(&self) -> Duration {
        Duration::from_millis(u64::from(self.timelapse_interval.max(1)) * 100)
    }

    /// Directories that must exist before anything is written.
    pub fn output_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = [
            self.preview_path.as_path(),
            Path::new(&self.image_output_path),
            Path::new(&self.lapse_output_path),
            Path::new(&self.video_output_path),
            self.status_file.as_path(),
        ]
        .iter()
        .filter_map(|p| p.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
        dirs.push(self.media_path.clone());
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_file() {
        let config = CameraConfig::load(None).unwrap();

        assert_eq!(config.preview_size, [512, 288]);
        assert_eq!(config.status_file, PathBuf::from("/tmp/status_mjpeg.txt"));
        assert_eq!(config.control_file, PathBuf::from("/tmp/FIFO"));
        assert_eq!(config.motion_pipe, PathBuf::from("/tmp/motionFIFO"));
        assert_eq!((config.video_width, config.video_height), (1920, 1080));
        assert_eq!(config.motion_mode, MotionMode::Internal);
        assert!(config.autostart);
        assert!(!config.motion_detection);
    }

    #[test]
    fn file_overlays_defaults_and_ignores_unknown_keys() {
        let file = write_config(
            r#"{
                "preview_size": [768, 432],
                "motion_threshold": 12.5,
                "motion_mode": "monitor",
                "autostart": false,
                "some_future_key": 1
            }"#,
        );

        let config = CameraConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.preview_size, [768, 432]);
        assert_eq!(config.motion_threshold, 12.5);
        assert_eq!(config.motion_mode, MotionMode::External);
        assert!(!config.autostart);
        assert_eq!(config.motion_startframes, 3);
        assert_eq!(config.video_bitrate, 17_000_000);
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let file = write_config("{ \"autostart\": ");
        let err = CameraConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn wrong_type_is_parse_error() {
        let file = write_config(r#"{ "motion_startframes": "three" }"#);
        let err = CameraConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = CameraConfig::load(Some(Path::new("/nonexistent/camctl.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn zero_log_size_disables_log_file() {
        let config = CameraConfig {
            log_size: 0,
            ..CameraConfig::default()
        };
        assert!(config.log_target().is_none());
        assert!(CameraConfig::default().log_target().is_some());
    }

    #[test]
    fn timelapse_interval_is_in_tenths() {
        let config = CameraConfig {
            timelapse_interval: 25,
            ..CameraConfig::default()
        };
        assert_eq!(config.timelapse_period(), Duration::from_millis(2500));
    }

    #[test]
    fn output_dirs_are_deduplicated() {
        let dirs = CameraConfig::default().output_dirs();
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/tmp"),
                PathBuf::from("/tmp/media"),
                PathBuf::from("/tmp/preview"),
            ]
        );
    }
}
