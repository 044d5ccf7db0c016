//! Default locations of the daemon's filesystem IPC endpoints.
//!
//! Clients (web front-ends, scripts) and the daemon must agree on these, so
//! they live in one place. Every one of them can be overridden in the
//! configuration file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Control pipe - clients write commands, the daemon reads
pub const DEFAULT_CONTROL_PIPE: &str = "/tmp/FIFO";

/// Motion pipe - the daemon writes "1"/"0" on detector transitions
pub const DEFAULT_MOTION_PIPE: &str = "/tmp/motionFIFO";

/// Status file - holds exactly the current status token
pub const DEFAULT_STATUS_FILE: &str = "/tmp/status_mjpeg.txt";

/// Preview image refreshed by the preview renderer
pub const DEFAULT_PREVIEW_PATH: &str = "/tmp/preview/cam_preview.jpg";

/// Suffix of the in-progress preview written before the rename
pub const PART_SUFFIX: &str = ".part.jpg";

/// Upper bound of a single control pipe read
pub const READ_CHUNK_SIZE: usize = 1024;

/// `<path>.part.jpg`, the staging name used before atomically replacing `path`.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}
