use crate::config::Environment;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Where the daemon mirrors its log lines, and how large the file may grow.
#[derive(Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    pub max_bytes: u64,
}

/// Initialize tracing subscriber with pretty formatting for development
/// and JSON formatting for production.
///
/// Uses RUST_LOG environment variable for filtering (defaults to "info" if not set).
///
/// When `log_file` is given with a non-zero size, every event is also written
/// (without ANSI colours) to a size-capped file through a non-blocking writer.
/// The returned guard must be kept alive for the file writer to flush.
pub fn setup_logging(
    environment: Environment,
    log_file: Option<&LogFile>,
) -> io::Result<Option<WorkerGuard>> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let (file_layer, guard) = match log_file {
        Some(log) if log.max_bytes > 0 => {
            let writer = SizeCappedLog::open(&log.path, log.max_bytes)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    match environment {
        Environment::Production => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_level(true))
                .init();
        }
        Environment::Development => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
                .init();
        }
    }

    Ok(guard)
}

/// Append-only log writer that rotates `<path>` to `<path>.1` once the next
/// write would push it past `max_bytes`. At most one rotated file is kept.
pub struct SizeCappedLog {
    path: PathBuf,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl SizeCappedLog {
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = Self::open_append(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            file,
            written,
        })
    }

    pub fn rotated_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".1");
        PathBuf::from(name)
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, self.rotated_path())?;
        self.file = Self::open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeCappedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
