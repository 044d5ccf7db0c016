use crate::errors::BridgeError;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FIFO_MODE: u32 = 0o666;

/// Create the parent directory and the named pipe at `path` if either is missing.
///
/// Idempotent: an existing FIFO is left alone. A regular file or directory
/// squatting on the path is rejected rather than replaced.
pub fn ensure_fifo(path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
    }

    match fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => Ok(()),
        Ok(_) => Err(BridgeError::NotAFifo(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            match nix::unistd::mkfifo(path, Mode::from_bits_truncate(FIFO_MODE)) {
                // Lost a race with another creator
                Ok(()) | Err(Errno::EEXIST) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Non-blocking handle on a named pipe.
///
/// The pipe is opened read+write: opening never blocks waiting for a peer,
/// and because the daemon itself counts as a writer, a client hanging up
/// does not leave the descriptor in a permanent end-of-file state.
pub struct Fifo {
    path: PathBuf,
    file: File,
}

impl Fifo {
    pub fn setup(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        ensure_fifo(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block for at most `timeout` until the pipe has data to read.
    ///
    /// Returns `Ok(false)` on timeout or when interrupted by a signal.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool, BridgeError> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                return Ok(false);
            }
            return Err(errno.into());
        }

        Ok(ret > 0 && pfd.revents & libc::POLLIN != 0)
    }

    /// One non-blocking read attempt.
    ///
    /// An empty pipe is reported as [`BridgeError::NoDataAvailable`].
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, BridgeError> {
        match self.file.read(buf) {
            Ok(0) => Err(BridgeError::NoDataAvailable),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Err(BridgeError::NoDataAvailable)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `data` without blocking. A pipe with no room left is reported as
    /// [`BridgeError::PipeFull`]; the payload is never partially retried.
    pub fn write_nonblocking(&mut self, data: &[u8]) -> Result<(), BridgeError> {
        match self.file.write(data) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(_) => Err(BridgeError::PipeFull),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(BridgeError::PipeFull),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_setup_creates_parent_and_fifo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/control");

        let fifo = Fifo::setup(&path).expect("setup should succeed");

        assert_eq!(fifo.path(), path.as_path());
        assert!(fs::metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn test_setup_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control");

        let _first = Fifo::setup(&path).unwrap();
        let _second = Fifo::setup(&path).unwrap();

        assert!(fs::metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn test_setup_rejects_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, b"not a pipe").unwrap();

        match Fifo::setup(&path) {
            Err(BridgeError::NotAFifo(p)) => assert_eq!(p, path),
            other => panic!("expected NotAFifo, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_empty_read_is_no_data() {
        let dir = tempdir().unwrap();
        let mut fifo = Fifo::setup(dir.path().join("control")).unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(
            fifo.read_chunk(&mut buf),
            Err(BridgeError::NoDataAvailable)
        ));
        assert!(!fifo.wait_readable(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control");
        let mut fifo = Fifo::setup(&path).unwrap();

        let mut client = OpenOptions::new().write(true).open(&path).unwrap();
        client.write_all(b"im\n").unwrap();
        drop(client);

        assert!(fifo.wait_readable(Duration::from_millis(500)).unwrap());
        let mut buf = [0u8; 64];
        let n = fifo.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"im\n");

        // Writer hung up, but the daemon's own write end keeps the pipe quiet
        assert!(!fifo.wait_readable(Duration::from_millis(10)).unwrap());
    }
}
