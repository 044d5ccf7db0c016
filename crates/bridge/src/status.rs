use crate::errors::BridgeError;
use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// The well-known status file polled by clients.
///
/// Each publish writes the token to a temp file in the same directory and
/// renames it over the target, so a concurrent reader sees either the old
/// token or the new one, never a truncated file.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publish(&self, token: &str) -> Result<(), BridgeError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(token.as_bytes())?;
        tmp.flush()?;
        tmp.as_file().set_permissions(Permissions::from_mode(0o644))?;

        tmp.persist(&self.path).map_err(|e| BridgeError::IoError(e.error))?;
        Ok(())
    }

    pub fn read(&self) -> Result<String, BridgeError> {
        Ok(fs::read_to_string(&self.path)?)
    }
}
