use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("No data available yet")]
    NoDataAvailable,

    #[error("Pipe is full, nobody is reading")]
    PipeFull,

    #[error("{0} exists and is not a named pipe")]
    NotAFifo(PathBuf),
}
