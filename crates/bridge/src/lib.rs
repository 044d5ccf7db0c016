pub mod errors;
pub mod fifo;
pub mod motion_pipe;
pub mod paths;
pub mod status;

pub use errors::BridgeError;
pub use fifo::{Fifo, ensure_fifo};
pub use motion_pipe::MotionPipe;
pub use status::StatusFile;
