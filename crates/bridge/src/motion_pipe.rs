use crate::errors::BridgeError;
use crate::fifo::Fifo;
use std::path::Path;

/// Writer side of the motion channel: one byte per detector transition,
/// `b'1'` when motion starts and `b'0'` when it stops.
pub struct MotionPipe {
    fifo: Fifo,
}

impl MotionPipe {
    pub fn setup(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        Ok(Self {
            fifo: Fifo::setup(path)?,
        })
    }

    pub fn send(&mut self, detected: bool) -> Result<(), BridgeError> {
        let payload: &[u8] = if detected { b"1" } else { b"0" };
        self.fifo.write_nonblocking(payload)
    }
}
