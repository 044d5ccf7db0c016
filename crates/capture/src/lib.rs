pub mod encode;
pub mod engine;
pub mod luma;
pub mod synthetic;

#[cfg(feature = "v4l")]
pub mod decoder;
#[cfg(feature = "v4l")]
pub mod device;
#[cfg(feature = "v4l")]
pub mod v4l_engine;

pub use engine::{CaptureEngine, CaptureError, EngineSettings, SharedEngine, Tuning, lock_engine, share};
pub use luma::LumaFrame;
pub use synthetic::{SyntheticEngine, SyntheticProbe};

#[cfg(feature = "v4l")]
pub use v4l_engine::V4lEngine;
