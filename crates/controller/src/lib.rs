pub mod command;
pub mod config;
pub mod executor;
pub mod motion;
pub mod preview;
pub mod queue;
pub mod service;
pub mod state;

pub use command::{CommandCode, CommandReader, CommandRecord};
pub use config::{CameraConfig, ConfigError, MotionMode};
pub use executor::Executor;
pub use queue::CommandQueue;
pub use service::CameraService;
pub use state::{CameraState, Status};
