pub mod config;
pub mod logging;
pub mod macros;
pub mod retry;

pub use config::Environment;
pub use logging::{LogFile, SizeCappedLog, setup_logging};
