pub mod config;
pub mod subscriber;

pub use config::{LogFormat, LoggingConfig};
pub use subscriber::{build_filter, init_logging, validate, LoggingError};
