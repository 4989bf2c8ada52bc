//! Standardized logging setup.

mod config;

pub use config::{init_logging, LogConfig, LogFormat, TimestampFormat};
