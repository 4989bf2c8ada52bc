//! # Candle Common
//!
//! Shared building blocks for the candle aggregation service:
//!
//! - **Data model**: the [`data::Candle`] value exchanged between providers,
//!   the aggregation engine, and the transport layer
//! - **Error classification**: traits that let errors self-describe their
//!   retry characteristics
//! - **Logging**: standardized `tracing` initialization shared by every binary

pub mod data;
pub mod error;
pub mod logging;

pub use data::{stream_key, Candle, AGGREGATED_EXCHANGE};
pub use error::{ErrorCategory, ErrorClassification};
pub use logging::{init_logging, LogConfig, LogFormat, TimestampFormat};
