//! Market data value types.

mod types;

pub use types::{stream_key, Candle, AGGREGATED_EXCHANGE};
