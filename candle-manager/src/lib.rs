//! # Candle Manager
//!
//! Multi-exchange OHLCV candle aggregation service.
//!
//! ## Features
//!
//! - **Live aggregation**: one merged candle stream per (symbol, interval)
//!   key, combined across every configured exchange feed
//! - **Principled close semantics**: a period closes when every exchange has
//!   confirmed it, or is force-closed the moment any exchange moves on
//! - **Historical backfill**: per-exchange REST history merged into a single
//!   chronological series
//! - **Streaming distribution**: WebSocket fan-out with a bounded buffer and
//!   drop-on-overflow for slow clients
//!
//! ## Architecture
//!
//! Exchange providers (Binance, Bybit, OKX) normalize venue wire formats into
//! the common [`candle_common::Candle`] value and push updates into the
//! [`aggregator::CandleAggregator`], which owns all per-key state. Downstream
//! consumers register handlers through the aggregator; the transport layer is
//! just another handler.

pub mod aggregator;
pub mod cli;
pub mod config;
pub mod provider;
pub mod transport;

// Re-export commonly used types
pub use aggregator::{AggregatorError, CandleAggregator};
pub use config::Settings;
pub use provider::{CandleCallback, CandleProvider, ProviderError, ProviderResult, Subscription};
