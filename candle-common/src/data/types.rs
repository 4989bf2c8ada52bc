//! Candle (kline) value type.
//!
//! Prices and volume are carried as the exact strings the exchange reported.
//! This preserves venue precision end-to-end; numeric work (high/low
//! comparison, volume summation) parses on demand.

use serde::{Deserialize, Serialize};

/// Exchange identifier carried by merged candles.
pub const AGGREGATED_EXCHANGE: &str = "aggregated";

/// One OHLCV candlestick for one (symbol, interval) period on one source.
///
/// `open_time` identifies the period. `is_closed` marks the final update for
/// that period on that source; earlier updates for the same period are
/// intra-period snapshots and may arrive any number of times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Source exchange id (e.g. "binance"), or [`AGGREGATED_EXCHANGE`]
    pub exchange: String,
    /// Trading pair, canonical form (e.g. "BTCUSDT")
    pub symbol: String,
    /// Period length, canonical form (e.g. "1m")
    pub interval: String,
    /// Period open, Unix epoch milliseconds
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    /// Base-asset volume
    pub volume: String,
    /// Period close, Unix epoch milliseconds
    pub close_time: i64,
    /// Final update for this period on this source
    pub is_closed: bool,
}

impl Candle {
    /// The `symbol:interval` key this candle belongs to.
    pub fn stream_key(&self) -> String {
        stream_key(&self.symbol, &self.interval)
    }
}

/// Build the `symbol:interval` key under which per-pair state is partitioned.
pub fn stream_key(symbol: &str, interval: &str) -> String {
    format!("{}:{}", symbol, interval)
}
