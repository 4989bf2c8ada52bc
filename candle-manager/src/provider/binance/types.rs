//! Binance wire-format types

use serde::Deserialize;

use candle_common::Candle;

/// Kline stream event envelope.
///
/// ```json
/// {"e":"kline","E":1700000000123,"s":"BTCUSDT","k":{...}}
/// ```
#[derive(Debug, Deserialize)]
pub struct WsKlineMsg {
    /// Event type; "kline" for the stream we subscribe to
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: WsKline,
}

/// The kline payload inside a stream event.
#[derive(Debug, Deserialize)]
pub struct WsKline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl WsKlineMsg {
    /// Convert a stream event into the normalized candle value.
    pub fn into_candle(self) -> Candle {
        let k = self.kline;
        Candle {
            exchange: "binance".to_string(),
            symbol: self.symbol,
            interval: k.interval,
            open_time: k.open_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            close_time: k.close_time,
            is_closed: k.is_closed,
        }
    }
}
