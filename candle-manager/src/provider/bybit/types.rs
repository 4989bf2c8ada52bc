//! Bybit wire-format types and interval mapping

use serde::Deserialize;
use serde_json::value::RawValue;

use candle_common::Candle;

use crate::provider::{ProviderError, ProviderResult};

/// Map a canonical interval ("1m", "1h", "1d") to Bybit's V5 code.
///
/// Bybit uses plain minute counts for sub-day intervals and single letters
/// for day/week/month.
pub(super) fn to_bybit_interval(interval: &str) -> ProviderResult<String> {
    let code = match interval {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "2h" => "120",
        "4h" => "240",
        "6h" => "360",
        "12h" => "720",
        "1d" => "D",
        "1w" => "W",
        "1M" => "M",
        other => {
            return Err(ProviderError::Configuration(format!(
                "bybit does not support interval: {}",
                other
            )))
        }
    };
    Ok(code.to_string())
}

/// Generic V5 WebSocket message envelope.
///
/// Control frames (pong, subscription ack) carry `op`/`success` and no
/// `topic`; kline pushes carry `topic` and a data array.
#[derive(Debug, Deserialize)]
pub(super) struct WsMessage<'a> {
    #[serde(default)]
    pub topic: String,
    #[serde(default, borrow)]
    pub data: Option<&'a RawValue>,
}

/// One kline object inside the data array.
#[derive(Debug, Deserialize)]
pub(super) struct WsKlineEntry {
    /// Open time (ms)
    pub start: i64,
    /// Close time (ms)
    pub end: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    /// true = candle is closed
    pub confirm: bool,
}

/// Parse one WebSocket frame into candles. Control frames yield an empty
/// list. `interval` is the canonical form stamped on the output.
pub(super) fn parse_ws_message(
    symbol: &str,
    interval: &str,
    msg: &str,
) -> ProviderResult<Vec<Candle>> {
    let envelope: WsMessage = serde_json::from_str(msg)
        .map_err(|e| ProviderError::Parse(format!("envelope: {}", e)))?;

    // Pong or subscribe ack.
    if envelope.topic.is_empty() {
        return Ok(Vec::new());
    }

    let data = envelope
        .data
        .ok_or_else(|| ProviderError::Parse("kline push without data".to_string()))?;
    let entries: Vec<WsKlineEntry> = serde_json::from_str(data.get())
        .map_err(|e| ProviderError::Parse(format!("data: {}", e)))?;

    Ok(entries
        .into_iter()
        .map(|e| Candle {
            exchange: "bybit".to_string(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open_time: e.start,
            open: e.open,
            high: e.high,
            low: e.low,
            close: e.close,
            volume: e.volume,
            close_time: e.end,
            is_closed: e.confirm,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_bybit_interval() {
        assert_eq!(to_bybit_interval("1m").unwrap(), "1");
        assert_eq!(to_bybit_interval("1h").unwrap(), "60");
        assert_eq!(to_bybit_interval("4h").unwrap(), "240");
        assert_eq!(to_bybit_interval("1d").unwrap(), "D");
        assert_eq!(to_bybit_interval("1w").unwrap(), "W");
        assert!(to_bybit_interval("7m").is_err());
    }

    #[test]
    fn test_parse_kline_push() {
        let msg = r#"{
            "topic": "kline.1.BTCUSDT",
            "type": "snapshot",
            "ts": 1672515782000,
            "data": [{
                "start": 1672515780000,
                "end": 1672515839999,
                "interval": "1",
                "open": "16500.1",
                "close": "16510",
                "high": "16512.3",
                "low": "16499.9",
                "volume": "15.432",
                "turnover": "254700.2",
                "confirm": false,
                "timestamp": 1672515782000
            }]
        }"#;

        let candles = parse_ws_message("BTCUSDT", "1m", msg).unwrap();
        assert_eq!(candles.len(), 1);

        let c = &candles[0];
        assert_eq!(c.exchange, "bybit");
        assert_eq!(c.interval, "1m");
        assert_eq!(c.open_time, 1672515780000);
        assert_eq!(c.close_time, 1672515839999);
        assert_eq!(c.high, "16512.3");
        assert!(!c.is_closed);
    }

    #[test]
    fn test_parse_control_frames() {
        let pong = r#"{"op":"pong","success":true,"conn_id":"abc"}"#;
        assert!(parse_ws_message("BTCUSDT", "1m", pong).unwrap().is_empty());

        let ack = r#"{"op":"subscribe","success":true,"conn_id":"abc","req_id":"1"}"#;
        assert!(parse_ws_message("BTCUSDT", "1m", ack).unwrap().is_empty());
    }

    #[test]
    fn test_parse_confirmed_kline() {
        let msg = r#"{
            "topic": "kline.1.ETHUSDT",
            "data": [{
                "start": 1672515780000,
                "end": 1672515839999,
                "interval": "1",
                "open": "1200",
                "close": "1201.5",
                "high": "1202",
                "low": "1199",
                "volume": "100.5",
                "confirm": true
            }]
        }"#;

        let candles = parse_ws_message("ETHUSDT", "1m", msg).unwrap();
        assert!(candles[0].is_closed);
    }
}
