//! Bybit historical klines via REST

use serde::Deserialize;

use candle_common::Candle;

use crate::provider::{ProviderError, ProviderResult};

const KLINE_PATH: &str = "/v5/market/kline";

/// Bybit caps each kline page at 200 rows.
const PAGE_LIMIT: usize = 200;

/// V5 response envelope.
#[derive(Debug, Deserialize)]
struct KlineEnvelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: KlineResult,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct KlineResult {
    list: Vec<Vec<String>>,
}

/// Fetch historical klines for `[start_ms, end_ms]`.
///
/// Bybit returns candles newest-first; pagination walks backwards through
/// the range and the result is reversed to chronological order before
/// returning. `interval` is the canonical form stamped on the output;
/// `wire_interval` goes on the wire.
#[allow(clippy::too_many_arguments)]
pub(super) async fn fetch_klines(
    client: &reqwest::Client,
    rest_url: &str,
    category: &str,
    symbol: &str,
    interval: &str,
    wire_interval: &str,
    interval_ms: i64,
    start_ms: i64,
    end_ms: i64,
) -> ProviderResult<Vec<Candle>> {
    let mut all: Vec<Candle> = Vec::new();
    let mut end = end_ms;

    loop {
        let batch = fetch_page(
            client,
            rest_url,
            category,
            symbol,
            interval,
            wire_interval,
            interval_ms,
            start_ms,
            end,
        )
        .await?;
        if batch.is_empty() {
            break;
        }
        let page_len = batch.len();
        all.extend(batch);

        if page_len < PAGE_LIMIT {
            break;
        }

        // Newest-first: the oldest open time collected so far is last.
        match all.last() {
            Some(c) => end = c.open_time - 1,
            None => break,
        }
        if end < start_ms {
            break;
        }
    }

    all.reverse();
    Ok(all)
}

/// Fetch a single page (up to [`PAGE_LIMIT`] rows, newest-first).
#[allow(clippy::too_many_arguments)]
async fn fetch_page(
    client: &reqwest::Client,
    rest_url: &str,
    category: &str,
    symbol: &str,
    interval: &str,
    wire_interval: &str,
    interval_ms: i64,
    start_ms: i64,
    end_ms: i64,
) -> ProviderResult<Vec<Candle>> {
    let url = format!("{}{}", rest_url, KLINE_PATH);

    let resp = client
        .get(&url)
        .query(&[
            ("category", category),
            ("symbol", symbol),
            ("interval", wire_interval),
            ("start", &start_ms.to_string()),
            ("end", &end_ms.to_string()),
            ("limit", &PAGE_LIMIT.to_string()),
        ])
        .send()
        .await
        .map_err(|e| ProviderError::Request(format!("bybit kline: {}", e)))?;

    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited("bybit kline: 429".to_string()));
    }
    if !resp.status().is_success() {
        return Err(ProviderError::Api(format!(
            "bybit kline: unexpected status {}",
            resp.status()
        )));
    }

    let envelope: KlineEnvelope = resp
        .json()
        .await
        .map_err(|e| ProviderError::Parse(format!("bybit kline: {}", e)))?;

    if envelope.ret_code != 0 {
        return Err(ProviderError::Api(format!(
            "bybit kline: api error {}: {}",
            envelope.ret_code, envelope.ret_msg
        )));
    }

    parse_klines(symbol, interval, interval_ms, &envelope.result.list)
}

/// Convert the Bybit wire format into candles.
///
/// Kline array layout:
///
/// ```text
/// [0] startTime  (ms, as string)
/// [1] openPrice
/// [2] highPrice
/// [3] lowPrice
/// [4] closePrice
/// [5] volume     (base coin)
/// [6] turnover   (quote coin) - unused
/// ```
///
/// Bybit reports no close time; it is derived as `start + interval - 1`.
fn parse_klines(
    symbol: &str,
    interval: &str,
    interval_ms: i64,
    rows: &[Vec<String>],
) -> ProviderResult<Vec<Candle>> {
    let mut out = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        if row.len() < 6 {
            return Err(ProviderError::Parse(format!(
                "bybit kline[{}] has {} fields, want >= 6",
                i,
                row.len()
            )));
        }

        let open_time: i64 = row[0].parse().map_err(|e| {
            ProviderError::Parse(format!("bybit kline[{}] open_time: {}", i, e))
        })?;

        out.push(Candle {
            exchange: "bybit".to_string(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open_time,
            open: row[1].clone(),
            high: row[2].clone(),
            low: row[3].clone(),
            close: row[4].clone(),
            volume: row[5].clone(),
            close_time: open_time + interval_ms - 1,
            is_closed: true,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_klines() {
        let rows = vec![
            vec![
                "1672515840000".to_string(),
                "16510".to_string(),
                "16520".to_string(),
                "16505".to_string(),
                "16515.5".to_string(),
                "9".to_string(),
                "148600".to_string(),
            ],
            vec![
                "1672515780000".to_string(),
                "16500.1".to_string(),
                "16512.3".to_string(),
                "16499.9".to_string(),
                "16510".to_string(),
                "15.432".to_string(),
                "254700".to_string(),
            ],
        ];

        let candles = parse_klines("BTCUSDT", "1m", 60_000, &rows).unwrap();
        assert_eq!(candles.len(), 2);

        // Rows stay in wire order here; the caller reverses after pagination.
        assert_eq!(candles[0].open_time, 1672515840000);
        assert_eq!(candles[0].close_time, 1672515899999);
        assert_eq!(candles[1].high, "16512.3");
        assert!(candles.iter().all(|c| c.is_closed));
        assert!(candles.iter().all(|c| c.interval == "1m"));
    }

    #[test]
    fn test_parse_klines_short_row() {
        let rows = vec![vec!["1672515780000".to_string(), "1".to_string()]];
        assert!(parse_klines("BTCUSDT", "1m", 60_000, &rows).is_err());
    }

    #[test]
    fn test_parse_envelope() {
        let raw = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "linear",
                "symbol": "BTCUSDT",
                "list": [["1672515780000","16500.1","16512.3","16499.9","16510","15.432","254700"]]
            },
            "time": 1672515782000
        }"#;
        let envelope: KlineEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.ret_code, 0);
        assert_eq!(envelope.result.list.len(), 1);
    }

    #[test]
    fn test_parse_error_envelope() {
        let raw = r#"{"retCode": 10001, "retMsg": "params error", "result": {}}"#;
        let envelope: KlineEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.ret_code, 10001);
        assert!(envelope.result.list.is_empty());
    }
}
