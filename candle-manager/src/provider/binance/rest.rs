//! Binance historical klines via REST

use serde_json::Value;

use candle_common::Candle;

use crate::provider::{ProviderError, ProviderResult};

const KLINE_PATH: &str = "/api/v3/klines";

/// Binance caps each klines page at 1000 rows.
const PAGE_LIMIT: usize = 1000;

/// Fetch historical klines for `[start_ms, end_ms]`, paginating until the
/// full range is covered. Output is chronological (Binance already returns
/// oldest-first).
pub(super) async fn fetch_klines(
    client: &reqwest::Client,
    rest_url: &str,
    symbol: &str,
    interval: &str,
    mut start_ms: i64,
    end_ms: i64,
) -> ProviderResult<Vec<Candle>> {
    let mut out = Vec::new();

    loop {
        let batch = fetch_page(client, rest_url, symbol, interval, start_ms, end_ms).await?;
        let page_len = batch.len();
        out.extend(batch);

        // A short page means the range is exhausted.
        if page_len < PAGE_LIMIT {
            break;
        }

        // Advance past the last open time we have.
        match out.last() {
            Some(c) => start_ms = c.open_time + 1,
            None => break,
        }
        if start_ms > end_ms {
            break;
        }
    }

    Ok(out)
}

/// Fetch a single page (up to [`PAGE_LIMIT`] rows).
async fn fetch_page(
    client: &reqwest::Client,
    rest_url: &str,
    symbol: &str,
    interval: &str,
    start_ms: i64,
    end_ms: i64,
) -> ProviderResult<Vec<Candle>> {
    let url = format!("{}{}", rest_url, KLINE_PATH);

    let resp = client
        .get(&url)
        .query(&[
            ("symbol", symbol),
            ("interval", interval),
            ("startTime", &start_ms.to_string()),
            ("endTime", &end_ms.to_string()),
            ("limit", &PAGE_LIMIT.to_string()),
        ])
        .send()
        .await
        .map_err(|e| ProviderError::Request(format!("binance klines: {}", e)))?;

    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited(
            "binance klines: 429".to_string(),
        ));
    }
    if !resp.status().is_success() {
        return Err(ProviderError::Api(format!(
            "binance klines: unexpected status {}",
            resp.status()
        )));
    }

    let rows: Vec<Vec<Value>> = resp
        .json()
        .await
        .map_err(|e| ProviderError::Parse(format!("binance klines: {}", e)))?;

    parse_klines(symbol, interval, &rows)
}

/// Convert the raw Binance wire format into candles.
///
/// Kline array layout:
///
/// ```text
/// [0]  Open time       (int64, Unix ms)
/// [1]  Open            (string)
/// [2]  High            (string)
/// [3]  Low             (string)
/// [4]  Close           (string)
/// [5]  Volume          (string, base asset)
/// [6]  Close time      (int64, Unix ms)
/// [7..] quote volume, trade count, taker stats - unused
/// ```
fn parse_klines(symbol: &str, interval: &str, rows: &[Vec<Value>]) -> ProviderResult<Vec<Candle>> {
    let mut out = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        if row.len() < 7 {
            return Err(ProviderError::Parse(format!(
                "binance kline[{}] has {} fields, want >= 7",
                i,
                row.len()
            )));
        }

        let open_time = field_i64(&row[0], i, "open_time")?;
        let close_time = field_i64(&row[6], i, "close_time")?;

        out.push(Candle {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open_time,
            open: field_str(&row[1], i, "open")?,
            high: field_str(&row[2], i, "high")?,
            low: field_str(&row[3], i, "low")?,
            close: field_str(&row[4], i, "close")?,
            volume: field_str(&row[5], i, "volume")?,
            close_time,
            // Historical candles are always closed.
            is_closed: true,
        });
    }

    Ok(out)
}

fn field_i64(v: &Value, row: usize, name: &str) -> ProviderResult<i64> {
    v.as_i64().ok_or_else(|| {
        ProviderError::Parse(format!("binance kline[{}] {}: not an integer", row, name))
    })
}

fn field_str(v: &Value, row: usize, name: &str) -> ProviderResult<String> {
    v.as_str().map(str::to_string).ok_or_else(|| {
        ProviderError::Parse(format!("binance kline[{}] {}: not a string", row, name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_klines() {
        let raw = r#"[
            [1672515780000, "16500.10", "16512.30", "16499.90", "16510.00", "15.4321",
             1672515839999, "254700.00", 120, "8.1", "133700.00", "0"],
            [1672515840000, "16510.00", "16520.00", "16505.00", "16515.50", "9.0000",
             1672515899999, "148600.00", 88, "4.4", "72600.00", "0"]
        ]"#;
        let rows: Vec<Vec<Value>> = serde_json::from_str(raw).unwrap();

        let candles = parse_klines("BTCUSDT", "1m", &rows).unwrap();
        assert_eq!(candles.len(), 2);

        assert_eq!(candles[0].open_time, 1672515780000);
        assert_eq!(candles[0].close_time, 1672515839999);
        assert_eq!(candles[0].high, "16512.30");
        assert!(candles[0].is_closed);

        assert_eq!(candles[1].open, "16510.00");
        assert_eq!(candles[1].volume, "9.0000");
    }

    #[test]
    fn test_parse_klines_short_row() {
        let rows: Vec<Vec<Value>> =
            serde_json::from_str(r#"[[1672515780000, "1", "2", "3"]]"#).unwrap();
        assert!(parse_klines("BTCUSDT", "1m", &rows).is_err());
    }

    #[test]
    fn test_parse_klines_bad_open_time() {
        let rows: Vec<Vec<Value>> = serde_json::from_str(
            r#"[["oops", "1", "2", "3", "4", "5", 1672515839999]]"#,
        )
        .unwrap();
        assert!(parse_klines("BTCUSDT", "1m", &rows).is_err());
    }
}
