//! OKX historical candles via REST

use serde::Deserialize;

use candle_common::Candle;

use crate::provider::{ProviderError, ProviderResult};

const HISTORY_PATH: &str = "/api/v5/market/history-candles";

/// OKX caps each history page at 100 rows.
const PAGE_LIMIT: usize = 100;

/// OKX response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<Vec<String>>,
}

/// Fetch historical candles for `[start_ms, end_ms]`.
///
/// OKX pages newest-first with a cursor: `after=T` returns candles with
/// `ts < T`. The walk starts at `end_ms + 1`, collects rows until it runs
/// past `start_ms`, and reverses to chronological order. `interval` is the
/// canonical form stamped on the output; `bar` goes on the wire.
#[allow(clippy::too_many_arguments)]
pub(super) async fn fetch_candles(
    client: &reqwest::Client,
    rest_url: &str,
    inst_id: &str,
    symbol: &str,
    interval: &str,
    bar: &str,
    interval_ms: i64,
    start_ms: i64,
    end_ms: i64,
) -> ProviderResult<Vec<Candle>> {
    let mut all: Vec<Candle> = Vec::new();
    let mut after = end_ms + 1;

    loop {
        let batch = fetch_page(client, rest_url, inst_id, symbol, interval, bar, interval_ms, after)
            .await?;
        if batch.is_empty() {
            break;
        }
        let page_len = batch.len();

        // Rows are newest-first; keep those inside the window, stop when
        // the page runs past the window start.
        let mut ran_past_start = false;
        for candle in batch {
            if candle.open_time < start_ms {
                ran_past_start = true;
                break;
            }
            all.push(candle);
        }

        if ran_past_start || page_len < PAGE_LIMIT {
            break;
        }

        match all.last() {
            Some(c) => after = c.open_time,
            None => break,
        }
    }

    all.reverse();
    Ok(all)
}

/// Fetch a single page of up to [`PAGE_LIMIT`] rows older than `after`.
#[allow(clippy::too_many_arguments)]
async fn fetch_page(
    client: &reqwest::Client,
    rest_url: &str,
    inst_id: &str,
    symbol: &str,
    interval: &str,
    bar: &str,
    interval_ms: i64,
    after: i64,
) -> ProviderResult<Vec<Candle>> {
    let url = format!("{}{}", rest_url, HISTORY_PATH);

    let resp = client
        .get(&url)
        .query(&[
            ("instId", inst_id),
            ("bar", bar),
            ("after", &after.to_string()),
            ("limit", &PAGE_LIMIT.to_string()),
        ])
        .send()
        .await
        .map_err(|e| ProviderError::Request(format!("okx history-candles: {}", e)))?;

    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited(
            "okx history-candles: 429".to_string(),
        ));
    }
    if !resp.status().is_success() {
        return Err(ProviderError::Api(format!(
            "okx history-candles: unexpected status {}",
            resp.status()
        )));
    }

    let envelope: Envelope = resp
        .json()
        .await
        .map_err(|e| ProviderError::Parse(format!("okx history-candles: {}", e)))?;

    if envelope.code != "0" {
        return Err(ProviderError::Api(format!(
            "okx history-candles: api error {}: {}",
            envelope.code, envelope.msg
        )));
    }

    super::types::parse_rows(symbol, interval, interval_ms, &envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let raw = r#"{
            "code": "0",
            "msg": "",
            "data": [["1672515780000","16500.1","16512.3","16499.9","16510","15.432","254700","254700","1"]]
        }"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.code, "0");
        assert_eq!(envelope.data.len(), 1);
    }

    #[test]
    fn test_parse_error_envelope() {
        let raw = r#"{"code":"51001","msg":"Instrument ID does not exist","data":[]}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.code, "51001");
        assert!(envelope.data.is_empty());
    }
}
