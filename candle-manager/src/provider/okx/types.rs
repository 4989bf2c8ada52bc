//! OKX wire-format types, instrument-id and bar mapping

use candle_common::Candle;

use crate::provider::{ProviderError, ProviderResult};

/// Quote currencies recognized when splitting a concatenated pair into an
/// OKX instrument id. Longest suffixes first so "USDT" wins over "USD".
const QUOTE_CURRENCIES: &[&str] = &["USDT", "USDC", "USD", "BTC", "ETH", "EUR", "GBP"];

/// Map a canonical symbol ("BTCUSDT") to an OKX instrument id ("BTC-USDT").
///
/// Symbols that already contain a hyphen pass through unchanged.
pub(super) fn to_okx_inst_id(symbol: &str) -> ProviderResult<String> {
    if symbol.is_empty() {
        return Err(ProviderError::Configuration(
            "Symbol cannot be empty".to_string(),
        ));
    }
    if symbol.contains('-') {
        return Ok(symbol.to_string());
    }

    for quote in QUOTE_CURRENCIES {
        if symbol.ends_with(quote) && symbol.len() > quote.len() {
            let base = &symbol[..symbol.len() - quote.len()];
            return Ok(format!("{}-{}", base, quote));
        }
    }

    Err(ProviderError::Configuration(format!(
        "Unable to determine quote currency for symbol: {}",
        symbol
    )))
}

/// Map a canonical interval ("1m", "1h", "1d") to an OKX bar code.
///
/// OKX keeps minutes lowercase and uses uppercase for hours/days/weeks
/// ("1H", "4H", "1D", "1W"); "1M" already means one month in both notations.
pub(super) fn to_okx_bar(interval: &str) -> ProviderResult<String> {
    let bar = match interval {
        "1m" | "3m" | "5m" | "15m" | "30m" => interval.to_string(),
        "1h" | "2h" | "4h" | "6h" | "12h" => interval.to_uppercase(),
        "1d" | "2d" | "3d" => interval.to_uppercase(),
        "1w" => "1W".to_string(),
        "1M" | "3M" => interval.to_string(),
        other => {
            return Err(ProviderError::Configuration(format!(
                "okx does not support interval: {}",
                other
            )))
        }
    };
    Ok(bar)
}

/// Convert OKX candle rows (shared by WebSocket and REST) into candles.
///
/// Row layout:
///
/// ```text
/// [0] ts        (open time, ms)
/// [1] o         (open)
/// [2] h         (high)
/// [3] l         (low)
/// [4] c         (close)
/// [5] vol       (base currency volume)
/// [6] volCcy    - unused
/// [7] volCcyQuote - unused
/// [8] confirm   ("1" = closed, "0" = current)
/// ```
///
/// OKX reports no close time; it is derived as `ts + interval - 1`.
pub(super) fn parse_rows(
    symbol: &str,
    interval: &str,
    interval_ms: i64,
    rows: &[Vec<String>],
) -> ProviderResult<Vec<Candle>> {
    let mut out = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        if row.len() < 6 {
            return Err(ProviderError::Parse(format!(
                "okx candle[{}] has {} fields, want >= 6",
                i,
                row.len()
            )));
        }

        let open_time: i64 = row[0]
            .parse()
            .map_err(|e| ProviderError::Parse(format!("okx candle[{}] open_time: {}", i, e)))?;

        let is_closed = row.get(8).map(|v| v == "1").unwrap_or(false);

        out.push(Candle {
            exchange: "okx".to_string(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open_time,
            open: row[1].clone(),
            high: row[2].clone(),
            low: row[3].clone(),
            close: row[4].clone(),
            volume: row[5].clone(),
            close_time: open_time + interval_ms - 1,
            is_closed,
        });
    }

    Ok(out)
}
