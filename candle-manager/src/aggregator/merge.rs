//! Per-period candle merging

use std::collections::BTreeMap;

use candle_common::{Candle, AGGREGATED_EXCHANGE};

/// Combine per-exchange candles for one period into one aggregated candle.
///
/// - `exchange` becomes [`AGGREGATED_EXCHANGE`]
/// - `symbol`, `interval`, `open_time`, `close_time`, `open` come from the
///   first entry (all entries share the period by construction)
/// - `high` / `low` keep the exact source string of the numerically
///   greatest / smallest value, so venue precision survives
/// - `close` comes from the last entry
/// - `volume` is the f64 sum of the parseable non-negative volumes,
///   re-encoded in shortest decimal form
/// - `is_closed` is always false here; the caller decides
///
/// The map is keyed by exchange id, so iteration order - and with it the
/// `open`/`close` selection - is deterministic: `open` and `close_time`
/// from the lexicographically first exchange, `close` from the last.
///
/// Values that fail to parse are excluded from the high/low comparison and
/// contribute nothing to the volume sum; a malformed candle must not take
/// down the stream.
///
/// Returns `None` for an empty map.
pub(crate) fn merge(per_exchange: &BTreeMap<String, Candle>) -> Option<Candle> {
    let mut entries = per_exchange.values();
    let first = entries.next()?;

    let mut agg = first.clone();
    agg.exchange = AGGREGATED_EXCHANGE.to_string();
    agg.is_closed = false;

    let mut max_high = parse_price(&first.high);
    let mut min_low = parse_price(&first.low);
    let mut volume_sum = parse_volume(&first.volume);

    for candle in entries {
        if let Some(high) = parse_price(&candle.high) {
            if max_high.map_or(true, |m| high > m) {
                max_high = Some(high);
                agg.high = candle.high.clone();
            }
        }
        if let Some(low) = parse_price(&candle.low) {
            if min_low.map_or(true, |m| low < m) {
                min_low = Some(low);
                agg.low = candle.low.clone();
            }
        }
        volume_sum += parse_volume(&candle.volume);
        agg.close = candle.close.clone();
    }

    agg.volume = format_volume(volume_sum);
    Some(agg)
}

fn parse_price(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Volume contribution: parseable, finite, and positive; everything else
/// counts as zero.
fn parse_volume(s: &str) -> f64 {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

/// Shortest decimal encoding of the summed volume. Rust's float `Display`
/// never uses scientific notation, so "5" stays "5" and "0.1" stays "0.1".
fn format_volume(v: f64) -> String {
    v.to_string()
}
