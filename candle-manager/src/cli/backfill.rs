//! Backfill command - fetch and print a merged historical window

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::Args;
use tracing::info;

use crate::aggregator::CandleAggregator;
use crate::config::Settings;

/// Arguments for the backfill command
#[derive(Args)]
pub struct BackfillArgs {
    /// Symbol to fetch (e.g. BTCUSDT)
    #[arg(long, short, default_value = "BTCUSDT")]
    pub symbol: String,

    /// Candle interval (e.g. 1m, 5m, 1h)
    #[arg(long, short, default_value = "1m")]
    pub interval: String,

    /// Window start (RFC 3339, e.g. 2024-01-01T00:00:00Z)
    #[arg(long)]
    pub start: String,

    /// Window end (RFC 3339); defaults to now
    #[arg(long)]
    pub end: Option<String>,

    /// Providers to aggregate across (comma-separated; overrides config)
    #[arg(long, value_delimiter = ',')]
    pub providers: Option<Vec<String>>,

    /// Configuration file path
    #[arg(long, short)]
    pub config: Option<String>,
}

/// Execute the backfill command
pub async fn execute(args: BackfillArgs) -> Result<()> {
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;

    let provider_names = args
        .providers
        .unwrap_or_else(|| settings.providers.enabled.clone());
    let providers = super::build_providers(&provider_names)?;

    let start = parse_time(&args.start).context("parsing --start")?;
    let end = match &args.end {
        Some(end) => parse_time(end).context("parsing --end")?,
        None => Utc::now(),
    };

    info!(
        "Backfilling {}:{} from {} to {} across {}",
        args.symbol,
        args.interval,
        start,
        end,
        provider_names.join(", ")
    );

    let aggregator = CandleAggregator::new(providers)
        .with_history_limit(settings.aggregator.history_limit);

    let candles = aggregator
        .backfill(&args.symbol, &args.interval, start, end)
        .await?;

    info!("Merged {} candles", candles.len());
    for candle in &candles {
        let open_time = Utc
            .timestamp_millis_opt(candle.open_time)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| candle.open_time.to_string());
        println!(
            "{} o={} h={} l={} c={} v={}",
            open_time, candle.open, candle.high, candle.low, candle.close, candle.volume
        );
    }

    Ok(())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid RFC 3339 timestamp: {}", s))?;
    Ok(parsed.with_timezone(&Utc))
}
