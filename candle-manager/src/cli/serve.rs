//! Serve command - start the aggregation service

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::aggregator::CandleAggregator;
use crate::config::Settings;
use crate::transport::{CandleStreamServer, TransportConfig};

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Symbols to aggregate (comma-separated)
    #[arg(long, short, default_value = "BTCUSDT", value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Candle interval (e.g. 1m, 5m, 1h)
    #[arg(long, short, default_value = "1m")]
    pub interval: String,

    /// Providers to aggregate across (comma-separated; overrides config)
    #[arg(long, value_delimiter = ',')]
    pub providers: Option<Vec<String>>,

    /// WebSocket bind address (overrides config)
    #[arg(long)]
    pub bind: Option<String>,

    /// Configuration file path
    #[arg(long, short)]
    pub config: Option<String>,
}

/// Execute the serve command
pub async fn execute(args: ServeArgs) -> Result<()> {
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;

    let provider_names = args
        .providers
        .unwrap_or_else(|| settings.providers.enabled.clone());
    let providers = super::build_providers(&provider_names)?;

    info!("Starting candle manager");
    info!("  Providers: {}", provider_names.join(", "));
    info!("  Symbols: {}", args.symbols.join(", "));
    info!("  Interval: {}", args.interval);

    let aggregator = Arc::new(
        CandleAggregator::new(providers)
            .with_history_limit(settings.aggregator.history_limit),
    );

    let mut server = CandleStreamServer::new(TransportConfig {
        bind: args.bind.unwrap_or(settings.transport.bind),
        buffer: settings.transport.buffer,
    });
    server.start().await.context("starting stream server")?;

    // The transport is just another downstream handler.
    let mut tokens = Vec::with_capacity(args.symbols.len());
    for symbol in &args.symbols {
        let token = aggregator
            .subscribe(symbol, &args.interval, server.handler())
            .await
            .with_context(|| format!("subscribing {}:{}", symbol, args.interval))?;
        tokens.push(token);
    }

    info!("Aggregation running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    info!("Shutting down");
    aggregator.close();
    server.stop().await;
    drop(tokens);

    Ok(())
}
