//! Command-line interface
//!
//! Provides CLI commands for the candle manager.

pub mod backfill;
pub mod serve;

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use crate::provider::binance::BinanceProvider;
use crate::provider::bybit::BybitProvider;
use crate::provider::mock::MockProvider;
use crate::provider::okx::OkxProvider;
use crate::provider::CandleProvider;

/// Candle Manager CLI
#[derive(Parser)]
#[command(name = "candle-manager")]
#[command(about = "Aggregated multi-exchange candle streaming")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the aggregation service and stream merged candles
    Serve(serve::ServeArgs),
    /// Fetch a merged historical window and print it
    Backfill(backfill::BackfillArgs),
}

/// Instantiate providers by name, in the given order.
pub(crate) fn build_providers(names: &[String]) -> Result<Vec<Arc<dyn CandleProvider>>> {
    if names.is_empty() {
        bail!("at least one provider is required");
    }

    let mut providers: Vec<Arc<dyn CandleProvider>> = Vec::with_capacity(names.len());
    for name in names {
        match name.as_str() {
            "binance" => providers.push(Arc::new(BinanceProvider::new())),
            "bybit" => providers.push(Arc::new(BybitProvider::new())),
            "okx" => providers.push(Arc::new(OkxProvider::new())),
            "mock" => providers.push(Arc::new(MockProvider::with_synthetic_feed("mock"))),
            other => bail!("unknown provider: {}", other),
        }
    }
    Ok(providers)
}
