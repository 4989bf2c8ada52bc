//! Candle Manager CLI
//!
//! Provides commands for:
//! - `serve`: aggregate live candles across exchanges and stream them
//! - `backfill`: fetch a merged historical window
//!
//! # Logging Configuration
//!
//! Configure via environment variables:
//! - `RUST_LOG`: log filter (e.g. "candle_manager=debug")
//! - `LOG_FORMAT`: output format ("pretty", "compact", "json")
//! - `LOG_TIMESTAMPS`: timestamp format ("local", "utc", "none")

use anyhow::Result;
use clap::Parser;

use candle_common::logging::{init_logging, LogConfig};
use candle_manager::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env().with_default_level("candle_manager=info");
    init_logging(log_config).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            candle_manager::cli::serve::execute(args).await?;
        }
        Commands::Backfill(args) => {
            candle_manager::cli::backfill::execute(args).await?;
        }
    }

    Ok(())
}
