//! Binance exchange provider
//!
//! Live klines come from the public WebSocket stream
//! (`<symbol>@kline_<interval>`); history comes from the `/api/v3/klines`
//! REST endpoint. Binance interval strings ("1m", "1h", "1d") are the
//! canonical form used across the service, so no interval mapping is needed
//! here.

mod rest;
mod types;
mod ws;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tokio::sync::broadcast;

use candle_common::Candle;

use crate::provider::{
    CandleCallback, CandleProvider, FeedSubscription, ProviderError, ProviderResult, Subscription,
};

/// Default WebSocket endpoint
const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Default REST endpoint
const DEFAULT_REST_URL: &str = "https://api.binance.com";

/// Binance provider settings
#[derive(Debug, Clone)]
pub struct BinanceSettings {
    /// WebSocket URL
    pub ws_url: String,
    /// REST base URL
    pub rest_url: String,
    /// Maximum reconnection attempts per minute
    pub rate_limit_attempts: u32,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            rate_limit_attempts: 5,
        }
    }
}

/// Binance market-data provider
pub struct BinanceProvider {
    ws_url: String,
    rest_url: String,
    http_client: reqwest::Client,
    /// Rate limiter for reconnections
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl BinanceProvider {
    /// Create a new Binance provider with default settings
    pub fn new() -> Self {
        Self::with_settings(BinanceSettings::default())
    }

    /// Create a new Binance provider with custom settings
    pub fn with_settings(settings: BinanceSettings) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(settings.rate_limit_attempts.max(1)).expect("non-zero"),
        );

        Self {
            ws_url: settings.ws_url,
            rest_url: settings.rest_url,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

impl Default for BinanceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandleProvider for BinanceProvider {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn subscribe(
        &self,
        symbol: &str,
        interval: &str,
        handler: CandleCallback,
    ) -> ProviderResult<Box<dyn Subscription>> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(ProviderError::Configuration(
                "Symbol cannot be empty".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(ws::run_kline_stream(
            self.ws_url.clone(),
            symbol,
            interval.to_string(),
            handler,
            self.rate_limiter.clone(),
            shutdown_rx,
        ));

        Ok(Box::new(FeedSubscription::new(shutdown_tx)))
    }

    async fn backfill(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ProviderResult<Vec<Candle>> {
        rest::fetch_klines(
            &self.http_client,
            &self.rest_url,
            &symbol.trim().to_uppercase(),
            interval,
            start.timestamp_millis(),
            end.timestamp_millis(),
        )
        .await
    }
}
