//! Bybit exchange provider
//!
//! Uses the V5 public WebSocket (`kline.<interval>.<symbol>` topics, linear
//! category) for live data and `GET /v5/market/kline` for history. Bybit
//! writes sub-day intervals as plain minute counts ("1", "60") and day/week/
//! month as "D"/"W"/"M", so canonical interval strings are mapped before
//! they reach the wire; emitted candles always carry the canonical form.

mod rest;
mod types;
mod ws;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use candle_common::Candle;

use crate::provider::{
    interval_to_ms, CandleCallback, CandleProvider, FeedSubscription, ProviderError,
    ProviderResult, Subscription,
};

use types::to_bybit_interval;

/// Default WebSocket endpoint (linear category)
const DEFAULT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// Default REST base URL
const DEFAULT_REST_URL: &str = "https://api.bybit.com";

/// Bybit provider settings
#[derive(Debug, Clone)]
pub struct BybitSettings {
    /// WebSocket URL
    pub ws_url: String,
    /// REST base URL
    pub rest_url: String,
    /// Product category ("linear", "spot", "inverse")
    pub category: String,
}

impl Default for BybitSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            category: "linear".to_string(),
        }
    }
}

/// Bybit market-data provider
pub struct BybitProvider {
    ws_url: String,
    rest_url: String,
    category: String,
    http_client: reqwest::Client,
}

impl BybitProvider {
    /// Create a new Bybit provider with default settings
    pub fn new() -> Self {
        Self::with_settings(BybitSettings::default())
    }

    /// Create a new Bybit provider with custom settings
    pub fn with_settings(settings: BybitSettings) -> Self {
        Self {
            ws_url: settings.ws_url,
            rest_url: settings.rest_url,
            category: settings.category,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for BybitProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandleProvider for BybitProvider {
    fn name(&self) -> &'static str {
        "bybit"
    }

    async fn subscribe(
        &self,
        symbol: &str,
        interval: &str,
        handler: CandleCallback,
    ) -> ProviderResult<Box<dyn Subscription>> {
        let symbol = symbol.trim().to_uppercase();
        let wire_interval = to_bybit_interval(interval)?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(ws::run_kline_stream(
            self.ws_url.clone(),
            symbol,
            interval.to_string(),
            wire_interval,
            handler,
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
        let wire_interval = to_bybit_interval(interval)?;
        let interval_ms = interval_to_ms(interval).ok_or_else(|| {
            ProviderError::Configuration(format!("unsupported interval: {}", interval))
        })?;

        rest::fetch_klines(
            &self.http_client,
            &self.rest_url,
            &self.category,
            &symbol.trim().to_uppercase(),
            interval,
            &wire_interval,
            interval_ms,
            start.timestamp_millis(),
            end.timestamp_millis(),
        )
        .await
    }
}
