//! OKX exchange provider
//!
//! Uses the V5 public WebSocket (`candle<bar>` channels) for live data and
//! `GET /api/v5/market/history-candles` for history. OKX addresses
//! instruments with hyphenated ids ("BTC-USDT") and writes hour/day bars in
//! uppercase ("1H", "1D"), so canonical symbols and intervals are mapped
//! before they reach the wire; emitted candles always carry the canonical
//! form.

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

use types::{to_okx_bar, to_okx_inst_id};

/// Default WebSocket endpoint
const DEFAULT_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// Default REST base URL
const DEFAULT_REST_URL: &str = "https://www.okx.com";

/// OKX provider settings
#[derive(Debug, Clone)]
pub struct OkxSettings {
    /// WebSocket URL
    pub ws_url: String,
    /// REST base URL
    pub rest_url: String,
}

impl Default for OkxSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
        }
    }
}

/// OKX market-data provider
pub struct OkxProvider {
    ws_url: String,
    rest_url: String,
    http_client: reqwest::Client,
}

impl OkxProvider {
    /// Create a new OKX provider with default settings
    pub fn new() -> Self {
        Self::with_settings(OkxSettings::default())
    }

    /// Create a new OKX provider with custom settings
    pub fn with_settings(settings: OkxSettings) -> Self {
        Self {
            ws_url: settings.ws_url,
            rest_url: settings.rest_url,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for OkxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandleProvider for OkxProvider {
    fn name(&self) -> &'static str {
        "okx"
    }

    async fn subscribe(
        &self,
        symbol: &str,
        interval: &str,
        handler: CandleCallback,
    ) -> ProviderResult<Box<dyn Subscription>> {
        let symbol = symbol.trim().to_uppercase();
        let inst_id = to_okx_inst_id(&symbol)?;
        let bar = to_okx_bar(interval)?;
        let interval_ms = interval_to_ms(interval).ok_or_else(|| {
            ProviderError::Configuration(format!("unsupported interval: {}", interval))
        })?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(ws::run_candle_stream(
            self.ws_url.clone(),
            inst_id,
            symbol,
            interval.to_string(),
            bar,
            interval_ms,
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
        let symbol = symbol.trim().to_uppercase();
        let inst_id = to_okx_inst_id(&symbol)?;
        let bar = to_okx_bar(interval)?;
        let interval_ms = interval_to_ms(interval).ok_or_else(|| {
            ProviderError::Configuration(format!("unsupported interval: {}", interval))
        })?;

        rest::fetch_candles(
            &self.http_client,
            &self.rest_url,
            &inst_id,
            &symbol,
            interval,
            &bar,
            interval_ms,
            start.timestamp_millis(),
            end.timestamp_millis(),
        )
        .await
    }
}
