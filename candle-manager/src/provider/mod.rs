//! Exchange provider traits
//!
//! Each exchange (Binance, Bybit, OKX) implements [`CandleProvider`] to
//! expose a live kline subscription and a historical backfill over its own
//! wire protocol. Providers normalize everything to the shared
//! [`Candle`] value with canonical symbol/interval strings, so the
//! aggregation engine never sees venue-specific formats.

pub mod binance;
pub mod bybit;
pub mod mock;
pub mod okx;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use candle_common::error::{ErrorCategory, ErrorClassification};
use candle_common::Candle;

/// Provider error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Exchange API error: {0}")]
    Api(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ErrorClassification for ProviderError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::Connection(_)
            | ProviderError::Subscription(_)
            | ProviderError::Request(_) => ErrorCategory::Transient,
            ProviderError::RateLimited(_) => ErrorCategory::RateLimited,
            ProviderError::Parse(_) | ProviderError::Api(_) => ErrorCategory::Permanent,
            ProviderError::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    // Retry hints stay on the schedule the ws loops actually run: the
    // first backoff step for anything network-shaped, the full rate-limit
    // pause when a venue is throttling.
    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Backoff::INITIAL),
            ErrorCategory::RateLimited => Some(RATE_LIMIT_PAUSE),
            ErrorCategory::Permanent | ErrorCategory::Configuration => None,
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Callback invoked for every candle a provider delivers.
pub type CandleCallback = Arc<dyn Fn(Candle) + Send + Sync>;

/// Handle for one live subscription; cancelling stops delivery.
pub trait Subscription: Send + Sync {
    /// Stop the subscription. Idempotent.
    fn cancel(&self);
}

/// Contract for exchange market-data providers.
#[async_trait]
pub trait CandleProvider: Send + Sync {
    /// Stable exchange identifier stamped on every emitted candle.
    fn name(&self) -> &'static str;

    /// Start streaming kline updates for the given canonical symbol and
    /// interval. `handler` is invoked from a background task for every
    /// update, any number of times per period; the final update for a
    /// period carries `is_closed = true`.
    ///
    /// The provider reconnects on transient failure until the returned
    /// subscription is cancelled.
    async fn subscribe(
        &self,
        symbol: &str,
        interval: &str,
        handler: CandleCallback,
    ) -> ProviderResult<Box<dyn Subscription>>;

    /// Fetch closed historical candles covering `[start, end]`, in
    /// chronological order.
    async fn backfill(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ProviderResult<Vec<Candle>>;
}

/// Subscription handle backed by a broadcast shutdown channel.
///
/// Every live-stream task holds a receiver; `cancel` signals all of them.
pub(crate) struct FeedSubscription {
    shutdown: broadcast::Sender<()>,
}

impl FeedSubscription {
    pub(crate) fn new(shutdown: broadcast::Sender<()>) -> Self {
        Self { shutdown }
    }
}

impl Subscription for FeedSubscription {
    fn cancel(&self) {
        // No receivers just means the task already exited.
        let _ = self.shutdown.send(());
    }
}

/// Length in milliseconds of a canonical interval string ("1m", "4h", "1d",
/// "1w", "1M"). Months are approximated at 30 days.
pub(crate) fn interval_to_ms(interval: &str) -> Option<i64> {
    const MIN: i64 = 60_000;

    let (num, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }

    match unit {
        "m" => Some(n * MIN),
        "h" => Some(n * 60 * MIN),
        "d" => Some(n * 24 * 60 * MIN),
        "w" => Some(n * 7 * 24 * 60 * MIN),
        "M" => Some(n * 30 * 24 * 60 * MIN),
        _ => None,
    }
}

/// How long a feed sits out after hitting a venue's rate limit before it
/// touches that venue again.
pub(crate) const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(10);

/// Why a WebSocket session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Cancellation was requested; do not reconnect.
    Shutdown,
    /// The server closed the stream; reconnect.
    Disconnected,
}

/// Exponential reconnect backoff: starts at 1s, doubles to a 30s cap,
/// reset after a session that ended cleanly.
pub(crate) struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    pub(crate) fn new() -> Self {
        Self {
            delay: Self::INITIAL,
        }
    }

    /// Current delay; doubles for the next failure.
    pub(crate) fn next(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        current
    }

    pub(crate) fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }
}
