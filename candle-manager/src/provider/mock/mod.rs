//! Mock provider for tests and demo serving
//!
//! Two modes:
//!
//! - **Captured** (default): `subscribe` records the handler and emits
//!   nothing on its own. Tests feed candles through [`MockProvider::push`]
//!   to drive the aggregation engine deterministically.
//! - **Synthetic** ([`MockProvider::with_synthetic_feed`]): a background
//!   task emits a deterministic price walk, one update per second, closing
//!   each period on schedule. Used by `serve --providers mock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Duration;

use candle_common::Candle;

use crate::provider::{
    interval_to_ms, CandleCallback, CandleProvider, ProviderError, ProviderResult, Subscription,
};

/// Mock market-data provider
pub struct MockProvider {
    name: &'static str,
    /// Captured handlers, tagged with the `symbol:interval` key they were
    /// subscribed under so pushes route like a real per-stream feed
    handlers: Arc<Mutex<HashMap<u64, (String, CandleCallback)>>>,
    next_id: AtomicU64,
    /// Canned backfill response, filtered to the requested window
    backfill: Mutex<Vec<Candle>>,
    /// When set, the next subscribe call fails
    fail_subscribe: AtomicBool,
    /// When set, the next backfill call fails
    fail_backfill: AtomicBool,
    subscribe_calls: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
    /// Emit a synthetic feed after subscribe
    synthetic: bool,
}

impl MockProvider {
    /// Create a captured-mode mock with the given exchange id.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            backfill: Mutex::new(Vec::new()),
            fail_subscribe: AtomicBool::new(false),
            fail_backfill: AtomicBool::new(false),
            subscribe_calls: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicUsize::new(0)),
            synthetic: false,
        }
    }

    /// Create a mock that generates a deterministic candle stream.
    pub fn with_synthetic_feed(name: &'static str) -> Self {
        let mut provider = Self::new(name);
        provider.synthetic = true;
        provider
    }

    /// Set the canned backfill response.
    pub fn set_backfill(&self, candles: Vec<Candle>) {
        *self.backfill.lock() = candles;
    }

    /// Make the next subscribe call fail.
    pub fn fail_next_subscribe(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    /// Make the next backfill call fail.
    pub fn fail_next_backfill(&self) {
        self.fail_backfill.store(true, Ordering::SeqCst);
    }

    /// Deliver a candle to the handlers subscribed for its stream key, as
    /// the live feed would.
    pub fn push(&self, candle: Candle) {
        let key = candle.stream_key();
        let handlers: Vec<CandleCallback> = self
            .handlers
            .lock()
            .values()
            .filter(|(k, _)| *k == key)
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(candle.clone());
        }
    }

    /// Number of handlers currently registered.
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Total subscribe calls observed.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of subscription tokens cancelled so far.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Token that removes the captured handler on cancel.
struct MockSubscription {
    id: u64,
    handlers: Arc<Mutex<HashMap<u64, (String, CandleCallback)>>>,
    cancelled: Arc<AtomicUsize>,
    shutdown: broadcast::Sender<()>,
}

impl Subscription for MockSubscription {
    fn cancel(&self) {
        if self.handlers.lock().remove(&self.id).is_some() {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        let _ = self.shutdown.send(());
    }
}

#[async_trait]
impl CandleProvider for MockProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn subscribe(
        &self,
        symbol: &str,
        interval: &str,
        handler: CandleCallback,
    ) -> ProviderResult<Box<dyn Subscription>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_subscribe.swap(false, Ordering::SeqCst) {
            return Err(ProviderError::Subscription(format!(
                "{}: subscription refused",
                self.name
            )));
        }

        let synthetic_interval_ms = if self.synthetic {
            Some(interval_to_ms(interval).ok_or_else(|| {
                ProviderError::Configuration(format!("unsupported interval: {}", interval))
            })?)
        } else {
            None
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = candle_common::stream_key(symbol, interval);
        self.handlers.lock().insert(id, (key, handler.clone()));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        if let Some(interval_ms) = synthetic_interval_ms {
            tokio::spawn(run_synthetic_feed(
                self.name,
                symbol.to_string(),
                interval.to_string(),
                interval_ms,
                handler,
                shutdown_rx,
            ));
        }

        Ok(Box::new(MockSubscription {
            id,
            handlers: self.handlers.clone(),
            cancelled: self.cancelled.clone(),
            shutdown: shutdown_tx,
        }))
    }

    async fn backfill(
        &self,
        _symbol: &str,
        _interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ProviderResult<Vec<Candle>> {
        if self.fail_backfill.swap(false, Ordering::SeqCst) {
            return Err(ProviderError::Request(format!(
                "{}: backfill refused",
                self.name
            )));
        }

        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        Ok(self
            .backfill
            .lock()
            .iter()
            .filter(|c| c.open_time >= start_ms && c.open_time <= end_ms)
            .cloned()
            .collect())
    }
}

/// Emit a deterministic price walk: one intra-period update per second and a
/// closing update at each period boundary.
async fn run_synthetic_feed(
    exchange: &'static str,
    symbol: String,
    interval: String,
    interval_ms: i64,
    handler: CandleCallback,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut step = 0i64;
    let mut prev_period: Option<i64> = None;

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tick.tick() => {
                let now_ms = Utc::now().timestamp_millis();
                let open_time = now_ms - now_ms.rem_euclid(interval_ms);

                // Triangle wave around a fixed base keeps the data
                // plausible without any randomness.
                let base = 40_000 + (step % 200 - 100).abs() * 10;
                step += 1;

                if let Some(prev) = prev_period {
                    if prev < open_time {
                        handler(synthetic_candle(
                            exchange, &symbol, &interval, prev, interval_ms, base, true,
                        ));
                    }
                }
                prev_period = Some(open_time);

                handler(synthetic_candle(
                    exchange, &symbol, &interval, open_time, interval_ms, base, false,
                ));
            }
        }
    }
}

fn synthetic_candle(
    exchange: &str,
    symbol: &str,
    interval: &str,
    open_time: i64,
    interval_ms: i64,
    base: i64,
    is_closed: bool,
) -> Candle {
    Candle {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time,
        open: base.to_string(),
        high: (base + 50).to_string(),
        low: (base - 50).to_string(),
        close: (base + 10).to_string(),
        volume: "1.5".to_string(),
        close_time: open_time + interval_ms - 1,
        is_closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open_time: i64) -> Candle {
        Candle {
            exchange: "mock".to_string(),
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            open_time,
            open: "1".to_string(),
            high: "2".to_string(),
            low: "0.5".to_string(),
            close: "1.5".to_string(),
            volume: "10".to_string(),
            close_time: open_time + 59_999,
            is_closed: true,
        }
    }

    #[tokio::test]
    async fn test_push_reaches_subscribed_handler() {
        let provider = MockProvider::new("mock");
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        let token = provider
            .subscribe(
                "BTCUSDT",
                "1m",
                Arc::new(move |_| {
                    seen_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        assert_eq!(provider.handler_count(), 1);
        provider.push(candle(1000));
        provider.push(candle(2000));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        token.cancel();
        provider.push(candle(3000));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(provider.cancelled_count(), 1);
        assert_eq!(provider.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_next_subscribe() {
        let provider = MockProvider::new("mock");
        provider.fail_next_subscribe();

        let result = provider
            .subscribe("BTCUSDT", "1m", Arc::new(|_| {}))
            .await;
        assert!(result.is_err());

        // Only the next call fails.
        assert!(provider
            .subscribe("BTCUSDT", "1m", Arc::new(|_| {}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_backfill_window_filter() {
        let provider = MockProvider::new("mock");
        provider.set_backfill(vec![candle(1000), candle(61_000), candle(121_000)]);

        let start = Utc.timestamp_millis_opt(1000).unwrap();
        let end = Utc.timestamp_millis_opt(61_000).unwrap();
        let out = provider.backfill("BTCUSDT", "1m", start, end).await.unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].open_time, 1000);
        assert_eq!(out[1].open_time, 61_000);
    }
}
