//! End-to-end aggregation engine scenarios driven through mock providers.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use candle_common::Candle;
use candle_manager::provider::mock::MockProvider;
use candle_manager::{CandleAggregator, CandleCallback, CandleProvider, Subscription};

/// Collects every dispatched candle for later assertions.
#[derive(Clone, Default)]
struct Collector(Arc<Mutex<Vec<Candle>>>);

impl Collector {
    fn handler(&self) -> CandleCallback {
        let events = self.0.clone();
        Arc::new(move |candle| events.lock().push(candle))
    }

    fn events(&self) -> Vec<Candle> {
        self.0.lock().clone()
    }

    fn closed_events(&self) -> Vec<Candle> {
        self.events().into_iter().filter(|c| c.is_closed).collect()
    }
}

fn candle(
    exchange: &str,
    open_time: i64,
    high: &str,
    low: &str,
    volume: &str,
    is_closed: bool,
) -> Candle {
    Candle {
        exchange: exchange.to_string(),
        symbol: "BTCUSDT".to_string(),
        interval: "1m".to_string(),
        open_time,
        open: "100".to_string(),
        high: high.to_string(),
        low: low.to_string(),
        close: "100.5".to_string(),
        volume: volume.to_string(),
        close_time: open_time + 59_999,
        is_closed,
    }
}

fn aggregator_with(
    feeds: &[Arc<MockProvider>],
    history_limit: usize,
) -> CandleAggregator {
    let providers: Vec<Arc<dyn CandleProvider>> = feeds
        .iter()
        .map(|f| f.clone() as Arc<dyn CandleProvider>)
        .collect();
    CandleAggregator::new(providers).with_history_limit(history_limit)
}

#[tokio::test]
async fn normal_close_merges_both_exchanges() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone()], 10);

    let collector = Collector::default();
    let _token = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await
        .unwrap();

    alpha.push(candle("alpha", 1000, "10", "9", "2", false));
    beta.push(candle("beta", 1000, "11", "8", "3", false));
    alpha.push(candle("alpha", 1000, "10", "9", "2", true));
    beta.push(candle("beta", 1000, "11", "8", "3", true));

    let events = collector.events();
    assert_eq!(events.len(), 4);

    // Intra-period updates are open.
    assert!(!events[0].is_closed);
    assert!(!events[1].is_closed);
    assert!(!events[2].is_closed);

    // The final dispatch carries the fully-confirmed merge.
    let last = &events[3];
    assert!(last.is_closed);
    assert_eq!(last.exchange, "aggregated");
    assert_eq!(last.high, "11");
    assert_eq!(last.low, "8");
    assert_eq!(last.volume, "5");
    assert_eq!(last.open_time, 1000);
}

#[tokio::test]
async fn force_close_when_any_exchange_advances() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone()], 10);

    let collector = Collector::default();
    let _token = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await
        .unwrap();

    alpha.push(candle("alpha", 1000, "10", "9", "1", false));
    beta.push(candle("beta", 1000, "10", "9", "1", false));
    // Alpha moves on before beta ever confirms period 1000.
    alpha.push(candle("alpha", 2000, "12", "11", "1", false));

    let events = collector.events();
    assert_eq!(events.len(), 4);

    // The force-closed merge of period 1000 lands before any 2000 update.
    let forced = &events[2];
    assert!(forced.is_closed);
    assert_eq!(forced.open_time, 1000);
    assert_eq!(forced.high, "10");
    assert_eq!(forced.low, "9");
    assert_eq!(forced.volume, "2");

    assert_eq!(events[3].open_time, 2000);
    assert!(!events[3].is_closed);
}

#[tokio::test]
async fn late_arrival_for_finalized_period_is_dropped() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone()], 10);

    let collector = Collector::default();
    let _token = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await
        .unwrap();

    alpha.push(candle("alpha", 1000, "10", "9", "1", false));
    beta.push(candle("beta", 1000, "10", "9", "1", false));
    alpha.push(candle("alpha", 2000, "12", "11", "1", false));
    let dispatched_before = collector.events().len();

    // Beta's straggling confirmation for the force-closed period.
    beta.push(candle("beta", 1000, "10", "9", "5", true));

    assert_eq!(collector.events().len(), dispatched_before);
    let history = aggregator.history("BTCUSDT", "1m");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].open_time, 1000);
    assert_eq!(history[0].volume, "2");
}

#[tokio::test]
async fn cancelling_one_handler_leaves_siblings_running() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let aggregator = aggregator_with(&[alpha.clone()], 10);

    let first = Collector::default();
    let second = Collector::default();
    let first_token = aggregator
        .subscribe("BTCUSDT", "1m", first.handler())
        .await
        .unwrap();
    let _second_token = aggregator
        .subscribe("BTCUSDT", "1m", second.handler())
        .await
        .unwrap();

    alpha.push(candle("alpha", 1000, "10", "9", "1", false));
    assert_eq!(first.events().len(), 1);
    assert_eq!(second.events().len(), 1);

    first_token.cancel();

    alpha.push(candle("alpha", 1000, "10", "9", "2", false));
    alpha.push(candle("alpha", 1000, "10", "9", "2", true));

    // The cancelled handler saw nothing further; the survivor saw it all.
    assert_eq!(first.events().len(), 1);
    assert_eq!(second.events().len(), 3);
    assert!(second.events().last().unwrap().is_closed);

    // Upstream feeds stay alive for the next subscriber.
    assert_eq!(alpha.cancelled_count(), 0);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let aggregator = aggregator_with(&[alpha.clone()], 10);

    let collector = Collector::default();
    let token = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await
        .unwrap();

    token.cancel();
    token.cancel();

    alpha.push(candle("alpha", 1000, "10", "9", "1", false));
    assert!(collector.events().is_empty());
}

#[tokio::test]
async fn setup_failure_rolls_back_and_next_subscribe_retries() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let gamma = Arc::new(MockProvider::new("gamma"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone(), gamma.clone()], 10);

    beta.fail_next_subscribe();

    let collector = Collector::default();
    let result = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await;
    assert!(result.is_err());

    // Alpha was subscribed then rolled back; gamma was never reached.
    assert_eq!(alpha.subscribe_calls(), 1);
    assert_eq!(alpha.cancelled_count(), 1);
    assert_eq!(beta.subscribe_calls(), 1);
    assert_eq!(gamma.subscribe_calls(), 0);

    // A subsequent identical call retries all three from scratch.
    let token = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await
        .unwrap();
    assert_eq!(alpha.subscribe_calls(), 2);
    assert_eq!(beta.subscribe_calls(), 2);
    assert_eq!(gamma.subscribe_calls(), 1);

    alpha.push(candle("alpha", 1000, "10", "9", "1", false));
    assert_eq!(collector.events().len(), 1);
    token.cancel();
}

#[tokio::test]
async fn second_subscriber_reuses_upstream_feeds() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let aggregator = aggregator_with(&[alpha.clone()], 10);

    let first = Collector::default();
    let second = Collector::default();
    let _a = aggregator
        .subscribe("BTCUSDT", "1m", first.handler())
        .await
        .unwrap();
    let _b = aggregator
        .subscribe("BTCUSDT", "1m", second.handler())
        .await
        .unwrap();

    // One upstream dial serves both downstream handlers.
    assert_eq!(alpha.subscribe_calls(), 1);

    // Distinct keys dial separately.
    let _c = aggregator
        .subscribe("ETHUSDT", "1m", first.handler())
        .await
        .unwrap();
    assert_eq!(alpha.subscribe_calls(), 2);
}

#[tokio::test]
async fn handler_isolation_across_keys() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let aggregator = aggregator_with(&[alpha.clone()], 10);

    let btc = Collector::default();
    let eth = Collector::default();
    let btc_token = aggregator
        .subscribe("BTCUSDT", "1m", btc.handler())
        .await
        .unwrap();
    let _eth_token = aggregator
        .subscribe("ETHUSDT", "1m", eth.handler())
        .await
        .unwrap();

    // Cancelling the last handler on one key must not disturb the other.
    btc_token.cancel();

    let mut eth_candle = candle("alpha", 1000, "10", "9", "1", false);
    eth_candle.symbol = "ETHUSDT".to_string();
    alpha.push(eth_candle);

    assert!(btc.events().is_empty());
    assert_eq!(eth.events().len(), 1);
}

#[tokio::test]
async fn backfill_merges_disjoint_sources_chronologically() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone()], 10);

    alpha.set_backfill(vec![
        candle("alpha", 1000, "10", "9", "1", true),
        candle("alpha", 2000, "12", "11", "1", true),
    ]);
    beta.set_backfill(vec![
        candle("beta", 1000, "11", "8", "2", true),
        candle("beta", 3000, "14", "13", "1", true),
    ]);

    let start = Utc.timestamp_millis_opt(0).unwrap();
    let end = Utc.timestamp_millis_opt(10_000).unwrap();
    let merged = aggregator
        .backfill("BTCUSDT", "1m", start, end)
        .await
        .unwrap();

    let times: Vec<i64> = merged.iter().map(|c| c.open_time).collect();
    assert_eq!(times, vec![1000, 2000, 3000]);
    assert!(merged.iter().all(|c| c.is_closed));
    assert!(merged.iter().all(|c| c.exchange == "aggregated"));

    // Period 1000 merges both sources.
    assert_eq!(merged[0].high, "11");
    assert_eq!(merged[0].low, "8");
    assert_eq!(merged[0].volume, "3");

    // 2000 and 3000 each carry a single source.
    assert_eq!(merged[1].volume, "1");
    assert_eq!(merged[2].high, "14");
}

#[tokio::test]
async fn backfill_fails_whole_when_any_source_fails() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone()], 10);

    alpha.set_backfill(vec![candle("alpha", 1000, "10", "9", "1", true)]);
    beta.fail_next_backfill();

    let start = Utc.timestamp_millis_opt(0).unwrap();
    let end = Utc.timestamp_millis_opt(10_000).unwrap();

    // No partial results: the healthy source's data is not returned.
    let result = aggregator.backfill("BTCUSDT", "1m", start, end).await;
    assert!(result.is_err());

    // Retry succeeds once the failing source recovers.
    let merged = aggregator
        .backfill("BTCUSDT", "1m", start, end)
        .await
        .unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].volume, "1");
}

#[tokio::test]
async fn close_cancels_upstream_but_not_downstream_tokens() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone()], 10);

    let collector = Collector::default();
    let token = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await
        .unwrap();

    aggregator.close();
    assert_eq!(alpha.cancelled_count(), 1);
    assert_eq!(beta.cancelled_count(), 1);

    // The downstream token is still valid to cancel afterwards.
    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_producers_keep_finalization_monotonic() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone()], 20);

    let collector = Collector::default();
    let _token = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await
        .unwrap();

    const PERIODS: i64 = 200;

    let producer = |feed: Arc<MockProvider>, name: &'static str| {
        std::thread::spawn(move || {
            for i in 0..PERIODS {
                let t = i * 60_000;
                feed.push(candle(name, t, "10", "9", "1", false));
                feed.push(candle(name, t, "10", "9", "1", true));
            }
        })
    };

    let a = producer(alpha.clone(), "alpha");
    let b = producer(beta.clone(), "beta");
    a.join().unwrap();
    b.join().unwrap();

    // Finalized candles reach the handler in non-decreasing order, each
    // period at most once.
    let closed = collector.closed_events();
    assert!(!closed.is_empty());
    let mut seen = std::collections::HashSet::new();
    let mut last = i64::MIN;
    for c in &closed {
        assert!(
            c.open_time >= last,
            "finalized out of order: {} after {}",
            c.open_time,
            last
        );
        assert!(
            seen.insert(c.open_time),
            "period {} finalized twice",
            c.open_time
        );
        last = c.open_time;
    }

    // History is strictly increasing and respects the ring bound.
    let history = aggregator.history("BTCUSDT", "1m");
    assert!(history.len() <= 40);
    assert!(history
        .windows(2)
        .all(|w| w[0].open_time < w[1].open_time));
}

#[tokio::test]
async fn intra_period_updates_reflect_current_merge() {
    let alpha = Arc::new(MockProvider::new("alpha"));
    let beta = Arc::new(MockProvider::new("beta"));
    let aggregator = aggregator_with(&[alpha.clone(), beta.clone()], 10);

    let collector = Collector::default();
    let _token = aggregator
        .subscribe("BTCUSDT", "1m", collector.handler())
        .await
        .unwrap();

    alpha.push(candle("alpha", 1000, "10", "9", "1", false));
    alpha.push(candle("alpha", 1000, "10.5", "9", "1.5", false));
    beta.push(candle("beta", 1000, "11", "8.5", "2", false));

    let events = collector.events();
    assert_eq!(events.len(), 3);

    // Each dispatch reflects the then-current per-exchange set.
    assert_eq!(events[0].high, "10");
    assert_eq!(events[0].volume, "1");
    assert_eq!(events[1].high, "10.5");
    assert_eq!(events[1].volume, "1.5");
    assert_eq!(events[2].high, "11");
    assert_eq!(events[2].low, "8.5");
    assert_eq!(events[2].volume, "3.5");
}
