//! Candle aggregation engine
//!
//! Multiplexes candle updates from every configured exchange provider into a
//! single aggregated stream per `symbol:interval` key.
//!
//! Closed semantics: a period is marked `is_closed` only once every exchange
//! has confirmed it. If exchange A starts the next period before exchange B
//! has closed the current one, the current period is force-closed
//! immediately - a straggler feed must not wedge the stream. Late-arriving
//! candles for an already-finalized period are dropped.
//!
//! Locking: one mutex around the key map (held only for lookup/insert) and
//! one mutex per key state. No lock is held across an await, an upstream
//! call, or a downstream handler invocation; handlers are snapshotted under
//! the lock and invoked after it is released. Fan-out order is preserved by
//! a per-key ticket turnstile instead of a lock spanning the handler calls.

mod merge;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use candle_common::{stream_key, Candle};

use crate::provider::{CandleCallback, CandleProvider, ProviderError, Subscription};

use merge::merge;

/// Default cap on retained finalized candles per key. The history buffer
/// grows freely until it hits twice this, then trims back.
pub const DEFAULT_HISTORY_LIMIT: usize = 365;

/// Aggregation errors
#[derive(Error, Debug)]
pub enum AggregatorError {
    /// An exchange refused the subscription during first-time setup for the
    /// key. No partial live subscription is left behind; the next subscribe
    /// call for the same key retries every exchange from scratch.
    #[error("upstream subscribe failed [{key}]: {cause}")]
    UpstreamSubscribeFailed {
        key: String,
        cause: Arc<ProviderError>,
    },

    /// An exchange refused a historical query. No partial history is
    /// returned.
    #[error("upstream backfill failed [{key}]: {cause}")]
    UpstreamBackfillFailed { key: String, cause: ProviderError },
}

/// In-flight state of one time period across all exchanges.
struct PendingPeriod {
    /// Latest candle received from each exchange for this period
    per_exchange: BTreeMap<String, Candle>,
    /// Exchanges that have delivered `is_closed = true` for this period
    closed_by: HashSet<String>,
    /// Most recent merge result across `per_exchange`
    agg: Candle,
}

/// Upstream setup progress for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupPhase {
    NotStarted,
    InProgress,
    Ready,
}

/// Runtime data for one `symbol:interval` key.
struct SymbolState {
    /// Number of exchange feeds; a period closes naturally once this many
    /// confirmations arrive
    num_exchanges: usize,
    history_limit: usize,
    inner: Mutex<SymbolStateInner>,
    /// Ticket currently allowed to fan out to handlers. Tickets are issued
    /// under `inner` in mutation order; each publisher waits for its turn
    /// only after `inner` is released. Candles therefore reach handlers in
    /// the order the state machine produced them, while no lock is ever
    /// held across a handler call - a cancel or subscribe never queues
    /// behind a running handler.
    publish_turn: Mutex<u64>,
    publish_ready: Condvar,
}

struct SymbolStateInner {
    phase: SetupPhase,
    /// Error from the last failed setup attempt; observed by subscribers
    /// that raced it
    setup_err: Option<Arc<ProviderError>>,

    /// Exchange-level subscription tokens (for shutdown)
    upstream: Vec<Box<dyn Subscription>>,

    /// In-flight periods, keyed by open time
    pending: BTreeMap<i64, PendingPeriod>,
    /// Open times that have been finalized (normally or force-closed)
    finalized: HashSet<i64>,
    /// Rolling history of finalized merged candles
    history: Vec<Candle>,

    /// Registered downstream handlers
    handlers: HashMap<u64, CandleCallback>,
    next_handler_id: u64,

    /// Next fan-out ticket; assigned under this lock so ticket order
    /// matches mutation order
    next_publish_ticket: u64,
}

impl SymbolState {
    fn new(num_exchanges: usize, history_limit: usize) -> Self {
        Self {
            num_exchanges,
            history_limit,
            inner: Mutex::new(SymbolStateInner {
                phase: SetupPhase::NotStarted,
                setup_err: None,
                upstream: Vec::new(),
                pending: BTreeMap::new(),
                finalized: HashSet::new(),
                history: Vec::new(),
                handlers: HashMap::new(),
                next_handler_id: 0,
                next_publish_ticket: 0,
            }),
            publish_turn: Mutex::new(0),
            publish_ready: Condvar::new(),
        }
    }

    /// Ingest one candle from an exchange feed. Runs on whatever task the
    /// provider delivers from; all mutation happens under the state lock,
    /// handler dispatch after releasing it.
    fn handle_candle(&self, candle: Candle) {
        let open_time = candle.open_time;
        let mut to_publish: Vec<Candle> = Vec::new();

        let (ticket, handlers) = {
            let mut inner = self.inner.lock();

            // Already committed to history; admitting this update would
            // break append-only ordering downstream.
            if inner.finalized.contains(&open_time) {
                return;
            }

            // Force-close every pending period strictly older than the
            // incoming one: some exchange has moved on, so those periods
            // are over from this aggregator's perspective.
            let stale: Vec<i64> = inner.pending.range(..open_time).map(|(t, _)| *t).collect();
            for t in stale {
                if let Some(period) = inner.pending.remove(&t) {
                    let mut agg = period.agg;
                    agg.is_closed = true;
                    debug!(
                        "force-closing period {} of {} ({}/{} exchanges confirmed)",
                        t,
                        agg.stream_key(),
                        period.closed_by.len(),
                        self.num_exchanges
                    );
                    push_history(&mut inner, agg.clone(), self.history_limit);
                    inner.finalized.insert(t);
                    to_publish.push(agg);
                }
            }

            // Upsert this exchange's latest candle and re-merge.
            let (merged, all_confirmed) = {
                let period = inner.pending.entry(open_time).or_insert_with(|| {
                    PendingPeriod {
                        per_exchange: BTreeMap::new(),
                        closed_by: HashSet::new(),
                        // Placeholder; replaced by the merge below before
                        // anything can observe it.
                        agg: candle.clone(),
                    }
                });
                period
                    .per_exchange
                    .insert(candle.exchange.clone(), candle.clone());
                if candle.is_closed {
                    period.closed_by.insert(candle.exchange.clone());
                }
                if let Some(agg) = merge(&period.per_exchange) {
                    period.agg = agg;
                }
                (
                    period.agg.clone(),
                    period.closed_by.len() == self.num_exchanges,
                )
            };

            let mut published = merged;
            if all_confirmed {
                inner.pending.remove(&open_time);
                published.is_closed = true;
                push_history(&mut inner, published.clone(), self.history_limit);
                inner.finalized.insert(open_time);
            }
            to_publish.push(published);

            // Snapshot before unlocking so concurrent registration or
            // cancellation during fan-out is well-defined.
            let handlers: Vec<CandleCallback> = inner.handlers.values().cloned().collect();
            let ticket = inner.next_publish_ticket;
            inner.next_publish_ticket += 1;
            (ticket, handlers)
        };

        // State lock released; wait for older publishes to finish so the
        // ordering produced above survives the fan-out.
        {
            let mut turn = self.publish_turn.lock();
            while *turn != ticket {
                self.publish_ready.wait(&mut turn);
            }
        }

        for candle in &to_publish {
            for handler in &handlers {
                handler(candle.clone());
            }
        }

        *self.publish_turn.lock() += 1;
        self.publish_ready.notify_all();
    }
}

/// Append to the rolling history, trimming back to `limit` entries once the
/// buffer exceeds twice that.
fn push_history(inner: &mut SymbolStateInner, candle: Candle, limit: usize) {
    inner.history.push(candle);
    if inner.history.len() > limit * 2 {
        let drop = inner.history.len() - limit;
        inner.history.drain(..drop);
    }
}

/// Cancels a single downstream handler registration.
pub struct HandlerToken {
    id: u64,
    state: Arc<SymbolState>,
}

impl Subscription for HandlerToken {
    fn cancel(&self) {
        self.state.inner.lock().handlers.remove(&self.id);
    }
}

/// Multiplexes candle updates from multiple exchange providers into one
/// aggregated stream per `symbol:interval` key.
pub struct CandleAggregator {
    providers: Vec<Arc<dyn CandleProvider>>,
    history_limit: usize,
    states: Mutex<HashMap<String, Arc<SymbolState>>>,
}

impl CandleAggregator {
    /// Create an aggregator backed by the given exchange providers. The
    /// provider set is fixed for the aggregator's lifetime.
    pub fn new(providers: Vec<Arc<dyn CandleProvider>>) -> Self {
        Self {
            providers,
            history_limit: DEFAULT_HISTORY_LIMIT,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Override the per-key history cap.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Register `handler` to receive aggregated candle updates for
    /// symbol/interval. Exchange subscriptions are created lazily on the
    /// first call for each key; cancelling the returned token removes only
    /// this handler and leaves the upstream feeds running for the next
    /// subscriber.
    ///
    /// Handlers must not block and must not call back into the aggregator
    /// for the same key from within the callback.
    pub async fn subscribe(
        &self,
        symbol: &str,
        interval: &str,
        handler: CandleCallback,
    ) -> Result<HandlerToken, AggregatorError> {
        let key = stream_key(symbol, interval);
        let state = self.get_or_create_state(&key);

        // Register the handler before dialing the exchanges so an early
        // candle is never missed; claim setup if nobody has done it yet.
        let (id, owns_setup, raced_failure) = {
            let mut inner = state.inner.lock();
            let id = inner.next_handler_id;
            inner.next_handler_id += 1;
            inner.handlers.insert(id, handler);

            let owns_setup = inner.phase == SetupPhase::NotStarted;
            if owns_setup {
                inner.phase = SetupPhase::InProgress;
                inner.setup_err = None;
            }
            (id, owns_setup, inner.setup_err.clone())
        };

        if owns_setup {
            match self.start_upstream(&key, symbol, interval, &state).await {
                Ok(tokens) => {
                    let mut inner = state.inner.lock();
                    inner.upstream = tokens;
                    inner.phase = SetupPhase::Ready;
                    inner.setup_err = None;
                    info!(
                        "aggregation started [{}] across {} exchanges",
                        key,
                        self.providers.len()
                    );
                }
                Err(e) => {
                    let cause = Arc::new(e);
                    let mut inner = state.inner.lock();
                    // Allow a future caller to retry from scratch.
                    inner.phase = SetupPhase::NotStarted;
                    inner.setup_err = Some(cause.clone());
                    inner.handlers.remove(&id);
                    return Err(AggregatorError::UpstreamSubscribeFailed { key, cause });
                }
            }
        } else if let Some(cause) = raced_failure {
            // Setup by another caller already failed; report the same error.
            state.inner.lock().handlers.remove(&id);
            return Err(AggregatorError::UpstreamSubscribeFailed { key, cause });
        }

        Ok(HandlerToken { id, state })
    }

    /// Fetch historical candles from every exchange, merge them by open
    /// time, and return them in chronological order. Fails as a whole if
    /// any exchange fails; historical candles are always closed.
    pub async fn backfill(
        &self,
        symbol: &str,
        interval: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Candle>, AggregatorError> {
        let key = stream_key(symbol, interval);

        let mut groups: BTreeMap<i64, BTreeMap<String, Candle>> = BTreeMap::new();
        for provider in &self.providers {
            let batch = provider
                .backfill(symbol, interval, start, end)
                .await
                .map_err(|cause| AggregatorError::UpstreamBackfillFailed {
                    key: key.clone(),
                    cause,
                })?;
            for candle in batch {
                groups
                    .entry(candle.open_time)
                    .or_default()
                    .insert(candle.exchange.clone(), candle);
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for group in groups.values() {
            if let Some(mut agg) = merge(group) {
                agg.is_closed = true;
                out.push(agg);
            }
        }
        Ok(out)
    }

    /// Snapshot of the finalized history for a key, oldest first.
    pub fn history(&self, symbol: &str, interval: &str) -> Vec<Candle> {
        let key = stream_key(symbol, interval);
        let states = self.states.lock();
        match states.get(&key) {
            Some(state) => state.inner.lock().history.clone(),
            None => Vec::new(),
        }
    }

    /// Cancel every exchange subscription managed by this aggregator.
    /// Existing downstream tokens stay valid but receive nothing further.
    pub fn close(&self) {
        let states = self.states.lock();
        for (key, state) in states.iter() {
            let mut inner = state.inner.lock();
            let count = inner.upstream.len();
            for token in inner.upstream.drain(..) {
                token.cancel();
            }
            if count > 0 {
                debug!("cancelled {} upstream subscriptions [{}]", count, key);
            }
        }
        info!("aggregator closed");
    }

    fn get_or_create_state(&self, key: &str) -> Arc<SymbolState> {
        let mut states = self.states.lock();
        states
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(SymbolState::new(self.providers.len(), self.history_limit))
            })
            .clone()
    }

    /// Subscribe every provider in order, routing each delivered candle
    /// into the key's state machine. On failure, cancels whatever was
    /// already subscribed so no partial live subscription remains.
    async fn start_upstream(
        &self,
        key: &str,
        symbol: &str,
        interval: &str,
        state: &Arc<SymbolState>,
    ) -> Result<Vec<Box<dyn Subscription>>, ProviderError> {
        let mut tokens: Vec<Box<dyn Subscription>> = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            let dispatch_state = state.clone();
            let dispatch: CandleCallback =
                Arc::new(move |candle| dispatch_state.handle_candle(candle));

            match provider.subscribe(symbol, interval, dispatch).await {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    warn!(
                        "exchange subscribe failed [{}] on {}: {} - rolling back",
                        key,
                        provider.name(),
                        e
                    );
                    for token in &tokens {
                        token.cancel();
                    }
                    return Err(e);
                }
            }
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(exchange: &str, open_time: i64, volume: &str, is_closed: bool) -> Candle {
        Candle {
            exchange: exchange.to_string(),
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            open_time,
            open: "100".to_string(),
            high: "110".to_string(),
            low: "90".to_string(),
            close: "105".to_string(),
            volume: volume.to_string(),
            close_time: open_time + 59_999,
            is_closed,
        }
    }

    #[test]
    fn test_ring_trims_back_to_limit() {
        let state = SymbolState::new(1, 5);

        // Each closed candle for a new period finalizes immediately (N=1).
        for i in 0..11 {
            state.handle_candle(candle("binance", i * 60_000, "1", true));
        }

        let inner = state.inner.lock();
        // 11th insert crossed 2x5; trimmed back to exactly 5.
        assert_eq!(inner.history.len(), 5);
        // The most recent periods survive.
        assert_eq!(inner.history.last().unwrap().open_time, 10 * 60_000);
        assert_eq!(inner.history.first().unwrap().open_time, 6 * 60_000);
    }

    #[test]
    fn test_history_never_exceeds_twice_limit() {
        let state = SymbolState::new(1, 3);
        for i in 0..50 {
            state.handle_candle(candle("binance", i * 60_000, "1", true));
            assert!(state.inner.lock().history.len() <= 6);
        }
    }

    #[test]
    fn test_late_arrival_dropped() {
        let state = SymbolState::new(2, 10);

        state.handle_candle(candle("binance", 0, "1", true));
        state.handle_candle(candle("bybit", 0, "2", true));
        assert_eq!(state.inner.lock().history.len(), 1);
        assert_eq!(state.inner.lock().history[0].volume, "3");

        // Period 0 is finalized; a further update must change nothing.
        state.handle_candle(candle("binance", 0, "99", true));
        let inner = state.inner.lock();
        assert_eq!(inner.history.len(), 1);
        assert_eq!(inner.history[0].volume, "3");
        assert!(inner.pending.is_empty());
    }

    #[test]
    fn test_pending_and_finalized_disjoint() {
        let state = SymbolState::new(2, 10);

        state.handle_candle(candle("binance", 0, "1", true));
        state.handle_candle(candle("binance", 60_000, "1", false));

        let inner = state.inner.lock();
        assert!(inner.finalized.contains(&0));
        assert!(!inner.pending.contains_key(&0));
        assert!(inner.pending.contains_key(&60_000));
        assert!(!inner.finalized.contains(&60_000));
    }
}
