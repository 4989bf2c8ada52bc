//! Binance kline WebSocket stream

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    RateLimiter,
};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::provider::{
    Backoff, CandleCallback, ProviderError, ProviderResult, SessionEnd, RATE_LIMIT_PAUSE,
};

use super::types::WsKlineMsg;

/// Drive the kline stream for one symbol/interval until shutdown.
///
/// Reconnects with exponential backoff on error; reconnect attempts are
/// additionally capped by `rate_limiter` to avoid hammering the endpoint
/// when it is rejecting us.
pub(super) async fn run_kline_stream(
    ws_url: String,
    symbol: String,
    interval: String,
    handler: CandleCallback,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let stream_url = format!("{}/{}@kline_{}", ws_url, symbol.to_lowercase(), interval);
    let mut backoff = Backoff::new();

    loop {
        if shutdown.try_recv().is_ok() {
            return;
        }

        if rate_limiter.check().is_err() {
            warn!(
                "binance ws [{}/{}]: reconnect rate limit hit",
                symbol, interval
            );
            tokio::select! {
                _ = sleep(RATE_LIMIT_PAUSE) => continue,
                _ = shutdown.recv() => return,
            }
        }

        match run_session(&stream_url, &handler, &mut shutdown).await {
            Ok(SessionEnd::Shutdown) => return,
            Ok(SessionEnd::Disconnected) => {
                backoff.reset();
            }
            Err(e) => {
                let delay = backoff.next();
                warn!(
                    "binance ws [{}/{}]: {} - reconnecting in {:?}",
                    symbol, interval, e, delay
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.recv() => return,
                }
            }
        }
    }
}

/// Maintain a single WebSocket session until shutdown, server close, or error.
async fn run_session(
    url: &str,
    handler: &CandleCallback,
    shutdown: &mut broadcast::Receiver<()>,
) -> ProviderResult<SessionEnd> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| ProviderError::Connection(format!("dial: {}", e)))?;

    debug!("binance ws connected: {}", url);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsKlineMsg>(&text) {
                            Ok(m) if m.event_type == "kline" => handler(m.into_candle()),
                            Ok(m) => debug!("binance ws: ignoring event type {}", m.event_type),
                            Err(e) => warn!("binance ws: parse error: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|e| ProviderError::Connection(format!("pong: {}", e)))?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("binance ws closed by server");
                        return Ok(SessionEnd::Disconnected);
                    }
                    Some(Err(e)) => {
                        return Err(ProviderError::Connection(format!("read: {}", e)));
                    }
                    None => {
                        info!("binance ws stream ended");
                        return Ok(SessionEnd::Disconnected);
                    }
                    _ => continue,
                }
            }
            _ = shutdown.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}
