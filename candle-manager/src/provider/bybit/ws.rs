//! Bybit V5 public kline WebSocket stream

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::provider::{Backoff, CandleCallback, ProviderError, ProviderResult, SessionEnd};

use super::types::parse_ws_message;

/// Bybit closes idle connections; an app-level ping every 20s keeps them open.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Drive the kline stream for one symbol/interval until shutdown,
/// reconnecting with exponential backoff on error.
pub(super) async fn run_kline_stream(
    ws_url: String,
    symbol: String,
    interval_canonical: String,
    wire_interval: String,
    handler: CandleCallback,
    mut shutdown: broadcast::Receiver<()>,
) {
    let topic = format!("kline.{}.{}", wire_interval, symbol);
    let mut backoff = Backoff::new();

    loop {
        if shutdown.try_recv().is_ok() {
            return;
        }

        match run_session(&ws_url, &topic, &symbol, &interval_canonical, &handler, &mut shutdown)
            .await
        {
            Ok(SessionEnd::Shutdown) => return,
            Ok(SessionEnd::Disconnected) => {
                backoff.reset();
            }
            Err(e) => {
                let delay = backoff.next();
                warn!(
                    "bybit ws [{}/{}]: {} - reconnecting in {:?}",
                    symbol, interval_canonical, e, delay
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
    topic: &str,
    symbol: &str,
    interval_canonical: &str,
    handler: &CandleCallback,
    shutdown: &mut broadcast::Receiver<()>,
) -> ProviderResult<SessionEnd> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| ProviderError::Connection(format!("dial: {}", e)))?;

    debug!("bybit ws connected: {}", url);
    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({ "op": "subscribe", "args": [topic] });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| ProviderError::Subscription(format!("subscribe: {}", e)))?;

    let mut heartbeat = interval(PING_INTERVAL);
    // The first tick fires immediately; skip it so pings start after one period.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match parse_ws_message(symbol, interval_canonical, &text) {
                            Ok(candles) => {
                                for candle in candles {
                                    handler(candle);
                                }
                            }
                            Err(e) => warn!("bybit ws: parse error: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|e| ProviderError::Connection(format!("pong: {}", e)))?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("bybit ws closed by server");
                        return Ok(SessionEnd::Disconnected);
                    }
                    Some(Err(e)) => {
                        return Err(ProviderError::Connection(format!("read: {}", e)));
                    }
                    None => {
                        info!("bybit ws stream ended");
                        return Ok(SessionEnd::Disconnected);
                    }
                    _ => continue,
                }
            }
            _ = heartbeat.tick() => {
                write
                    .send(Message::Text(json!({"op": "ping"}).to_string()))
                    .await
                    .map_err(|e| ProviderError::Connection(format!("ping: {}", e)))?;
            }
            _ = shutdown.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}
