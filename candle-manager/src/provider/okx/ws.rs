//! OKX V5 public candle WebSocket stream

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::provider::{Backoff, CandleCallback, ProviderError, ProviderResult, SessionEnd};

use super::types::parse_rows;

/// OKX drops connections idle for 30s; ping under that.
const PING_INTERVAL: Duration = Duration::from_secs(25);

/// Generic OKX WebSocket message envelope.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct WsMessage {
    /// "subscribe" ack or "error"
    event: String,
    code: String,
    msg: String,
    data: Vec<Vec<String>>,
}

/// Drive the candle stream for one instrument/bar until shutdown,
/// reconnecting with exponential backoff on error.
#[allow(clippy::too_many_arguments)]
pub(super) async fn run_candle_stream(
    ws_url: String,
    inst_id: String,
    symbol: String,
    interval_canonical: String,
    bar: String,
    interval_ms: i64,
    handler: CandleCallback,
    mut shutdown: broadcast::Receiver<()>,
) {
    // OKX channel name: "candle" + bar (e.g. "candle1m", "candle4H").
    let channel = format!("candle{}", bar);
    let mut backoff = Backoff::new();

    loop {
        if shutdown.try_recv().is_ok() {
            return;
        }

        let session = run_session(
            &ws_url,
            &channel,
            &inst_id,
            &symbol,
            &interval_canonical,
            interval_ms,
            &handler,
            &mut shutdown,
        )
        .await;

        match session {
            Ok(SessionEnd::Shutdown) => return,
            Ok(SessionEnd::Disconnected) => {
                backoff.reset();
            }
            Err(e) => {
                let delay = backoff.next();
                warn!(
                    "okx ws [{}/{}]: {} - reconnecting in {:?}",
                    inst_id, bar, e, delay
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
#[allow(clippy::too_many_arguments)]
async fn run_session(
    url: &str,
    channel: &str,
    inst_id: &str,
    symbol: &str,
    interval_canonical: &str,
    interval_ms: i64,
    handler: &CandleCallback,
    shutdown: &mut broadcast::Receiver<()>,
) -> ProviderResult<SessionEnd> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| ProviderError::Connection(format!("dial: {}", e)))?;

    debug!("okx ws connected: {}", url);
    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({
        "op": "subscribe",
        "args": [{ "channel": channel, "instId": inst_id }],
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| ProviderError::Subscription(format!("subscribe: {}", e)))?;

    let mut heartbeat = interval(PING_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // OKX heartbeats are plain text frames, not protocol pings.
                        if text == "ping" {
                            write
                                .send(Message::Text("pong".to_string()))
                                .await
                                .map_err(|e| ProviderError::Connection(format!("pong: {}", e)))?;
                            continue;
                        }
                        if text == "pong" {
                            continue;
                        }

                        match parse_message(symbol, interval_canonical, interval_ms, &text) {
                            Ok(candles) => {
                                for candle in candles {
                                    handler(candle);
                                }
                            }
                            Err(e) => warn!("okx ws: parse error: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("okx ws closed by server");
                        return Ok(SessionEnd::Disconnected);
                    }
                    Some(Err(e)) => {
                        return Err(ProviderError::Connection(format!("read: {}", e)));
                    }
                    None => {
                        info!("okx ws stream ended");
                        return Ok(SessionEnd::Disconnected);
                    }
                    _ => continue,
                }
            }
            _ = heartbeat.tick() => {
                write
                    .send(Message::Text("ping".to_string()))
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

/// Parse one data frame into candles. Acks yield an empty list; an error
/// event becomes a [`ProviderError::Api`].
fn parse_message(
    symbol: &str,
    interval_canonical: &str,
    interval_ms: i64,
    text: &str,
) -> ProviderResult<Vec<candle_common::Candle>> {
    let envelope: WsMessage = serde_json::from_str(text)
        .map_err(|e| ProviderError::Parse(format!("envelope: {}", e)))?;

    if !envelope.event.is_empty() {
        if envelope.event == "error" {
            return Err(ProviderError::Api(format!(
                "okx ws error {}: {}",
                envelope.code, envelope.msg
            )));
        }
        // Subscription ack.
        return Ok(Vec::new());
    }

    if envelope.data.is_empty() {
        return Ok(Vec::new());
    }

    parse_rows(symbol, interval_canonical, interval_ms, &envelope.data)
}
