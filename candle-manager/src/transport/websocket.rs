//! WebSocket fan-out server

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use candle_common::Candle;

use crate::provider::CandleCallback;

use super::{TransportConfig, TransportError};

/// WebSocket server that broadcasts aggregated candles to every connected
/// client as JSON text frames.
pub struct CandleStreamServer {
    config: TransportConfig,
    tx: broadcast::Sender<Candle>,
    running: Arc<AtomicBool>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
    sent_count: Arc<AtomicU64>,
    client_count: Arc<AtomicU64>,
}

impl CandleStreamServer {
    /// Create a new server; call [`start`](Self::start) to begin listening.
    pub fn new(config: TransportConfig) -> Self {
        let (tx, _) = broadcast::channel(config.buffer.max(1));

        Self {
            config,
            tx,
            running: Arc::new(AtomicBool::new(false)),
            server_handle: None,
            sent_count: Arc::new(AtomicU64::new(0)),
            client_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind the listener and start accepting clients.
    pub async fn start(&mut self) -> Result<(), TransportError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind)
            .await
            .map_err(|e| TransportError::Bind(format!("{}: {}", self.config.bind, e)))?;

        info!("candle stream listening on {}", self.config.bind);
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let tx = self.tx.clone();
        let client_count = self.client_count.clone();

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                // Accept with timeout so the shutdown flag is observed.
                match timeout(Duration::from_millis(200), listener.accept()).await {
                    Ok(Ok((stream, peer_addr))) => {
                        debug!("stream client connected: {}", peer_addr);
                        let rx = tx.subscribe();
                        let running = running.clone();
                        let client_count = client_count.clone();

                        tokio::spawn(async move {
                            client_count.fetch_add(1, Ordering::SeqCst);
                            if let Err(e) = handle_client(stream, rx, running).await {
                                debug!("stream client {} disconnected: {}", peer_addr, e);
                            }
                            client_count.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Ok(Err(e)) => warn!("failed to accept stream client: {}", e),
                    Err(_) => continue,
                }
            }
            info!("candle stream server stopped");
        });

        self.server_handle = Some(handle);
        Ok(())
    }

    /// Stop accepting clients and drop existing connections.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.server_handle.take() {
            let _ = timeout(Duration::from_secs(5), handle).await;
        }
    }

    /// Publish one candle to every connected client.
    pub fn publish(&self, candle: Candle) {
        // A send error only means nobody is connected right now.
        if self.tx.send(candle).is_ok() {
            self.sent_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A downstream handler that feeds this server; hand it to
    /// `CandleAggregator::subscribe`.
    pub fn handler(&self) -> CandleCallback {
        let tx = self.tx.clone();
        let sent_count = self.sent_count.clone();
        Arc::new(move |candle| {
            if tx.send(candle).is_ok() {
                sent_count.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    /// Candles published so far (to at least one client).
    pub fn sent_count(&self) -> u64 {
        self.sent_count.load(Ordering::SeqCst)
    }

    /// Currently connected clients.
    pub fn client_count(&self) -> u64 {
        self.client_count.load(Ordering::SeqCst)
    }
}

/// Forward broadcast candles to one client until it disconnects or the
/// server stops. A lagging client loses the oldest buffered candles; the
/// drop is logged and streaming resumes from the current position.
async fn handle_client(
    stream: TcpStream,
    mut rx: broadcast::Receiver<Candle>,
    running: Arc<AtomicBool>,
) -> Result<(), String> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| format!("handshake failed: {}", e))?;

    let (mut write, mut read) = ws_stream.split();

    // Drain incoming frames so protocol closes are noticed.
    let reader = tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    let result = loop {
        if !running.load(Ordering::SeqCst) {
            let _ = write.send(Message::Close(None)).await;
            break Ok(());
        }

        match timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Ok(candle)) => {
                let json = match serde_json::to_string(&candle) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("candle serialization failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    break Err(format!("send: {}", e));
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                // Bounded buffer overflowed for this client; drop and move on.
                warn!("slow stream client dropped {} candles", n);
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break Ok(()),
            Err(_) => continue,
        }
    };

    reader.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    fn candle(open_time: i64) -> Candle {
        Candle {
            exchange: "aggregated".to_string(),
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            open_time,
            open: "100".to_string(),
            high: "110".to_string(),
            low: "90".to_string(),
            close: "105".to_string(),
            volume: "12.5".to_string(),
            close_time: open_time + 59_999,
            is_closed: false,
        }
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let mut server = CandleStreamServer::new(TransportConfig {
            bind: "127.0.0.1:19800".to_string(),
            buffer: 16,
        });

        server.start().await.unwrap();
        assert!(server.running.load(Ordering::SeqCst));

        server.stop().await;
        assert!(!server.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_client_receives_published_candles() {
        let mut server = CandleStreamServer::new(TransportConfig {
            bind: "127.0.0.1:19801".to_string(),
            buffer: 16,
        });
        server.start().await.unwrap();

        let (ws, _) = connect_async("ws://127.0.0.1:19801")
            .await
            .expect("client connect");
        let (_, mut read) = ws.split();

        // Give the accept loop a beat to register the subscriber.
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.publish(candle(60_000));
        server.publish(candle(120_000));

        let mut received = Vec::new();
        while received.len() < 2 {
            match timeout(Duration::from_secs(2), read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    received.push(serde_json::from_str::<Candle>(&text).unwrap());
                }
                Ok(Some(Ok(_))) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        assert_eq!(received[0].open_time, 60_000);
        assert_eq!(received[1].open_time, 120_000);
        assert_eq!(server.sent_count(), 2);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_publish_without_clients_is_silent() {
        let server = CandleStreamServer::new(TransportConfig {
            bind: "127.0.0.1:19802".to_string(),
            buffer: 16,
        });

        // Not started, no clients: publishing must not panic or count.
        server.publish(candle(60_000));
        assert_eq!(server.sent_count(), 0);
    }
}
