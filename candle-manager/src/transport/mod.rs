//! Streaming distribution of aggregated candles
//!
//! The transport is deliberately dumb: it is just another downstream
//! handler. The aggregation engine never blocks on a remote client - a
//! bounded broadcast buffer sits between the producer and each connection,
//! and clients that fall behind lose the oldest updates (logged, never
//! propagated upstream).

mod websocket;

use thiserror::Error;

pub use websocket::CandleStreamServer;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server is not running")]
    NotRunning,
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Listen address, e.g. "0.0.0.0:9000"
    pub bind: String,
    /// Broadcast buffer capacity per server; lagging clients drop the
    /// oldest entries beyond this
    pub buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9000".to_string(),
            buffer: 1024,
        }
    }
}
