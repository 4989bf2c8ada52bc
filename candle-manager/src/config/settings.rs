//! Application settings
//!
//! Layered from an optional TOML file plus `CANDLES_`-prefixed environment
//! variables (double underscore as section separator, e.g.
//! `CANDLES_TRANSPORT__BIND=0.0.0.0:9100`).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Aggregation engine settings
    #[serde(default)]
    pub aggregator: AggregatorSettings,
    /// Exchange provider settings
    #[serde(default)]
    pub providers: ProviderSettings,
    /// Streaming transport settings
    #[serde(default)]
    pub transport: TransportSettings,
}

/// Aggregation engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSettings {
    /// Cap on retained finalized candles per key; the buffer trims back to
    /// this once it doubles
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

/// Exchange provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Exchanges to aggregate across, in subscription order
    #[serde(default = "default_enabled_providers")]
    pub enabled: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled_providers(),
        }
    }
}

/// Streaming transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// WebSocket listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Broadcast buffer capacity; lagging clients drop beyond this
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            buffer: default_buffer(),
        }
    }
}

fn default_history_limit() -> usize {
    365
}

fn default_enabled_providers() -> Vec<String> {
    vec![
        "binance".to_string(),
        "bybit".to_string(),
        "okx".to_string(),
    ]
}

fn default_bind() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_buffer() -> usize {
    1024
}

impl Settings {
    /// Load settings from an optional file path and the environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }

        builder
            .add_source(Environment::with_prefix("CANDLES").separator("__"))
            .build()?
            .try_deserialize()
    }
}
