//! Configuration for the bridge HTTP server.

use bsv_auth_node::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::event::EventLogger;

/// Configuration for the bridge HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeHttpConfig {
    /// The host address to bind to.
    pub host: String,

    /// The port to bind to. Zero picks a free port.
    pub port: u16,

    /// Largest accepted request body in bytes.
    pub max_body_bytes: u64,

    /// Seconds between sweeps of expired bridge state.
    pub sweep_interval_secs: u64,

    /// Log bridge events through the event logger.
    pub event_logging: bool,

    /// Write each logged event as one JSON document instead of plain fields.
    pub structured_events: bool,

    /// Settings of the bridge itself.
    pub bridge: BridgeConfig,
}

impl Default for BridgeHttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_body_bytes: 1024 * 1024,
            sweep_interval_secs: 10,
            event_logging: true,
            structured_events: false,
            bridge: BridgeConfig::default(),
        }
    }
}

impl BridgeHttpConfig {
    /// Returns the full server address as a string (e.g., "127.0.0.1:8000").
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// The event logger to run, if event logging is on.
    pub fn event_logger(&self) -> Option<EventLogger> {
        self.event_logging
            .then(|| EventLogger::new(self.structured_events))
    }
}
