//! Gateway runtime configuration.
//!
//! Config file parsing is out of scope for the gateway; everything is a
//! default with an optional `DUPLEX_*` environment override.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address for the HTTP/WebSocket server.
    pub bind_addr: String,
    /// Capacity of each per-connection input and output queue.
    pub queue_capacity: usize,
    /// Cadence of the stale sweeps (connections, subscriptions, sessions).
    pub sweep_interval: Duration,
    /// Connections and bus subscriptions idle beyond this are evicted.
    pub idle_timeout: Duration,
    /// Sessions idle beyond this many hours are evicted.
    pub session_ttl_hours: i64,
    /// Deadline for the configuration handshake.
    pub config_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".into(),
            queue_capacity: 100,
            sweep_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(3600),
            session_ttl_hours: 24,
            config_timeout: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("DUPLEX_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(capacity) = env_parse("DUPLEX_QUEUE_CAPACITY") {
            config.queue_capacity = capacity;
        }
        if let Some(secs) = env_parse("DUPLEX_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("DUPLEX_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(hours) = env_parse("DUPLEX_SESSION_TTL_HOURS") {
            config.session_ttl_hours = hours;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
