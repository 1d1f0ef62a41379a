use crate::dispatch::redis::TransportOptions;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// `host:port` of the cache service.
    pub cache_address: String,
    pub publisher_pool_size: usize,
    pub push_workers: usize,
    pub push_queue_size: usize,
    pub outbound_queue_size: usize,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    /// Zero disables pings on the subscribe connection.
    pub ping_interval_ms: u64,
    pub fallback_delay_ms: u64,
    /// Wait between the wake push and the standard push; half of the fallback
    /// delay when unset.
    pub fallback_standard_delay_ms: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cache_address: "127.0.0.1:6379".to_string(),
            publisher_pool_size: 8,
            push_workers: 50,
            push_queue_size: 1000,
            outbound_queue_size: 256,
            reconnect_initial_backoff_ms: 100,
            reconnect_max_backoff_ms: 30_000,
            ping_interval_ms: 30_000,
            fallback_delay_ms: 30_000,
            fallback_standard_delay_ms: None,
        }
    }
}

impl DispatchConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }

    pub fn fallback_standard_delay(&self) -> Option<Duration> {
        self.fallback_standard_delay_ms.map(Duration::from_millis)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            publisher_pool_size: self.publisher_pool_size,
            reconnect_initial: Duration::from_millis(self.reconnect_initial_backoff_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_backoff_ms),
            ping_interval: (self.ping_interval_ms > 0)
                .then(|| Duration::from_millis(self.ping_interval_ms)),
        }
    }
}
