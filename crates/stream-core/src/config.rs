//! Tunables for the stream, with production defaults.
//!
//! Loaded from the `[stream]` table of a TOML config file; every field is
//! optional and falls back to its default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Durable events retained per session for replay.
    pub session_ring_capacity: usize,
    /// Durable events retained across all sessions of the owner.
    pub owner_ring_capacity: usize,
    /// Session logs kept before idle ones (unsubscribed, not busy) are evicted.
    pub max_session_logs: usize,
    pub turn_cache_capacity: usize,
    pub turn_ttl_secs: u64,
    pub ping_interval_secs: u64,
    pub client_max_missed_pongs: u32,
    pub server_max_missed_pongs: u32,
    /// Silence during an active turn before the client sends a state probe.
    pub silence_probe_secs: u64,
    /// Further silence after the probe before a forced session reconnect.
    pub silence_reconnect_secs: u64,
    pub coalesce_interval_ms: u64,
    pub coalesce_max_events: usize,
    pub coalesce_max_bytes: usize,
    /// Outbound queue depth above which ephemeral frames are dropped.
    pub ephemeral_drop_threshold: usize,
    pub subscribe_timeout_secs: u64,
    pub transport_backoff: BackoffPolicy,
    pub session_backoff: BackoffPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            session_ring_capacity: 500,
            owner_ring_capacity: 2000,
            max_session_logs: 128,
            turn_cache_capacity: 256,
            turn_ttl_secs: 15 * 60,
            ping_interval_secs: 30,
            client_max_missed_pongs: 2,
            server_max_missed_pongs: 1,
            silence_probe_secs: 15,
            silence_reconnect_secs: 30,
            coalesce_interval_ms: 33,
            coalesce_max_events: 256,
            coalesce_max_bytes: 64 * 1024,
            ephemeral_drop_threshold: 256,
            subscribe_timeout_secs: 10,
            transport_backoff: BackoffPolicy::transport(),
            session_backoff: BackoffPolicy::session(),
        }
    }
}

impl StreamConfig {
    pub fn turn_ttl(&self) -> Duration {
        Duration::from_secs(self.turn_ttl_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn silence_probe_after(&self) -> Duration {
        Duration::from_secs(self.silence_probe_secs)
    }

    pub fn silence_reconnect_after(&self) -> Duration {
        Duration::from_secs(self.silence_reconnect_secs)
    }

    pub fn coalesce_interval(&self) -> Duration {
        Duration::from_millis(self.coalesce_interval_ms.max(1))
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct File {
        #[serde(default)]
        stream: StreamConfig,
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let file: File = toml::from_str(
            r#"
            [stream]
            session_ring_capacity = 64
            ping_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(file.stream.session_ring_capacity, 64);
        assert_eq!(file.stream.ping_interval(), Duration::from_secs(5));
        assert_eq!(file.stream.owner_ring_capacity, 2000);
        assert_eq!(file.stream.transport_backoff, BackoffPolicy::transport());
    }

    #[test]
    fn missing_table_is_all_defaults() {
        let file: File = toml::from_str("").unwrap();
        assert_eq!(file.stream, StreamConfig::default());
        assert_eq!(file.stream.turn_ttl(), Duration::from_secs(900));
    }
}
