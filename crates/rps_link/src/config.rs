//! Link configuration with protocol defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rps_proto::codec::DEFAULT_MAX_RECORD_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LinkConfig {
    /// Maximum record size in bytes. Values below the 256 KiB floor are
    /// clamped at use sites.
    pub max_record_size: usize,
    /// Idle interval before a keepalive ping is sent.
    pub keepalive_secs: u64,
    /// Missed intervals (no frame at all) before the channel counts as broken.
    pub keepalive_misses: u32,
    pub handshake_timeout_secs: u64,
    /// Reconnect backoff: initial delay, doubling up to the cap.
    pub backoff_initial_secs: u64,
    pub backoff_cap_secs: u64,
    /// Total outage budget before a suspended session is disposed.
    pub reconnect_ceiling_secs: u64,
    /// Default per-command timeout.
    pub command_timeout_secs: u64,
    /// Per-command-family overrides, keyed by command tag.
    pub command_timeouts: HashMap<String, u64>,
    /// Wall-clock pairing deadline from OOB token generation.
    pub pairing_deadline_secs: u64,
    /// Events buffered (drop-oldest) while a session is suspended.
    pub event_buffer_capacity: usize,
    /// Satellite commands queued (FIFO) while the channel is down.
    pub command_queue_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            keepalive_secs: 20,
            keepalive_misses: 3,
            handshake_timeout_secs: 10,
            backoff_initial_secs: 1,
            backoff_cap_secs: 30,
            reconnect_ceiling_secs: 600,
            command_timeout_secs: 30,
            command_timeouts: HashMap::new(),
            pairing_deadline_secs: 600,
            event_buffer_capacity: 512,
            command_queue_capacity: 64,
        }
    }
}

impl LinkConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Silence longer than this marks the channel broken.
    pub fn broken_after(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs * u64::from(self.keepalive_misses))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn reconnect_ceiling(&self) -> Duration {
        Duration::from_secs(self.reconnect_ceiling_secs)
    }

    pub fn pairing_deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pairing_deadline_secs as i64)
    }

    /// Timeout for one command, honouring per-family overrides.
    pub fn command_timeout(&self, tag: &str) -> Duration {
        let secs = self
            .command_timeouts
            .get(tag)
            .copied()
            .unwrap_or(self.command_timeout_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.keepalive(), Duration::from_secs(20));
        assert_eq!(cfg.broken_after(), Duration::from_secs(60));
        assert_eq!(cfg.backoff_cap(), Duration::from_secs(30));
        assert_eq!(cfg.command_queue_capacity, 64);
    }

    #[test]
    fn per_family_timeout_overrides_default() {
        let mut cfg = LinkConfig::default();
        cfg.command_timeouts.insert("apiSendFile".into(), 120);
        assert_eq!(cfg.command_timeout("apiSendFile"), Duration::from_secs(120));
        assert_eq!(cfg.command_timeout("apiSendMessage"), Duration::from_secs(30));
    }

    #[test]
    fn deserializes_partial_config() {
        let cfg: LinkConfig = serde_json::from_str(r#"{"keepalive_secs": 5}"#).unwrap();
        assert_eq!(cfg.keepalive_secs, 5);
        assert_eq!(cfg.command_timeout_secs, 30);
    }
}
