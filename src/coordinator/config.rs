//! Coordinator configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Expected heartbeat cadence of agents; liveness allows 3 missed beats.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Cadence of the rate-allocation dispatch; defaults to the heartbeat.
    #[serde(default = "default_heartbeat_ms")]
    pub allocation_ms: u64,

    /// Synchronous ask timeout (`varys.framework.ask.wait`).
    #[serde(default = "default_ask_wait_ms")]
    pub ask_wait_ms: u64,

    /// Mailbox depth of the coordinator task.
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_heartbeat_ms() -> u64 {
    1_000
}

fn default_ask_wait_ms() -> u64 {
    5_000
}

fn default_channel_buffer() -> usize {
    1_024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            allocation_ms: default_heartbeat_ms(),
            ask_wait_ms: default_ask_wait_ms(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn allocation_interval(&self) -> Duration {
        Duration::from_millis(self.allocation_ms)
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.allocation_interval(), config.heartbeat_interval());
        assert_eq!(config.ask_timeout(), Duration::from_secs(5));
    }
}
