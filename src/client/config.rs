//! Client library configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Coordinator address, `varys://host:port`.
    pub master_url: String,

    /// Application-chosen display name.
    pub name: String,

    /// Host this client runs on; must match its local agent's host.
    pub host: String,

    /// Port of the in-process data server; 0 picks an ephemeral port.
    #[serde(default)]
    pub data_port: u16,

    /// Synchronous ask timeout (`varys.framework.ask.wait`).
    #[serde(default = "default_ask_wait_ms")]
    pub ask_wait_ms: u64,

    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_ask_wait_ms() -> u64 {
    5_000
}

fn default_channel_buffer() -> usize {
    256
}

impl ClientConfig {
    pub fn new(master_url: impl Into<String>, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            master_url: master_url.into(),
            name: name.into(),
            host: host.into(),
            data_port: 0,
            ask_wait_ms: default_ask_wait_ms(),
            channel_buffer: default_channel_buffer(),
        }
    }

    /// Applies `VARYS_ASK_WAIT_MS`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(ms) = std::env::var("VARYS_ASK_WAIT_MS") {
            match ms.parse() {
                Ok(ms) => self.ask_wait_ms = ms,
                Err(_) => warn!(value = %ms, "ignoring unparsable VARYS_ASK_WAIT_MS"),
            }
        }
        self
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
        let config = ClientConfig::new("varys://master:1606", "app", "h1");
        assert_eq!(config.data_port, 0);
        assert_eq!(config.ask_timeout(), Duration::from_secs(5));
    }
}
