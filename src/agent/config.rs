//! Host agent configuration
//!
//! Ports and the work directory honor the `VARYS_*` environment, matching
//! how deployments wire agents without per-host config files. The data port
//! (`comm_port`) is a launcher decision, not a CLI flag.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Coordinator address, `varys://host:port`.
    pub master_url: String,

    /// Cluster-unique agent id; duplicates are rejected at registration.
    #[serde(default = "default_slave_id")]
    pub slave_id: String,

    /// Host this agent binds and is matched against client hosts.
    pub host: String,

    /// Control port for local clients; 0 picks an ephemeral port.
    #[serde(default)]
    pub port: u16,

    /// Data port served by the agent's data server; 0 picks one.
    #[serde(default)]
    pub comm_port: u16,

    #[serde(default = "default_web_ui_port")]
    pub web_ui_port: u16,

    /// Advertised host name, if different from `host`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub public_host: Option<String>,

    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Synchronous ask timeout (`varys.framework.ask.wait`).
    #[serde(default = "default_ask_wait_ms")]
    pub ask_wait_ms: u64,

    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_slave_id() -> String {
    format!("SLAVE-{}", Uuid::now_v7().simple())
}

fn default_web_ui_port() -> u16 {
    16016
}

fn default_work_dir() -> PathBuf {
    match std::env::var_os("VARYS_HOME") {
        Some(home) => PathBuf::from(home).join("work"),
        None => PathBuf::from("work"),
    }
}

fn default_heartbeat_ms() -> u64 {
    1_000
}

fn default_ask_wait_ms() -> u64 {
    5_000
}

fn default_channel_buffer() -> usize {
    256
}

fn env_port(name: &str) -> Option<u16> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            warn!(var = name, %value, "ignoring unparsable port override");
            None
        }
    }
}

impl AgentConfig {
    pub fn new(master_url: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            master_url: master_url.into(),
            slave_id: default_slave_id(),
            host: host.into(),
            port: 0,
            comm_port: 0,
            web_ui_port: default_web_ui_port(),
            public_host: None,
            work_dir: default_work_dir(),
            heartbeat_ms: default_heartbeat_ms(),
            ask_wait_ms: default_ask_wait_ms(),
            channel_buffer: default_channel_buffer(),
        }
    }

    /// Applies `VARYS_SLAVE_PORT`, `VARYS_SLAVE_WEBUI_PORT`,
    /// `VARYS_SLAVE_DIR`, `VARYS_PUBLIC_DNS` and `VARYS_ASK_WAIT_MS`.
    pub fn apply_env(mut self) -> Self {
        if let Some(port) = env_port("VARYS_SLAVE_PORT") {
            self.port = port;
        }
        if let Some(port) = env_port("VARYS_SLAVE_WEBUI_PORT") {
            self.web_ui_port = port;
        }
        if let Some(dir) = std::env::var_os("VARYS_SLAVE_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Ok(dns) = std::env::var("VARYS_PUBLIC_DNS") {
            self.public_host = Some(dns);
        }
        if let Ok(ms) = std::env::var("VARYS_ASK_WAIT_MS") {
            match ms.parse() {
                Ok(ms) => self.ask_wait_ms = ms,
                Err(_) => warn!(value = %ms, "ignoring unparsable VARYS_ASK_WAIT_MS"),
            }
        }
        self
    }

    pub fn public_host(&self) -> &str {
        self.public_host.as_deref().unwrap_or(&self.host)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_wait_ms)
    }
}
