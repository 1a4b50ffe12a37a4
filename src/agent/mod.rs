//! Per-host agent: data service, NIC sampling, heartbeat, control relay

pub mod config;
pub mod core;
pub mod nic;

pub use config::AgentConfig;
pub use core::{Agent, AgentHandle, AgentState, RunningAgent};
pub use nic::NicSampler;
