//! The coordinator's catalog: agents, clients, coflows and flows.
//!
//! All mutation happens on the coordinator task; the catalog itself is plain
//! synchronous state. Structural choices enforce the referential invariants:
//! flows live inside their coflow (a flow cannot outlive it), and removal
//! cascades client → coflows → flows and agent → clients → coflows.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{AgentRecord, ClientRecord, CoflowDescription, CoflowState, FlowDescription};
use crate::proto::messages::{RegisterSlave, SlaveStateEntry};

/// One flow plus its receiver bookkeeping.
///
/// `receivers` is the historical fan-out count driving the FINISHED
/// transition and never shrinks; `active` holds only clients with a get in
/// progress and is what rate dispatch targets.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub desc: FlowDescription,
    pub receivers: std::collections::HashSet<String>,
    pub active: std::collections::HashSet<String>,
}

/// Coordinator-internal view of one coflow.
#[derive(Debug, Clone)]
pub struct CoflowInfo {
    pub coflow_id: String,
    pub owner_client_id: String,
    pub desc: CoflowDescription,
    pub state: CoflowState,
    pub flows: HashMap<String, FlowRecord>,
}

/// A point-in-time copy handed to the rate policy.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub agents: Vec<AgentSnapshot>,
    pub flows: Vec<FlowSnapshot>,
}

#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub slave_id: String,
    pub host: String,
    pub rx_bps: f64,
    pub tx_bps: f64,
}

#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub desc: FlowDescription,
    pub owner_client_id: String,
    pub coflow_state: CoflowState,
    pub coflow_priority: i32,
    /// Every client that has ever fetched this flow (fan-out accounting).
    pub receivers: Vec<String>,
    /// Clients with a get in progress right now; rate dispatch targets
    /// exactly these.
    pub active: Vec<String>,
}

/// Serializable state digest for the inspection handle and the launcher log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub agents: Vec<SlaveStateEntry>,
    pub clients: Vec<ClientSummary>,
    pub coflows: Vec<CoflowSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSummary {
    pub client_id: String,
    pub name: String,
    pub host: String,
    pub slave_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoflowSummary {
    pub coflow_id: String,
    pub owner_client_id: String,
    pub state: CoflowState,
    pub flows: Vec<FlowSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub size_in_bytes: u64,
    pub num_receivers: u32,
    pub receiver_count: u32,
    pub active_count: u32,
}

impl CatalogSummary {
    pub fn coflow(&self, coflow_id: &str) -> Option<&CoflowSummary> {
        self.coflows.iter().find(|c| c.coflow_id == coflow_id)
    }
}

#[derive(Debug)]
pub struct Catalog {
    heartbeat_interval: Duration,
    agents: HashMap<String, AgentRecord>,
    clients: HashMap<String, ClientRecord>,
    coflows: HashMap<String, CoflowInfo>,
    next_client: u64,
    next_coflow: u64,
}

impl Catalog {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            agents: HashMap::new(),
            clients: HashMap::new(),
            coflows: HashMap::new(),
            next_client: 0,
            next_coflow: 0,
        }
    }

    fn is_live(&self, agent: &AgentRecord, now: Instant) -> bool {
        now.saturating_duration_since(agent.last_heartbeat_at) <= 3 * self.heartbeat_interval
    }

    pub fn agent(&self, slave_id: &str) -> Option<&AgentRecord> {
        self.agents.get(slave_id)
    }

    pub fn client(&self, client_id: &str) -> Option<&ClientRecord> {
        self.clients.get(client_id)
    }

    pub fn coflow(&self, coflow_id: &str) -> Option<&CoflowInfo> {
        self.coflows.get(coflow_id)
    }

    // ---- membership ----

    pub fn register_slave(&mut self, req: &RegisterSlave, now: Instant) -> Result<(), String> {
        if self.agents.contains_key(&req.slave_id) {
            return Err(format!("duplicate slave id {}", req.slave_id));
        }
        if self
            .agents
            .values()
            .any(|a| a.host == req.host && a.port == req.port)
        {
            return Err(format!("{}:{} already registered", req.host, req.port));
        }
        info!(slave_id = %req.slave_id, host = %req.host, port = req.port, "slave registered");
        self.agents.insert(
            req.slave_id.clone(),
            AgentRecord {
                slave_id: req.slave_id.clone(),
                host: req.host.clone(),
                port: req.port,
                web_ui_port: req.web_ui_port,
                comm_port: req.comm_port,
                public_host: req.public_host.clone(),
                last_rx_bps: 0.0,
                last_tx_bps: 0.0,
                last_heartbeat_at: now,
            },
        );
        Ok(())
    }

    /// Binds the client to the agent on its host; smallest slave id wins if
    /// a host somehow runs several agents.
    pub fn register_client(&mut self, name: &str, host: &str, comm_port: u16) -> Result<ClientRecord, String> {
        let slave_id = self
            .agents
            .values()
            .filter(|a| a.host == host)
            .map(|a| a.slave_id.clone())
            .min()
            .ok_or_else(|| format!("no slave registered on host {host}"))?;

        self.next_client += 1;
        let record = ClientRecord {
            client_id: format!("CLIENT-{:06}", self.next_client),
            name: name.to_string(),
            host: host.to_string(),
            comm_port,
            slave_id,
        };
        info!(client_id = %record.client_id, name, host, slave_id = %record.slave_id, "client registered");
        self.clients.insert(record.client_id.clone(), record.clone());
        Ok(record)
    }

    /// Heartbeat clock is monotone: a reordered stale tick never rewinds it.
    pub fn heartbeat(&mut self, slave_id: &str, rx_bps: f64, tx_bps: f64, now: Instant) -> bool {
        match self.agents.get_mut(slave_id) {
            Some(agent) => {
                agent.last_rx_bps = rx_bps;
                agent.last_tx_bps = tx_bps;
                if now > agent.last_heartbeat_at {
                    agent.last_heartbeat_at = now;
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_client(&mut self, client_id: &str) -> Vec<String> {
        if self.clients.remove(client_id).is_none() {
            return Vec::new();
        }
        let owned: Vec<String> = self
            .coflows
            .values()
            .filter(|c| c.owner_client_id == client_id)
            .map(|c| c.coflow_id.clone())
            .collect();
        for coflow_id in &owned {
            self.coflows.remove(coflow_id);
        }
        // A gone client cannot have a get in progress anywhere.
        for coflow in self.coflows.values_mut() {
            for flow in coflow.flows.values_mut() {
                flow.active.remove(client_id);
            }
        }
        info!(client_id, coflows = owned.len(), "client removed");
        owned
    }

    pub fn remove_agent(&mut self, slave_id: &str) -> Vec<String> {
        if self.agents.remove(slave_id).is_none() {
            return Vec::new();
        }
        let bound: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.slave_id == slave_id)
            .map(|c| c.client_id.clone())
            .collect();
        for client_id in &bound {
            self.remove_client(client_id);
        }
        info!(slave_id, clients = bound.len(), "slave removed");
        bound
    }

    /// Drop agents whose heartbeat went silent, cascading as usual.
    /// Returns `(removed slave ids, removed client ids)`.
    pub fn sweep_dead(&mut self, now: Instant) -> (Vec<String>, Vec<String>) {
        let dead: Vec<String> = self
            .agents
            .values()
            .filter(|a| !self.is_live(a, now))
            .map(|a| a.slave_id.clone())
            .collect();
        let mut clients = Vec::new();
        for slave_id in &dead {
            debug!(slave_id, "heartbeat expired");
            clients.extend(self.remove_agent(slave_id));
        }
        (dead, clients)
    }

    // ---- coflows and flows ----

    pub fn register_coflow(&mut self, client_id: &str, desc: CoflowDescription) -> Result<String, String> {
        if !self.clients.contains_key(client_id) {
            return Err(format!("unknown client {client_id}"));
        }
        self.next_coflow += 1;
        let coflow_id = format!("COFLOW-{:06}", self.next_coflow);
        info!(%coflow_id, owner = client_id, name = %desc.name, "coflow registered");
        self.coflows.insert(
            coflow_id.clone(),
            CoflowInfo {
                coflow_id: coflow_id.clone(),
                owner_client_id: client_id.to_string(),
                desc,
                state: CoflowState::Registered,
                flows: HashMap::new(),
            },
        );
        Ok(coflow_id)
    }

    /// Removes the coflow and all of its flows atomically.
    pub fn unregister_coflow(&mut self, coflow_id: &str) -> Option<CoflowInfo> {
        let removed = self.coflows.remove(coflow_id);
        if let Some(info) = &removed {
            info!(coflow_id, flows = info.flows.len(), "coflow unregistered");
        }
        removed
    }

    /// Idempotent on the data identifier: a re-announced flow is ignored.
    pub fn add_flow(&mut self, desc: FlowDescription) -> Result<bool, String> {
        let coflow = self
            .coflows
            .get_mut(&desc.data_id.coflow_id)
            .ok_or_else(|| format!("unknown coflow {}", desc.data_id.coflow_id))?;
        if coflow.flows.contains_key(&desc.data_id.flow_id) {
            return Ok(false);
        }
        debug!(data_id = %desc.data_id, size = desc.size_in_bytes, "flow added");
        if coflow.state == CoflowState::Registered {
            coflow.state = CoflowState::Running;
        }
        coflow.flows.insert(
            desc.data_id.flow_id.clone(),
            FlowRecord {
                desc,
                receivers: Default::default(),
                active: Default::default(),
            },
        );
        Ok(true)
    }

    /// Looks up a flow, counts the requesting client as a receiver (both
    /// historically and as an in-progress get), and finishes the coflow
    /// once every flow reached its expected fan-out.
    pub fn get_flow(&mut self, flow_id: &str, coflow_id: &str, client_id: &str) -> Option<FlowDescription> {
        let coflow = self.coflows.get_mut(coflow_id)?;
        let flow = coflow.flows.get_mut(flow_id)?;
        flow.receivers.insert(client_id.to_string());
        flow.active.insert(client_id.to_string());
        let desc = flow.desc.clone();

        if coflow.state != CoflowState::Finished
            && !coflow.flows.is_empty()
            && coflow
                .flows
                .values()
                .all(|f| f.receivers.len() as u32 >= f.desc.num_receivers)
        {
            info!(coflow_id, "coflow finished");
            coflow.state = CoflowState::Finished;
        }
        Some(desc)
    }

    /// Retires one client's in-progress get; the fan-out count keeps the
    /// client forever.
    pub fn end_get(&mut self, flow_id: &str, coflow_id: &str, client_id: &str) -> bool {
        match self
            .coflows
            .get_mut(coflow_id)
            .and_then(|c| c.flows.get_mut(flow_id))
        {
            Some(flow) => flow.active.remove(client_id),
            None => false,
        }
    }

    pub fn delete_flow(&mut self, flow_id: &str, coflow_id: &str) -> bool {
        match self.coflows.get_mut(coflow_id) {
            Some(coflow) => coflow.flows.remove(flow_id).is_some(),
            None => false,
        }
    }

    // ---- ranking ----

    fn ranked_hosts<F>(&self, count: usize, adjust_bytes: u64, now: Instant, measured: F) -> Vec<String>
    where
        F: Fn(&AgentRecord) -> f64,
    {
        let interval_secs = self.heartbeat_interval.as_secs_f64();
        let mut live: Vec<(&AgentRecord, f64)> = self
            .agents
            .values()
            .filter(|a| self.is_live(a, now))
            .map(|a| (a, measured(a) + adjust_bytes as f64 / interval_secs))
            .collect();
        live.sort_by(|(a, sa), (b, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.slave_id.cmp(&b.slave_id))
        });
        live.into_iter()
            .take(count)
            .map(|(a, _)| a.public_host.clone())
            .collect()
    }

    /// The `count` live agents with the least loaded ingress, ascending.
    pub fn best_rx_machines(&self, count: usize, adjust_bytes: u64, now: Instant) -> Vec<String> {
        self.ranked_hosts(count, adjust_bytes, now, |a| a.last_rx_bps)
    }

    /// Symmetric for egress.
    pub fn best_tx_machines(&self, count: usize, adjust_bytes: u64, now: Instant) -> Vec<String> {
        self.ranked_hosts(count, adjust_bytes, now, |a| a.last_tx_bps)
    }

    // ---- views ----

    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            agents: self
                .agents
                .values()
                .map(|a| AgentSnapshot {
                    slave_id: a.slave_id.clone(),
                    host: a.host.clone(),
                    rx_bps: a.last_rx_bps,
                    tx_bps: a.last_tx_bps,
                })
                .collect(),
            flows: self
                .coflows
                .values()
                .flat_map(|c| {
                    c.flows.values().map(|f| FlowSnapshot {
                        desc: f.desc.clone(),
                        owner_client_id: c.owner_client_id.clone(),
                        coflow_state: c.state,
                        coflow_priority: c.desc.priority,
                        receivers: f.receivers.iter().cloned().collect(),
                        active: f.active.iter().cloned().collect(),
                    })
                })
                .collect(),
        }
    }

    pub fn summary(&self, now: Instant) -> CatalogSummary {
        let mut agents: Vec<SlaveStateEntry> = self
            .agents
            .values()
            .map(|a| SlaveStateEntry {
                slave_id: a.slave_id.clone(),
                host: a.host.clone(),
                comm_port: a.comm_port,
                rx_bps: a.last_rx_bps,
                tx_bps: a.last_tx_bps,
                live: self.is_live(a, now),
            })
            .collect();
        agents.sort_by(|a, b| a.slave_id.cmp(&b.slave_id));

        let mut clients: Vec<ClientSummary> = self
            .clients
            .values()
            .map(|c| ClientSummary {
                client_id: c.client_id.clone(),
                name: c.name.clone(),
                host: c.host.clone(),
                slave_id: c.slave_id.clone(),
            })
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        let mut coflows: Vec<CoflowSummary> = self
            .coflows
            .values()
            .map(|c| {
                let mut flows: Vec<FlowSummary> = c
                    .flows
                    .values()
                    .map(|f| FlowSummary {
                        flow_id: f.desc.data_id.flow_id.clone(),
                        size_in_bytes: f.desc.size_in_bytes,
                        num_receivers: f.desc.num_receivers,
                        receiver_count: f.receivers.len() as u32,
                        active_count: f.active.len() as u32,
                    })
                    .collect();
                flows.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
                CoflowSummary {
                    coflow_id: c.coflow_id.clone(),
                    owner_client_id: c.owner_client_id.clone(),
                    state: c.state,
                    flows,
                }
            })
            .collect();
        coflows.sort_by(|a, b| a.coflow_id.cmp(&b.coflow_id));

        CatalogSummary {
            agents,
            clients,
            coflows,
        }
    }

    /// Debug check used by tests: every coflow owner is a registered client
    /// and every client is bound to a registered agent.
    #[cfg(test)]
    fn check_integrity(&self) {
        for coflow in self.coflows.values() {
            assert!(
                self.clients.contains_key(&coflow.owner_client_id),
                "coflow {} owned by unregistered client {}",
                coflow.coflow_id,
                coflow.owner_client_id
            );
            for flow in coflow.flows.values() {
                assert_eq!(flow.desc.data_id.coflow_id, coflow.coflow_id);
            }
        }
        for client in self.clients.values() {
            assert!(
                self.agents.contains_key(&client.slave_id),
                "client {} bound to unregistered slave {}",
                client.client_id,
                client.slave_id
            );
        }
    }
}
