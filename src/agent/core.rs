//! The host agent task.
//!
//! One agent runs per machine. It registers with the coordinator, samples
//! NIC throughput into heartbeats, serves bulk data on its `comm_port`, and
//! relays control messages for the clients on its host. Losing the
//! coordinator connection is fatal; there is no reconnect.

use std::collections::{HashMap, HashSet};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::config::AgentConfig;
use crate::agent::nic::NicSampler;
use crate::data::DataServer;
use crate::error::{Error, Result};
use crate::model::{DataIdentifier, DataType};
use crate::proto::messages::{Heartbeat, RegisterSlave, RegisteredClient};
use crate::proto::{ControlMessage, VarysUrl, wire};

/// Lifecycle of the agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    Connecting,
    Registered,
    Running,
    Heartbeating,
    Terminated,
}

enum AgentEvent {
    Master(ControlMessage),
    MasterClosed,
    Client { conn_id: u64, msg: ControlMessage },
    ClientClosed { conn_id: u64 },
    Shutdown,
}

/// Cloneable handle for stopping a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<AgentEvent>,
}

impl AgentHandle {
    pub async fn shutdown(&self) {
        let _ = self.tx.send(AgentEvent::Shutdown).await;
    }
}

/// A started agent: resolved ports plus the running task.
pub struct RunningAgent {
    pub slave_id: String,
    /// Control port local clients connect to.
    pub port: u16,
    /// Data port the agent's data server listens on.
    pub comm_port: u16,
    pub handle: AgentHandle,
    pub join: JoinHandle<Result<()>>,
}

pub struct Agent {
    config: AgentConfig,
    state: AgentState,
    tx: mpsc::Sender<AgentEvent>,
    rx: mpsc::Receiver<AgentEvent>,
    /// Resolved after binding.
    port: u16,
    comm_port: u16,
    /// Local client connections and their attached ids.
    conns: HashMap<u64, mpsc::Sender<ControlMessage>>,
    clients: HashMap<u64, String>,
    /// Receiver-side accounting: flows local clients are pulling.
    receiving: HashMap<DataIdentifier, u32>,
    /// Coflows announced by local clients.
    coflows: HashSet<String>,
    next_conn_id: u64,
}

impl Agent {
    /// Binds the control and data listeners, then spawns the agent task.
    pub async fn start(config: AgentConfig) -> Result<RunningAgent> {
        let client_listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let port = client_listener.local_addr()?.port();
        let data_listener = TcpListener::bind((config.host.as_str(), config.comm_port)).await?;
        let comm_port = data_listener.local_addr()?.port();

        std::fs::create_dir_all(&config.work_dir)
            .map_err(|e| Error::Configuration(format!("cannot create work dir {:?}: {e}", config.work_dir)))?;

        let (tx, rx) = mpsc::channel(config.channel_buffer);
        let slave_id = config.slave_id.clone();
        let handle = AgentHandle { tx: tx.clone() };
        let agent = Agent {
            config,
            state: AgentState::Starting,
            tx,
            rx,
            port,
            comm_port,
            conns: HashMap::new(),
            clients: HashMap::new(),
            receiving: HashMap::new(),
            coflows: HashSet::new(),
            next_conn_id: 0,
        };
        let join = tokio::spawn(agent.run(client_listener, data_listener));

        Ok(RunningAgent {
            slave_id,
            port,
            comm_port,
            handle,
            join,
        })
    }

    fn set_state(&mut self, state: AgentState) {
        debug!(slave_id = %self.config.slave_id, from = ?self.state, to = ?state, "agent state");
        self.state = state;
    }

    async fn run(mut self, client_listener: TcpListener, data_listener: TcpListener) -> Result<()> {
        tokio::spawn(DataServer::new().run(data_listener));
        let result = self.run_inner(client_listener).await;
        self.set_state(AgentState::Terminated);
        if let Err(e) = &result {
            warn!(slave_id = %self.config.slave_id, error = %e, "agent terminated");
        }
        result
    }

    async fn run_inner(&mut self, client_listener: TcpListener) -> Result<()> {
        self.set_state(AgentState::Connecting);
        let master_url = VarysUrl::parse(&self.config.master_url)?;
        let stream = TcpStream::connect(master_url.authority())
            .await
            .map_err(|e| Error::Connectivity(format!("cannot reach coordinator at {master_url}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (mut master_read, mut master_write) = stream.into_split();

        wire::write_control(
            &mut master_write,
            &ControlMessage::RegisterSlave(RegisterSlave {
                slave_id: self.config.slave_id.clone(),
                host: self.config.host.clone(),
                port: self.port,
                web_ui_port: self.config.web_ui_port,
                comm_port: self.comm_port,
                public_host: self.config.public_host().to_string(),
            }),
        )
        .await?;

        let ask_timeout = self.config.ask_timeout();
        let reply = tokio::time::timeout(ask_timeout, wire::read_control(&mut master_read))
            .await
            .map_err(|_| Error::Timeout(ask_timeout))??;
        match reply {
            Some(ControlMessage::RegisteredSlave(p)) => {
                info!(slave_id = %self.config.slave_id, web_ui = %p.web_ui_url, "registered with coordinator");
            }
            Some(ControlMessage::RegisterSlaveFailed(p)) => return Err(Error::Configuration(p.message)),
            Some(other) => return Err(Error::Protocol(format!("unexpected registration reply tag 0x{:02X}", other.tag()))),
            None => return Err(Error::Connectivity("coordinator closed during registration".into())),
        }
        self.set_state(AgentState::Registered);

        // Coordinator link: writer drains an outbox, reader feeds the mailbox.
        let (master_out, mut master_out_rx) = mpsc::channel::<ControlMessage>(64);
        tokio::spawn(async move {
            while let Some(msg) = master_out_rx.recv().await {
                if let Err(e) = wire::write_control(&mut master_write, &msg).await {
                    debug!(error = %e, "coordinator write failed");
                    break;
                }
            }
        });
        let events = self.tx.clone();
        tokio::spawn(async move {
            loop {
                match wire::read_control(&mut master_read).await {
                    Ok(Some(msg)) => {
                        if events.send(AgentEvent::Master(msg)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "coordinator read failed");
                        break;
                    }
                }
            }
            let _ = events.send(AgentEvent::MasterClosed).await;
        });

        self.set_state(AgentState::Running);
        let mut sampler = NicSampler::new();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());

        loop {
            tokio::select! {
                accepted = client_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        debug!(%addr, "local client connected");
                        self.spawn_client_conn(stream);
                    }
                    Err(e) => warn!(error = %e, "client accept failed"),
                },
                Some(event) = self.rx.recv() => match event {
                    AgentEvent::Master(msg) => self.handle_master(msg),
                    AgentEvent::MasterClosed => {
                        return Err(Error::Connectivity("coordinator connection lost".into()));
                    }
                    AgentEvent::Client { conn_id, msg } => self.handle_client(conn_id, msg, &master_out),
                    AgentEvent::ClientClosed { conn_id } => {
                        self.conns.remove(&conn_id);
                        if let Some(client_id) = self.clients.remove(&conn_id) {
                            debug!(%client_id, "local client disconnected");
                        }
                    }
                    AgentEvent::Shutdown => {
                        info!(slave_id = %self.config.slave_id, "agent shutting down");
                        return Ok(());
                    }
                },
                _ = heartbeat.tick() => {
                    self.set_state(AgentState::Heartbeating);
                    let (rx_bps, tx_bps) = sampler.sample();
                    if master_out.try_send(ControlMessage::Heartbeat(Heartbeat {
                        slave_id: self.config.slave_id.clone(),
                        rx_bps,
                        tx_bps,
                    })).is_err() {
                        warn!("heartbeat dropped, coordinator outbox unavailable");
                    }
                    self.set_state(AgentState::Running);
                }
            }
        }
    }

    fn spawn_client_conn(&mut self, stream: TcpStream) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        let (mut read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(64);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if wire::write_control(&mut write_half, &msg).await.is_err() {
                    break;
                }
            }
        });

        let events = self.tx.clone();
        tokio::spawn(async move {
            loop {
                match wire::read_control(&mut read_half).await {
                    Ok(Some(msg)) => {
                        if events.send(AgentEvent::Client { conn_id, msg }).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(conn_id, error = %e, "client read failed");
                        break;
                    }
                }
            }
            let _ = events.send(AgentEvent::ClientClosed { conn_id }).await;
        });

        self.conns.insert(conn_id, out_tx);
    }

    fn reply_to(&self, conn_id: u64, msg: ControlMessage) {
        if let Some(outbox) = self.conns.get(&conn_id)
            && outbox.try_send(msg).is_err()
        {
            warn!(conn_id, "client outbox full or closed, reply dropped");
        }
    }

    fn relay(&self, master_out: &mpsc::Sender<ControlMessage>, msg: ControlMessage) {
        if master_out.try_send(msg).is_err() {
            warn!("relay to coordinator dropped");
        }
    }

    fn handle_client(&mut self, conn_id: u64, msg: ControlMessage, master_out: &mpsc::Sender<ControlMessage>) {
        match msg {
            ControlMessage::RegisterClient(p) => match p.client_id {
                Some(client_id) => {
                    info!(%client_id, name = %p.name, "local client attached");
                    self.clients.insert(conn_id, client_id.clone());
                    let slave_url = VarysUrl::new(self.config.host.clone(), self.port).to_string();
                    self.reply_to(
                        conn_id,
                        ControlMessage::RegisteredClient(RegisteredClient {
                            client_id,
                            slave_id: self.config.slave_id.clone(),
                            slave_url,
                        }),
                    );
                }
                None => {
                    warn!(conn_id, name = %p.name, "client attach without an id, dropping");
                    self.conns.remove(&conn_id);
                }
            },

            ControlMessage::AddFlow(mut p) => {
                // Non-in-memory flows are served by this agent, not the
                // publishing client, so the advertised port is rewritten.
                if p.desc.data_type != DataType::InMemory {
                    p.desc.origin_port = self.comm_port;
                }
                debug!(data_id = %p.desc.data_id, origin_port = p.desc.origin_port, "relaying flow");
                self.relay(master_out, ControlMessage::AddFlow(p));
            }

            ControlMessage::GetFlow(p) => {
                let data_id = DataIdentifier::new(p.coflow_id, p.flow_id);
                let count = self.receiving.entry(data_id.clone()).or_insert(0);
                *count += 1;
                debug!(%data_id, receives = *count, "local receive accounted");
            }

            ControlMessage::EndGet(p) => {
                let data_id = DataIdentifier::new(p.coflow_id, p.flow_id);
                if let Some(count) = self.receiving.get_mut(&data_id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.receiving.remove(&data_id);
                    }
                }
                debug!(%data_id, "local receive retired");
            }

            ControlMessage::DeleteFlow(p) => {
                self.receiving.remove(&DataIdentifier::new(p.coflow_id.clone(), p.flow_id.clone()));
                self.relay(master_out, ControlMessage::DeleteFlow(p));
            }

            ControlMessage::RegisteredCoflow(p) => {
                self.coflows.insert(p.coflow_id);
            }

            ControlMessage::UnregisterCoflow(p) => {
                self.drop_coflow(&p.coflow_id);
            }

            other => warn!(conn_id, tag = other.tag(), "unexpected client message"),
        }
    }

    fn handle_master(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::UnregisterCoflow(p) => self.drop_coflow(&p.coflow_id),
            other => debug!(tag = other.tag(), "ignoring coordinator message"),
        }
    }

    fn drop_coflow(&mut self, coflow_id: &str) {
        if self.coflows.remove(coflow_id) {
            debug!(coflow_id, "coflow dropped");
        }
        self.receiving.retain(|id, _| id.coflow_id != coflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::messages::{AddFlow, RegisterClient, RegisterSlaveFailed};

    fn config_for(master: std::net::SocketAddr) -> AgentConfig {
        let mut config = AgentConfig::new(format!("varys://127.0.0.1:{}", master.port()), "127.0.0.1");
        config.work_dir = std::env::temp_dir().join("varys-agent-test");
        config.ask_wait_ms = 2_000;
        config
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_is_fatal() {
        let mut config = AgentConfig::new("varys://127.0.0.1:1", "127.0.0.1");
        config.work_dir = std::env::temp_dir().join("varys-agent-test");
        let running = Agent::start(config).await.unwrap();
        let err = running.join.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_rejected_registration_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let msg = wire::read_control(&mut stream).await.unwrap().unwrap();
            assert!(matches!(msg, ControlMessage::RegisterSlave(_)));
            wire::write_control(
                &mut stream,
                &ControlMessage::RegisterSlaveFailed(RegisterSlaveFailed {
                    message: "duplicate slave id".into(),
                }),
            )
            .await
            .unwrap();
        });

        let running = Agent::start(config_for(addr)).await.unwrap();
        let err = running.join.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_add_flow_port_rewrite() {
        // A hand-rolled coordinator stub: accept the agent, then expect the
        // relayed AddFlow with the origin port rewritten.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let comm_port = match wire::read_control(&mut stream).await.unwrap().unwrap() {
                ControlMessage::RegisterSlave(p) => p.comm_port,
                other => panic!("unexpected {other:?}"),
            };
            wire::write_control(
                &mut stream,
                &ControlMessage::RegisteredSlave(crate::proto::messages::RegisteredSlave {
                    web_ui_url: "http://127.0.0.1:16016".into(),
                }),
            )
            .await
            .unwrap();

            let mut seen = Vec::new();
            while seen.len() < 2 {
                match wire::read_control(&mut stream).await.unwrap().unwrap() {
                    ControlMessage::AddFlow(p) => seen.push(p.desc),
                    ControlMessage::Heartbeat(_) => {}
                    other => panic!("unexpected {other:?}"),
                }
            }
            (comm_port, seen)
        });

        let running = Agent::start(config_for(addr)).await.unwrap();

        // Attach as a local client and publish one on-disk and one
        // in-memory flow.
        let mut conn = TcpStream::connect(("127.0.0.1", running.port)).await.unwrap();
        wire::write_control(
            &mut conn,
            &ControlMessage::RegisterClient(RegisterClient {
                client_id: Some("CLIENT-000001".into()),
                name: "app".into(),
                host: "127.0.0.1".into(),
                comm_port: 40001,
            }),
        )
        .await
        .unwrap();
        match wire::read_control(&mut conn).await.unwrap().unwrap() {
            ControlMessage::RegisteredClient(p) => assert_eq!(p.client_id, "CLIENT-000001"),
            other => panic!("unexpected {other:?}"),
        }

        let on_disk = crate::model::FlowDescription::file(
            DataIdentifier::new("cf1", "f1"),
            "/data/blob",
            0,
            64,
            1,
            "127.0.0.1",
            40001,
        );
        let in_memory =
            crate::model::FlowDescription::object(DataIdentifier::new("cf1", "f2"), 64, 1, "127.0.0.1", 40001, None);
        wire::write_control(&mut conn, &ControlMessage::AddFlow(AddFlow { desc: on_disk })).await.unwrap();
        wire::write_control(&mut conn, &ControlMessage::AddFlow(AddFlow { desc: in_memory })).await.unwrap();

        let (comm_port, seen) = stub.await.unwrap();
        assert_eq!(comm_port, running.comm_port);
        let rewritten: Vec<_> = seen.iter().filter(|d| d.data_type == DataType::OnDisk).collect();
        assert_eq!(rewritten.len(), 1);
        assert_eq!(rewritten[0].origin_port, running.comm_port);
        let untouched: Vec<_> = seen.iter().filter(|d| d.data_type == DataType::InMemory).collect();
        assert_eq!(untouched[0].origin_port, 40001);

        running.handle.shutdown().await;
    }
}
