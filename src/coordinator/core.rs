//! The coordinator task.
//!
//! One mailbox serializes every catalog mutation. Per-connection reader and
//! writer tasks translate between sockets and the mailbox; a reader posts a
//! synthetic close event when its peer goes away, which is where membership
//! cascades start. Replies and pushes go out through bounded per-connection
//! outboxes and are dropped, not awaited, if a peer stalls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::catalog::{Catalog, CatalogSummary};
use crate::coordinator::config::CoordinatorConfig;
use crate::coordinator::handle::CoordinatorHandle;
use crate::coordinator::policy::RatePolicy;
use crate::model::FlowDescription;
use crate::proto::messages::{
    BestMachines, GotFlowDesc, RegisterSlaveFailed, RegisteredClient, RegisteredCoflow, RegisteredSlave, SlaveState,
    UpdatedRates,
};
use crate::proto::{ControlMessage, VarysUrl, wire};

/// Events consumed by the coordinator task.
pub(crate) enum CoordEvent {
    Inbound { conn_id: u64, msg: ControlMessage },
    Closed { conn_id: u64 },
    Inspect { reply_tx: oneshot::Sender<CatalogSummary> },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
enum PeerKind {
    Unknown,
    Agent(String),
    Client(String),
}

struct Conn {
    outbox: mpsc::Sender<ControlMessage>,
    peer: PeerKind,
    addr: SocketAddr,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    catalog: Catalog,
    policy: Box<dyn RatePolicy>,
    tx: mpsc::Sender<CoordEvent>,
    rx: mpsc::Receiver<CoordEvent>,
    conns: HashMap<u64, Conn>,
    agent_conns: HashMap<String, u64>,
    client_conns: HashMap<String, u64>,
    next_conn_id: u64,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, policy: Box<dyn RatePolicy>) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        let catalog = Catalog::new(config.heartbeat_interval());
        Self {
            config,
            catalog,
            policy,
            tx,
            rx,
            conns: HashMap::new(),
            agent_conns: HashMap::new(),
            client_conns: HashMap::new(),
            next_conn_id: 0,
        }
    }

    /// In-process handle for inspection and shutdown.
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle::new(self.tx.clone(), self.config.ask_timeout())
    }

    /// Runs until a shutdown request; consumes the coordinator.
    pub async fn run(mut self, listener: TcpListener) {
        let mut alloc = tokio::time::interval(self.config.allocation_interval());
        alloc.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(self.config.heartbeat_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        match listener.local_addr() {
            Ok(addr) => info!(%addr, "coordinator listening"),
            Err(e) => warn!(error = %e, "coordinator listener address unknown"),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        self.spawn_connection(stream, addr);
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(event) = self.rx.recv() => {
                    if !self.handle_event(event) {
                        break;
                    }
                }
                _ = alloc.tick() => self.dispatch_rates(),
                _ = sweep.tick() => self.sweep_liveness(),
            }
        }

        info!("coordinator stopped");
    }

    fn spawn_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        debug!(conn_id, %addr, "control connection accepted");

        let (mut read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(64);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = wire::write_control(&mut write_half, &msg).await {
                    debug!(conn_id, error = %e, "control write failed");
                    break;
                }
            }
        });

        let events = self.tx.clone();
        tokio::spawn(async move {
            loop {
                match wire::read_control(&mut read_half).await {
                    Ok(Some(msg)) => {
                        if events.send(CoordEvent::Inbound { conn_id, msg }).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(conn_id, error = %e, "control read failed");
                        break;
                    }
                }
            }
            let _ = events.send(CoordEvent::Closed { conn_id }).await;
        });

        self.conns.insert(
            conn_id,
            Conn {
                outbox: out_tx,
                peer: PeerKind::Unknown,
                addr,
            },
        );
    }

    fn handle_event(&mut self, event: CoordEvent) -> bool {
        match event {
            CoordEvent::Inbound { conn_id, msg } => self.handle_message(conn_id, msg),
            CoordEvent::Closed { conn_id } => self.handle_closed(conn_id),
            CoordEvent::Inspect { reply_tx } => {
                let _ = reply_tx.send(self.catalog.summary(Instant::now()));
            }
            CoordEvent::Shutdown => {
                info!("coordinator shutting down");
                return false;
            }
        }
        true
    }

    fn send_to(&self, conn_id: u64, msg: ControlMessage) {
        if let Some(conn) = self.conns.get(&conn_id)
            && conn.outbox.try_send(msg).is_err()
        {
            warn!(conn_id, addr = %conn.addr, "outbox full or closed, message dropped");
        }
    }

    /// Closing the outbox tears the connection down; the peer observes EOF.
    fn drop_conn(&mut self, conn_id: u64) {
        if let Some(conn) = self.conns.remove(&conn_id) {
            match conn.peer {
                PeerKind::Agent(id) => {
                    self.agent_conns.remove(&id);
                }
                PeerKind::Client(id) => {
                    self.client_conns.remove(&id);
                }
                PeerKind::Unknown => {}
            }
        }
    }

    fn handle_message(&mut self, conn_id: u64, msg: ControlMessage) {
        match msg {
            ControlMessage::RegisterSlave(p) => match self.catalog.register_slave(&p, Instant::now()) {
                Ok(()) => {
                    if let Some(conn) = self.conns.get_mut(&conn_id) {
                        conn.peer = PeerKind::Agent(p.slave_id.clone());
                    }
                    self.agent_conns.insert(p.slave_id.clone(), conn_id);
                    let web_ui_url = format!("http://{}:{}", p.public_host, p.web_ui_port);
                    self.send_to(conn_id, ControlMessage::RegisteredSlave(RegisteredSlave { web_ui_url }));
                }
                Err(message) => {
                    warn!(conn_id, slave_id = %p.slave_id, %message, "slave registration rejected");
                    self.send_to(
                        conn_id,
                        ControlMessage::RegisterSlaveFailed(RegisterSlaveFailed { message }),
                    );
                }
            },

            ControlMessage::RegisterClient(p) => {
                match self.catalog.register_client(&p.name, &p.host, p.comm_port) {
                    Ok(record) => {
                        let agent = self
                            .catalog
                            .agent(&record.slave_id)
                            .expect("client bound to a registered slave");
                        let slave_url = VarysUrl::new(agent.host.clone(), agent.port).to_string();
                        if let Some(conn) = self.conns.get_mut(&conn_id) {
                            conn.peer = PeerKind::Client(record.client_id.clone());
                        }
                        self.client_conns.insert(record.client_id.clone(), conn_id);
                        self.send_to(
                            conn_id,
                            ControlMessage::RegisteredClient(RegisteredClient {
                                client_id: record.client_id,
                                slave_id: record.slave_id,
                                slave_url,
                            }),
                        );
                    }
                    Err(message) => {
                        // No failure tag exists for clients; the closed
                        // connection is the rejection.
                        warn!(conn_id, name = %p.name, host = %p.host, %message, "client registration rejected");
                        self.drop_conn(conn_id);
                    }
                }
            }

            ControlMessage::Heartbeat(p) => {
                if !self.catalog.heartbeat(&p.slave_id, p.rx_bps, p.tx_bps, Instant::now()) {
                    debug!(slave_id = %p.slave_id, "heartbeat from unknown slave");
                }
            }

            ControlMessage::RegisterCoflow(p) => match self.catalog.register_coflow(&p.client_id, p.desc) {
                Ok(coflow_id) => {
                    self.send_to(conn_id, ControlMessage::RegisteredCoflow(RegisteredCoflow { coflow_id }));
                }
                Err(message) => warn!(conn_id, client_id = %p.client_id, %message, "coflow registration rejected"),
            },

            ControlMessage::UnregisterCoflow(p) => {
                if let Some(info) = self.catalog.unregister_coflow(&p.coflow_id) {
                    // The owning agent drops its local bookkeeping for the
                    // coflow; nothing else needs to hear about it.
                    if let Some(owner) = self.catalog.client(&info.owner_client_id)
                        && let Some(agent_conn) = self.agent_conns.get(&owner.slave_id)
                    {
                        self.send_to(*agent_conn, ControlMessage::UnregisterCoflow(p));
                    }
                }
            }

            ControlMessage::AddFlow(p) => {
                if let Err(message) = self.catalog.add_flow(p.desc) {
                    warn!(conn_id, %message, "flow rejected");
                }
            }

            ControlMessage::GetFlow(p) => {
                let desc = self.catalog.get_flow(&p.flow_id, &p.coflow_id, &p.client_id);
                let found = desc.is_some();
                self.send_to(conn_id, ControlMessage::GotFlowDesc(GotFlowDesc { desc }));
                // Same connection, after the reply: the allocation reaches
                // the client no later than its transfer starts, instead of
                // waiting out the dispatch tick.
                if found {
                    self.push_rates_to(&p.client_id);
                }
            }

            ControlMessage::EndGet(p) => {
                self.catalog.end_get(&p.flow_id, &p.coflow_id, &p.client_id);
            }

            ControlMessage::DeleteFlow(p) => {
                self.catalog.delete_flow(&p.flow_id, &p.coflow_id);
            }

            ControlMessage::RequestBestRxMachines(p) => {
                let hosts = self
                    .catalog
                    .best_rx_machines(p.count as usize, p.adjust_bytes, Instant::now());
                self.send_to(conn_id, ControlMessage::BestRxMachines(BestMachines { hosts }));
            }

            ControlMessage::RequestBestTxMachines(p) => {
                let hosts = self
                    .catalog
                    .best_tx_machines(p.count as usize, p.adjust_bytes, Instant::now());
                self.send_to(conn_id, ControlMessage::BestTxMachines(BestMachines { hosts }));
            }

            ControlMessage::StopClient(p) => {
                info!(client_id = %p.client_id, "client stopping");
                self.catalog.remove_client(&p.client_id);
                if let Some(conn) = self.client_conns.get(&p.client_id).copied() {
                    self.drop_conn(conn);
                }
            }

            ControlMessage::RequestSlaveState => {
                let agents = self.catalog.summary(Instant::now()).agents;
                self.send_to(conn_id, ControlMessage::SlaveState(SlaveState { agents }));
            }

            other => {
                warn!(conn_id, tag = other.tag(), "unexpected message, closing connection");
                self.drop_conn(conn_id);
            }
        }
    }

    fn handle_closed(&mut self, conn_id: u64) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        match conn.peer {
            PeerKind::Agent(slave_id) => {
                info!(%slave_id, addr = %conn.addr, "slave connection lost");
                self.agent_conns.remove(&slave_id);
                let clients = self.catalog.remove_agent(&slave_id);
                for client_id in clients {
                    self.drop_client_conn(&client_id);
                }
            }
            PeerKind::Client(client_id) => {
                info!(%client_id, addr = %conn.addr, "client connection lost");
                self.client_conns.remove(&client_id);
                self.catalog.remove_client(&client_id);
            }
            PeerKind::Unknown => debug!(conn_id, addr = %conn.addr, "connection closed before registration"),
        }
    }

    fn drop_client_conn(&mut self, client_id: &str) {
        if let Some(conn_id) = self.client_conns.remove(client_id) {
            self.conns.remove(&conn_id);
        }
    }

    /// Allocates over the current catalog and groups positive rates by the
    /// clients actively getting each flow.
    fn allocate_per_client(&mut self) -> HashMap<String, Vec<(FlowDescription, f64)>> {
        let snapshot = self.catalog.snapshot();
        let rates = self.policy.allocate(&snapshot);
        let mut per_client: HashMap<String, Vec<(FlowDescription, f64)>> = HashMap::new();
        if rates.is_empty() {
            return per_client;
        }
        for flow in &snapshot.flows {
            if let Some(rate) = rates.get(&flow.desc.data_id)
                && *rate > 0.0
            {
                for client_id in &flow.active {
                    per_client
                        .entry(client_id.clone())
                        .or_default()
                        .push((flow.desc.clone(), *rate));
                }
            }
        }
        per_client
    }

    /// One policy tick: snapshot, allocate, push per-client rate updates.
    fn dispatch_rates(&mut self) {
        for (client_id, list) in self.allocate_per_client() {
            if let Some(conn_id) = self.client_conns.get(&client_id) {
                debug!(%client_id, flows = list.len(), "pushing rate update");
                self.send_to(*conn_id, ControlMessage::UpdatedRates(UpdatedRates { rates: list }));
            }
        }
    }

    /// Out-of-tick push to one client, right after one of its gets
    /// registered.
    fn push_rates_to(&mut self, client_id: &str) {
        let Some(conn_id) = self.client_conns.get(client_id).copied() else {
            return;
        };
        if let Some(list) = self.allocate_per_client().remove(client_id) {
            debug!(%client_id, flows = list.len(), "pushing rate update");
            self.send_to(conn_id, ControlMessage::UpdatedRates(UpdatedRates { rates: list }));
        }
    }

    fn sweep_liveness(&mut self) {
        let (agents, clients) = self.catalog.sweep_dead(Instant::now());
        for slave_id in agents {
            warn!(%slave_id, "slave declared dead");
            if let Some(conn_id) = self.agent_conns.remove(&slave_id) {
                self.conns.remove(&conn_id);
            }
        }
        for client_id in clients {
            self.drop_client_conn(&client_id);
        }
    }
}
