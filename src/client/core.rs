//! The client library's driver task.
//!
//! Owns the client's shared tables (`flow_to_rate`, `flow_to_throttle`,
//! `flow_to_object`) and both control connections. Public API calls arrive
//! as commands; replies from the coordinator are matched to pending asks
//! per-tag in FIFO order, which is sound because the transport preserves
//! per-connection ordering and the coordinator serves its mailbox serially.

use std::collections::{HashMap, VecDeque};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::client::config::ClientConfig;
use crate::data::{DataServer, ObjectStore};
use crate::error::{Error, Result};
use crate::model::{CoflowDescription, DataIdentifier, FlowDescription};
use crate::proto::messages::{
    AddFlow, DeleteFlow, EndGet, GetFlow, RegisterClient, RegisterCoflow, RequestBestMachines, StopClient,
    UnregisterCoflow,
};
use crate::proto::{ControlMessage, VarysUrl, wire};
use crate::throttle::RateHandle;

/// Registration barrier states observed through the watch channel.
#[derive(Debug, Clone)]
pub enum RegState {
    Pending,
    Registered { client_id: String, slave_id: String },
    Failed(String),
    Disconnected(String),
}

/// Commands from [`crate::client::VarysClient`] handles.
pub(crate) enum ClientCmd {
    RegisterCoflow {
        desc: CoflowDescription,
        reply_tx: oneshot::Sender<Result<String>>,
    },
    UnregisterCoflow {
        coflow_id: String,
    },
    Put {
        desc: FlowDescription,
        bytes: Option<Vec<u8>>,
    },
    BeginGet {
        flow_id: String,
        coflow_id: String,
        reply_tx: oneshot::Sender<Result<(FlowDescription, RateHandle)>>,
    },
    EndGet {
        data_id: DataIdentifier,
    },
    DeleteFlow {
        flow_id: String,
        coflow_id: String,
    },
    BestMachines {
        rx: bool,
        count: u32,
        adjust_bytes: u64,
        reply_tx: oneshot::Sender<Result<Vec<String>>>,
    },
    Stop {
        reply_tx: oneshot::Sender<()>,
    },
}

enum NetEvent {
    Master(ControlMessage),
    MasterClosed,
    Agent(ControlMessage),
    AgentClosed,
}

pub(crate) struct ClientCore {
    config: ClientConfig,
    cmd_rx: mpsc::Receiver<ClientCmd>,
    events_tx: mpsc::Sender<NetEvent>,
    events_rx: mpsc::Receiver<NetEvent>,
    reg_tx: watch::Sender<RegState>,

    client_id: String,
    slave_id: String,
    comm_port: u16,
    master_out: Option<mpsc::Sender<ControlMessage>>,
    agent_out: Option<mpsc::Sender<ControlMessage>>,
    disconnected: bool,

    flow_to_rate: HashMap<DataIdentifier, f64>,
    flow_to_throttle: HashMap<DataIdentifier, RateHandle>,
    flow_to_object: ObjectStore,

    pending_coflows: VecDeque<oneshot::Sender<Result<String>>>,
    pending_gets: VecDeque<(String, String, oneshot::Sender<Result<(FlowDescription, RateHandle)>>)>,
    pending_best_rx: VecDeque<oneshot::Sender<Result<Vec<String>>>>,
    pending_best_tx: VecDeque<oneshot::Sender<Result<Vec<String>>>>,
}

impl ClientCore {
    pub(crate) fn new(
        config: ClientConfig,
        cmd_rx: mpsc::Receiver<ClientCmd>,
        reg_tx: watch::Sender<RegState>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_buffer);
        Self {
            config,
            cmd_rx,
            events_tx,
            events_rx,
            reg_tx,
            client_id: String::new(),
            slave_id: String::new(),
            comm_port: 0,
            master_out: None,
            agent_out: None,
            disconnected: false,
            flow_to_rate: HashMap::new(),
            flow_to_throttle: HashMap::new(),
            flow_to_object: ObjectStore::new(),
            pending_coflows: VecDeque::new(),
            pending_gets: VecDeque::new(),
            pending_best_rx: VecDeque::new(),
            pending_best_tx: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(e) = self.register().await {
            warn!(name = %self.config.name, error = %e, "client registration failed");
            let _ = self.reg_tx.send(RegState::Failed(e.to_string()));
            return;
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_cmd(cmd) {
                            break;
                        }
                    }
                    // All handles dropped: abrupt teardown, connections
                    // close, the coordinator cascades.
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        debug!(client_id = %self.client_id, "client task stopped");
    }

    /// Spawns reader/writer tasks for one control connection.
    fn attach_connection(
        &self,
        stream: TcpStream,
        to_event: fn(ControlMessage) -> NetEvent,
        closed: fn() -> NetEvent,
    ) -> mpsc::Sender<ControlMessage> {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(64);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = wire::write_control(&mut write_half, &msg).await {
                    debug!(error = %e, "control write failed");
                    break;
                }
            }
        });

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match wire::read_control(&mut read_half).await {
                    Ok(Some(msg)) => {
                        if events.send(to_event(msg)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "control read failed");
                        break;
                    }
                }
            }
            let _ = events.send(closed()).await;
        });

        out_tx
    }

    /// The registration handshake: coordinator first, then the local agent
    /// it assigns. Also brings up the in-process data server that answers
    /// `put_object` flows.
    async fn register(&mut self) -> Result<()> {
        let data_listener = TcpListener::bind((self.config.host.as_str(), self.config.data_port)).await?;
        self.comm_port = data_listener.local_addr()?.port();
        tokio::spawn(DataServer::with_objects(self.flow_to_object.clone()).run(data_listener));

        let master_url = VarysUrl::parse(&self.config.master_url)?;
        let stream = TcpStream::connect(master_url.authority())
            .await
            .map_err(|e| Error::Connectivity(format!("cannot reach coordinator at {master_url}: {e}")))?;
        let master_out = self.attach_connection(stream, NetEvent::Master, || NetEvent::MasterClosed);

        master_out
            .try_send(ControlMessage::RegisterClient(RegisterClient {
                client_id: None,
                name: self.config.name.clone(),
                host: self.config.host.clone(),
                comm_port: self.comm_port,
            }))
            .map_err(|_| Error::Connectivity("coordinator connection lost".into()))?;
        self.master_out = Some(master_out);

        let slave_url = loop {
            match self.next_event().await? {
                NetEvent::Master(ControlMessage::RegisteredClient(p)) => {
                    info!(client_id = %p.client_id, slave_id = %p.slave_id, "registered with coordinator");
                    self.client_id = p.client_id;
                    self.slave_id = p.slave_id;
                    break p.slave_url;
                }
                NetEvent::Master(other) => debug!(tag = other.tag(), "message before registration"),
                NetEvent::MasterClosed => {
                    return Err(Error::Connectivity("coordinator rejected registration".into()));
                }
                NetEvent::Agent(_) | NetEvent::AgentClosed => {}
            }
        };

        let agent_url = VarysUrl::parse(&slave_url)?;
        let stream = TcpStream::connect(agent_url.authority())
            .await
            .map_err(|e| Error::Connectivity(format!("cannot reach local agent at {agent_url}: {e}")))?;
        let agent_out = self.attach_connection(stream, NetEvent::Agent, || NetEvent::AgentClosed);
        agent_out
            .try_send(ControlMessage::RegisterClient(RegisterClient {
                client_id: Some(self.client_id.clone()),
                name: self.config.name.clone(),
                host: self.config.host.clone(),
                comm_port: self.comm_port,
            }))
            .map_err(|_| Error::Connectivity("agent connection lost".into()))?;
        self.agent_out = Some(agent_out);

        loop {
            match self.next_event().await? {
                NetEvent::Agent(ControlMessage::RegisteredClient(_)) => break,
                NetEvent::Master(msg) => self.handle_master(msg),
                NetEvent::Agent(other) => debug!(tag = other.tag(), "agent message before attach"),
                NetEvent::AgentClosed => {
                    return Err(Error::Connectivity("agent rejected attach".into()));
                }
                NetEvent::MasterClosed => {
                    return Err(Error::Connectivity("coordinator connection lost".into()));
                }
            }
        }

        let _ = self.reg_tx.send(RegState::Registered {
            client_id: self.client_id.clone(),
            slave_id: self.slave_id.clone(),
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<NetEvent> {
        let timeout = self.config.ask_timeout();
        match tokio::time::timeout(timeout, self.events_rx.recv()).await {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(None) => Err(Error::Connectivity("client event channel closed".into())),
            Ok(Some(event)) => Ok(event),
        }
    }

    fn send_master(&self, msg: ControlMessage) -> Result<()> {
        if self.disconnected {
            return Err(Error::Connectivity("client is disconnected".into()));
        }
        self.master_out
            .as_ref()
            .and_then(|out| out.try_send(msg).ok())
            .ok_or_else(|| Error::Connectivity("coordinator connection lost".into()))
    }

    fn send_agent(&self, msg: ControlMessage) {
        if self.disconnected {
            return;
        }
        if let Some(out) = &self.agent_out
            && out.try_send(msg).is_err()
        {
            warn!("agent send dropped");
        }
    }

    fn handle_cmd(&mut self, cmd: ClientCmd) -> bool {
        match cmd {
            ClientCmd::RegisterCoflow { desc, reply_tx } => {
                match self.send_master(ControlMessage::RegisterCoflow(RegisterCoflow {
                    client_id: self.client_id.clone(),
                    desc,
                })) {
                    Ok(()) => self.pending_coflows.push_back(reply_tx),
                    Err(e) => {
                        let _ = reply_tx.send(Err(e));
                    }
                }
            }

            ClientCmd::UnregisterCoflow { coflow_id } => {
                let _ = self.send_master(ControlMessage::UnregisterCoflow(UnregisterCoflow {
                    coflow_id: coflow_id.clone(),
                }));
                self.send_agent(ControlMessage::UnregisterCoflow(UnregisterCoflow {
                    coflow_id: coflow_id.clone(),
                }));
                self.purge_coflow(&coflow_id);
            }

            ClientCmd::Put { mut desc, bytes } => {
                // The driver owns the origin: bytes are served either by the
                // in-process data server or by the agent after its rewrite.
                desc.origin_host = self.config.host.clone();
                desc.origin_port = self.comm_port;
                if let Some(bytes) = bytes {
                    self.flow_to_object.insert(desc.data_id.clone(), bytes);
                }
                debug!(data_id = %desc.data_id, data_type = ?desc.data_type, "publishing flow");
                self.send_agent(ControlMessage::AddFlow(AddFlow { desc }));
            }

            ClientCmd::BeginGet {
                flow_id,
                coflow_id,
                reply_tx,
            } => {
                match self.send_master(ControlMessage::GetFlow(GetFlow {
                    flow_id: flow_id.clone(),
                    coflow_id: coflow_id.clone(),
                    client_id: self.client_id.clone(),
                    slave_id: self.slave_id.clone(),
                })) {
                    Ok(()) => self.pending_gets.push_back((flow_id, coflow_id, reply_tx)),
                    Err(e) => {
                        let _ = reply_tx.send(Err(e));
                    }
                }
            }

            ClientCmd::EndGet { data_id } => self.end_get(&data_id),

            ClientCmd::DeleteFlow { flow_id, coflow_id } => {
                let data_id = DataIdentifier::new(coflow_id.clone(), flow_id.clone());
                self.flow_to_object.remove(&data_id);
                self.flow_to_rate.remove(&data_id);
                self.flow_to_throttle.remove(&data_id);
                self.send_agent(ControlMessage::DeleteFlow(DeleteFlow { flow_id, coflow_id }));
            }

            ClientCmd::BestMachines {
                rx,
                count,
                adjust_bytes,
                reply_tx,
            } => {
                let request = RequestBestMachines { count, adjust_bytes };
                let msg = if rx {
                    ControlMessage::RequestBestRxMachines(request)
                } else {
                    ControlMessage::RequestBestTxMachines(request)
                };
                match self.send_master(msg) {
                    Ok(()) if rx => self.pending_best_rx.push_back(reply_tx),
                    Ok(()) => self.pending_best_tx.push_back(reply_tx),
                    Err(e) => {
                        let _ = reply_tx.send(Err(e));
                    }
                }
            }

            ClientCmd::Stop { reply_tx } => {
                let _ = self.send_master(ControlMessage::StopClient(StopClient {
                    client_id: self.client_id.clone(),
                }));
                let _ = reply_tx.send(());
                return false;
            }
        }
        true
    }

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Master(msg) => self.handle_master(msg),
            NetEvent::Agent(msg) => debug!(tag = msg.tag(), "ignoring agent message"),
            NetEvent::MasterClosed => self.mark_disconnected("coordinator connection lost"),
            NetEvent::AgentClosed => self.mark_disconnected("agent connection lost"),
        }
    }

    fn handle_master(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::RegisteredCoflow(p) => {
                if let Some(reply_tx) = self.pending_coflows.pop_front() {
                    // The local agent learns of the coflow once the
                    // coordinator has acknowledged it.
                    self.send_agent(ControlMessage::RegisteredCoflow(p.clone()));
                    let _ = reply_tx.send(Ok(p.coflow_id));
                } else {
                    debug!(coflow_id = %p.coflow_id, "discarding late coflow reply");
                }
            }

            ControlMessage::GotFlowDesc(p) => {
                let Some((flow_id, coflow_id, reply_tx)) = self.pending_gets.pop_front() else {
                    debug!("discarding late flow reply");
                    return;
                };
                match p.desc {
                    Some(desc) => {
                        let data_id = desc.data_id.clone();
                        self.send_agent(ControlMessage::GetFlow(GetFlow {
                            flow_id,
                            coflow_id,
                            client_id: self.client_id.clone(),
                            slave_id: self.slave_id.clone(),
                        }));
                        let rate = self.flow_to_rate.get(&data_id).copied().unwrap_or(0.0);
                        let handle = RateHandle::new(rate);
                        self.flow_to_throttle.insert(data_id.clone(), handle.clone());
                        if reply_tx.send(Ok((desc, handle))).is_err() {
                            // The asker timed out; nobody else will retire
                            // the get we just registered.
                            self.end_get(&data_id);
                        }
                    }
                    None => {
                        let _ = reply_tx.send(Err(Error::NotFound { coflow_id, flow_id }));
                    }
                }
            }

            ControlMessage::UpdatedRates(p) => {
                debug!(flows = p.rates.len(), "rate update received");
                for (desc, rate_bps) in p.rates {
                    if let Some(handle) = self.flow_to_throttle.get(&desc.data_id) {
                        handle.set_new_rate(rate_bps);
                    }
                    self.flow_to_rate.insert(desc.data_id, rate_bps);
                }
            }

            ControlMessage::BestRxMachines(p) => {
                if let Some(reply_tx) = self.pending_best_rx.pop_front() {
                    let _ = reply_tx.send(Ok(p.hosts));
                }
            }

            ControlMessage::BestTxMachines(p) => {
                if let Some(reply_tx) = self.pending_best_tx.pop_front() {
                    let _ = reply_tx.send(Ok(p.hosts));
                }
            }

            other => debug!(tag = other.tag(), "ignoring coordinator message"),
        }
    }

    /// Flips the client into the terminal disconnected state exactly once
    /// and fails everything that was still waiting.
    fn mark_disconnected(&mut self, reason: &str) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        warn!(client_id = %self.client_id, reason, "client disconnected");
        let _ = self.reg_tx.send(RegState::Disconnected(reason.to_string()));

        for reply_tx in self.pending_coflows.drain(..) {
            let _ = reply_tx.send(Err(Error::Connectivity(reason.into())));
        }
        for (_, _, reply_tx) in self.pending_gets.drain(..) {
            let _ = reply_tx.send(Err(Error::Connectivity(reason.into())));
        }
        for reply_tx in self.pending_best_rx.drain(..).chain(self.pending_best_tx.drain(..)) {
            let _ = reply_tx.send(Err(Error::Connectivity(reason.into())));
        }
    }

    /// Ends one in-progress get: drops the throttle handle and tells the
    /// coordinator and agent to retire this client's receiver entry. The
    /// last pushed rate stays in `flow_to_rate` so a later re-fetch starts
    /// throttled.
    fn end_get(&mut self, data_id: &DataIdentifier) {
        self.flow_to_throttle.remove(data_id);
        let end = EndGet {
            flow_id: data_id.flow_id.clone(),
            coflow_id: data_id.coflow_id.clone(),
            client_id: self.client_id.clone(),
        };
        let _ = self.send_master(ControlMessage::EndGet(end.clone()));
        self.send_agent(ControlMessage::EndGet(end));
    }

    fn purge_coflow(&mut self, coflow_id: &str) {
        self.flow_to_rate.retain(|id, _| id.coflow_id != coflow_id);
        self.flow_to_throttle.retain(|id, _| id.coflow_id != coflow_id);
        self.flow_to_object.remove_coflow(coflow_id);
    }
}
