//! Public client API.
//!
//! A [`VarysClient`] is a cheap cloneable handle onto the driver task. Every
//! public operation first passes the registration barrier, then either asks
//! (bounded by the configured timeout) or fires and forgets, per operation
//! semantics.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::client::config::ClientConfig;
use crate::client::core::{ClientCmd, ClientCore, RegState};
use crate::error::{Error, Result};
use crate::model::{CoflowDescription, DataIdentifier, DataType, FlowDescription};
use crate::proto::wire;
use crate::throttle::{RateHandle, ThrottledReader};

/// Ids assigned at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub slave_id: String,
}

#[derive(Clone)]
pub struct VarysClient {
    cmd_tx: mpsc::Sender<ClientCmd>,
    reg_rx: watch::Receiver<RegState>,
    ask_timeout: Duration,
}

impl VarysClient {
    /// Spawns the driver task and returns immediately; registration
    /// proceeds in the background. Call [`Self::wait_for_registration`] (or
    /// any public operation, which does it for you) before relying on it.
    pub fn start(config: ClientConfig) -> Self {
        let ask_timeout = config.ask_timeout();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_buffer);
        let (reg_tx, reg_rx) = watch::channel(RegState::Pending);
        tokio::spawn(ClientCore::new(config, cmd_rx, reg_tx).run());
        Self {
            cmd_tx,
            reg_rx,
            ask_timeout,
        }
    }

    /// Blocks until the registration handshake completed, failed, or the
    /// ask timeout elapsed.
    pub async fn wait_for_registration(&self) -> Result<ClientIdentity> {
        let mut reg_rx = self.reg_rx.clone();
        let wait = async {
            loop {
                let state = reg_rx.borrow().clone();
                match state {
                    RegState::Registered { client_id, slave_id } => {
                        return Ok(ClientIdentity { client_id, slave_id });
                    }
                    RegState::Failed(reason) => return Err(Error::Connectivity(reason)),
                    RegState::Disconnected(reason) => return Err(Error::Connectivity(reason)),
                    RegState::Pending => {}
                }
                if reg_rx.changed().await.is_err() {
                    return Err(Error::Connectivity("client task stopped".into()));
                }
            }
        };
        match tokio::time::timeout(self.ask_timeout, wait).await {
            Err(_) => Err(Error::Timeout(self.ask_timeout)),
            Ok(result) => result,
        }
    }

    async fn send_cmd(&self, cmd: ClientCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Connectivity("client task stopped".into()))
    }

    async fn ask<T>(&self, cmd: ClientCmd, reply_rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.send_cmd(cmd).await?;
        match tokio::time::timeout(self.ask_timeout, reply_rx).await {
            Err(_) => Err(Error::Timeout(self.ask_timeout)),
            Ok(Err(_)) => Err(Error::Connectivity("client task stopped".into())),
            Ok(Ok(result)) => result,
        }
    }

    // ---- coflow lifecycle ----

    /// Registers a coflow and returns its coordinator-assigned id.
    pub async fn register_coflow(&self, desc: CoflowDescription) -> Result<String> {
        self.wait_for_registration().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ask(ClientCmd::RegisterCoflow { desc, reply_tx }, reply_rx).await
    }

    /// Fire-and-forget: removes the coflow everywhere and purges all local
    /// per-flow state under it.
    pub async fn unregister_coflow(&self, coflow_id: &str) -> Result<()> {
        self.wait_for_registration().await?;
        self.send_cmd(ClientCmd::UnregisterCoflow {
            coflow_id: coflow_id.to_string(),
        })
        .await
    }

    // ---- publishing ----

    /// Serializes `obj` and publishes it as an in-memory flow served by
    /// this process.
    pub async fn put_object<T: Serialize>(
        &self,
        flow_id: &str,
        coflow_id: &str,
        obj: &T,
        num_receivers: u32,
    ) -> Result<()> {
        self.wait_for_registration().await?;
        let bytes = serde_cbor::to_vec(obj)?;
        let desc = FlowDescription::object(
            DataIdentifier::new(coflow_id, flow_id),
            bytes.len() as u64,
            num_receivers,
            String::new(),
            0,
            Some(std::any::type_name::<T>().to_string()),
        );
        self.send_cmd(ClientCmd::Put {
            desc,
            bytes: Some(bytes),
        })
        .await
    }

    /// Publishes a window of an on-disk file, served by the host agent.
    pub async fn put_file(
        &self,
        flow_id: &str,
        coflow_id: &str,
        path: &str,
        offset: u64,
        length: u64,
        num_receivers: u32,
    ) -> Result<()> {
        self.wait_for_registration().await?;
        let desc = FlowDescription::file(
            DataIdentifier::new(coflow_id, flow_id),
            path,
            offset,
            length,
            num_receivers,
            String::new(),
            0,
        );
        self.send_cmd(ClientCmd::Put { desc, bytes: None }).await
    }

    /// Publishes a synthetic flow of `size_in_bytes` deterministic bytes.
    pub async fn put_fake(&self, flow_id: &str, coflow_id: &str, size_in_bytes: u64, num_receivers: u32) -> Result<()> {
        self.wait_for_registration().await?;
        let desc = FlowDescription::fake(
            DataIdentifier::new(coflow_id, flow_id),
            size_in_bytes,
            num_receivers,
            String::new(),
            0,
        );
        self.send_cmd(ClientCmd::Put { desc, bytes: None }).await
    }

    // ---- retrieval ----

    /// Fetches an in-memory flow and deserializes it.
    pub async fn get_object<T: DeserializeOwned>(&self, flow_id: &str, coflow_id: &str) -> Result<T> {
        let bytes = self.handle_get(flow_id, coflow_id, DataType::InMemory).await?;
        Ok(serde_cbor::from_slice(&bytes)?)
    }

    /// Fetches an on-disk flow's bytes.
    pub async fn get_file(&self, flow_id: &str, coflow_id: &str) -> Result<Vec<u8>> {
        self.handle_get(flow_id, coflow_id, DataType::OnDisk).await
    }

    /// Fetches a synthetic flow's bytes.
    pub async fn get_fake(&self, flow_id: &str, coflow_id: &str) -> Result<Vec<u8>> {
        self.handle_get(flow_id, coflow_id, DataType::Fake).await
    }

    /// The common get path: resolve at the coordinator, account at the
    /// agent, pull from the origin under the current rate limit.
    async fn handle_get(&self, flow_id: &str, coflow_id: &str, expected: DataType) -> Result<Vec<u8>> {
        self.wait_for_registration().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let (desc, rate) = self
            .ask(
                ClientCmd::BeginGet {
                    flow_id: flow_id.to_string(),
                    coflow_id: coflow_id.to_string(),
                    reply_tx,
                },
                reply_rx,
            )
            .await?;

        let data_id = desc.data_id.clone();
        let result = self.fetch(desc, expected, rate).await;
        // The throttle entry lives only while the get is in progress.
        let _ = self.send_cmd(ClientCmd::EndGet { data_id }).await;
        result
    }

    async fn fetch(&self, desc: FlowDescription, expected: DataType, rate: RateHandle) -> Result<Vec<u8>> {
        if desc.data_type != expected {
            return Err(Error::TypeMismatch {
                requested: expected,
                actual: desc.data_type,
            });
        }

        debug!(data_id = %desc.data_id, origin = %desc.origin_host, port = desc.origin_port, "pulling flow");
        let stream = TcpStream::connect((desc.origin_host.as_str(), desc.origin_port))
            .await
            .map_err(|e| Error::Connectivity(format!("cannot reach origin {}:{}: {e}", desc.origin_host, desc.origin_port)))?;
        let (read_half, mut write_half) = stream.into_split();
        wire::write_get_request(&mut write_half, &desc).await?;

        let mut throttled = ThrottledReader::new(read_half, &rate);
        let body = wire::read_data_response(&mut throttled).await?;
        body.ok_or_else(|| Error::NotFound {
            coflow_id: desc.data_id.coflow_id.clone(),
            flow_id: desc.data_id.flow_id.clone(),
        })
    }

    // ---- misc ----

    /// Fire-and-forget removal of a single flow.
    pub async fn delete_flow(&self, flow_id: &str, coflow_id: &str) -> Result<()> {
        self.wait_for_registration().await?;
        self.send_cmd(ClientCmd::DeleteFlow {
            flow_id: flow_id.to_string(),
            coflow_id: coflow_id.to_string(),
        })
        .await
    }

    /// The `count` hosts with the least loaded ingress, ascending.
    /// `adjust_bytes` accounts for a transfer the caller is about to start.
    pub async fn get_best_rx_machines(&self, count: u32, adjust_bytes: u64) -> Result<Vec<String>> {
        self.best_machines(true, count, adjust_bytes).await
    }

    pub async fn get_best_rx_machine(&self, adjust_bytes: u64) -> Result<Option<String>> {
        Ok(self.best_machines(true, 1, adjust_bytes).await?.into_iter().next())
    }

    /// Symmetric for egress.
    pub async fn get_best_tx_machines(&self, count: u32, adjust_bytes: u64) -> Result<Vec<String>> {
        self.best_machines(false, count, adjust_bytes).await
    }

    pub async fn get_best_tx_machine(&self, adjust_bytes: u64) -> Result<Option<String>> {
        Ok(self.best_machines(false, 1, adjust_bytes).await?.into_iter().next())
    }

    async fn best_machines(&self, rx: bool, count: u32, adjust_bytes: u64) -> Result<Vec<String>> {
        self.wait_for_registration().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ask(
            ClientCmd::BestMachines {
                rx,
                count,
                adjust_bytes,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Graceful stop: announces `StopClient` and tears the driver down.
    /// Failures are swallowed; the coordinator also reacts to the dropped
    /// connection.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(ClientCmd::Stop { reply_tx }).await.is_err() {
            return;
        }
        let _ = tokio::time::timeout(self.ask_timeout, reply_rx).await;
    }
}
