//! Control-plane message set.
//!
//! Every message travels as `{ tag: u16, payload: CBOR }` inside a
//! length-prefixed frame (see [`crate::proto::wire`]). Tag values are stable
//! wire identifiers and must never be renumbered.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{CoflowDescription, FlowDescription};

pub const TAG_REGISTER_SLAVE: u16 = 0x01;
pub const TAG_REGISTER_CLIENT: u16 = 0x02;
pub const TAG_HEARTBEAT: u16 = 0x03;
pub const TAG_REGISTER_COFLOW: u16 = 0x04;
pub const TAG_UNREGISTER_COFLOW: u16 = 0x05;
pub const TAG_ADD_FLOW: u16 = 0x06;
pub const TAG_GET_FLOW: u16 = 0x07;
pub const TAG_DELETE_FLOW: u16 = 0x08;
pub const TAG_UPDATED_RATES: u16 = 0x09;
pub const TAG_REQUEST_BEST_RX: u16 = 0x0A;
pub const TAG_REQUEST_BEST_TX: u16 = 0x0B;
pub const TAG_STOP_CLIENT: u16 = 0x0C;
pub const TAG_REQUEST_SLAVE_STATE: u16 = 0x0D;
pub const TAG_END_GET: u16 = 0x0E;
pub const TAG_REGISTERED_SLAVE: u16 = 0x11;
pub const TAG_REGISTER_SLAVE_FAILED: u16 = 0x12;
pub const TAG_REGISTERED_CLIENT: u16 = 0x13;
pub const TAG_REGISTERED_COFLOW: u16 = 0x14;
pub const TAG_GOT_FLOW_DESC: u16 = 0x17;
pub const TAG_BEST_RX_MACHINES: u16 = 0x1A;
pub const TAG_BEST_TX_MACHINES: u16 = 0x1B;
pub const TAG_SLAVE_STATE: u16 = 0x1D;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSlave {
    pub slave_id: String,
    pub host: String,
    pub port: u16,
    pub web_ui_port: u16,
    pub comm_port: u16,
    pub public_host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredSlave {
    pub web_ui_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSlaveFailed {
    pub message: String,
}

/// Sent by a client to the coordinator (`client_id: None`; the coordinator
/// allocates one) and again to its local agent (`client_id: Some`) so the
/// agent can attribute relayed control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterClient {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    pub name: String,
    pub host: String,
    pub comm_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    pub slave_id: String,
    pub slave_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub slave_id: String,
    /// Bytes per second over the last sampling window.
    pub rx_bps: f64,
    pub tx_bps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterCoflow {
    pub client_id: String,
    pub desc: CoflowDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredCoflow {
    pub coflow_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterCoflow {
    pub coflow_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFlow {
    pub desc: FlowDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetFlow {
    pub flow_id: String,
    pub coflow_id: String,
    pub client_id: String,
    pub slave_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GotFlowDesc {
    /// `None` is the catalog-miss reply.
    pub desc: Option<FlowDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteFlow {
    pub flow_id: String,
    pub coflow_id: String,
}

/// A client's transfer of this flow finished (or was abandoned); the
/// coordinator retires the client from the rate-dispatch set and the agent
/// drops its receiver-side accounting. The fan-out counter is untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndGet {
    pub flow_id: String,
    pub coflow_id: String,
    pub client_id: String,
}

/// Periodic allocation push: `(flow, bits per second)` for every flow the
/// receiving client is currently pulling and the policy rated positively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedRates {
    pub rates: Vec<(FlowDescription, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBestMachines {
    pub count: u32,
    /// Pending-transfer adjustment, in bytes, added to each measured rate.
    pub adjust_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestMachines {
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopClient {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveStateEntry {
    pub slave_id: String,
    pub host: String,
    pub comm_port: u16,
    pub rx_bps: f64,
    pub tx_bps: f64,
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveState {
    pub agents: Vec<SlaveStateEntry>,
}

/// Every control-plane message, one variant per wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    RegisterSlave(RegisterSlave),
    RegisterClient(RegisterClient),
    Heartbeat(Heartbeat),
    RegisterCoflow(RegisterCoflow),
    UnregisterCoflow(UnregisterCoflow),
    AddFlow(AddFlow),
    GetFlow(GetFlow),
    EndGet(EndGet),
    DeleteFlow(DeleteFlow),
    UpdatedRates(UpdatedRates),
    RequestBestRxMachines(RequestBestMachines),
    RequestBestTxMachines(RequestBestMachines),
    StopClient(StopClient),
    RequestSlaveState,
    RegisteredSlave(RegisteredSlave),
    RegisterSlaveFailed(RegisterSlaveFailed),
    RegisteredClient(RegisteredClient),
    RegisteredCoflow(RegisteredCoflow),
    GotFlowDesc(GotFlowDesc),
    BestRxMachines(BestMachines),
    BestTxMachines(BestMachines),
    SlaveState(SlaveState),
}

impl ControlMessage {
    pub fn tag(&self) -> u16 {
        match self {
            ControlMessage::RegisterSlave(_) => TAG_REGISTER_SLAVE,
            ControlMessage::RegisterClient(_) => TAG_REGISTER_CLIENT,
            ControlMessage::Heartbeat(_) => TAG_HEARTBEAT,
            ControlMessage::RegisterCoflow(_) => TAG_REGISTER_COFLOW,
            ControlMessage::UnregisterCoflow(_) => TAG_UNREGISTER_COFLOW,
            ControlMessage::AddFlow(_) => TAG_ADD_FLOW,
            ControlMessage::GetFlow(_) => TAG_GET_FLOW,
            ControlMessage::EndGet(_) => TAG_END_GET,
            ControlMessage::DeleteFlow(_) => TAG_DELETE_FLOW,
            ControlMessage::UpdatedRates(_) => TAG_UPDATED_RATES,
            ControlMessage::RequestBestRxMachines(_) => TAG_REQUEST_BEST_RX,
            ControlMessage::RequestBestTxMachines(_) => TAG_REQUEST_BEST_TX,
            ControlMessage::StopClient(_) => TAG_STOP_CLIENT,
            ControlMessage::RequestSlaveState => TAG_REQUEST_SLAVE_STATE,
            ControlMessage::RegisteredSlave(_) => TAG_REGISTERED_SLAVE,
            ControlMessage::RegisterSlaveFailed(_) => TAG_REGISTER_SLAVE_FAILED,
            ControlMessage::RegisteredClient(_) => TAG_REGISTERED_CLIENT,
            ControlMessage::RegisteredCoflow(_) => TAG_REGISTERED_COFLOW,
            ControlMessage::GotFlowDesc(_) => TAG_GOT_FLOW_DESC,
            ControlMessage::BestRxMachines(_) => TAG_BEST_RX_MACHINES,
            ControlMessage::BestTxMachines(_) => TAG_BEST_TX_MACHINES,
            ControlMessage::SlaveState(_) => TAG_SLAVE_STATE,
        }
    }

    /// Serialize the payload; the tag travels in the frame header.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            ControlMessage::RegisterSlave(p) => serde_cbor::to_vec(p)?,
            ControlMessage::RegisterClient(p) => serde_cbor::to_vec(p)?,
            ControlMessage::Heartbeat(p) => serde_cbor::to_vec(p)?,
            ControlMessage::RegisterCoflow(p) => serde_cbor::to_vec(p)?,
            ControlMessage::UnregisterCoflow(p) => serde_cbor::to_vec(p)?,
            ControlMessage::AddFlow(p) => serde_cbor::to_vec(p)?,
            ControlMessage::GetFlow(p) => serde_cbor::to_vec(p)?,
            ControlMessage::EndGet(p) => serde_cbor::to_vec(p)?,
            ControlMessage::DeleteFlow(p) => serde_cbor::to_vec(p)?,
            ControlMessage::UpdatedRates(p) => serde_cbor::to_vec(p)?,
            ControlMessage::RequestBestRxMachines(p) => serde_cbor::to_vec(p)?,
            ControlMessage::RequestBestTxMachines(p) => serde_cbor::to_vec(p)?,
            ControlMessage::StopClient(p) => serde_cbor::to_vec(p)?,
            ControlMessage::RequestSlaveState => Vec::new(),
            ControlMessage::RegisteredSlave(p) => serde_cbor::to_vec(p)?,
            ControlMessage::RegisterSlaveFailed(p) => serde_cbor::to_vec(p)?,
            ControlMessage::RegisteredClient(p) => serde_cbor::to_vec(p)?,
            ControlMessage::RegisteredCoflow(p) => serde_cbor::to_vec(p)?,
            ControlMessage::GotFlowDesc(p) => serde_cbor::to_vec(p)?,
            ControlMessage::BestRxMachines(p) => serde_cbor::to_vec(p)?,
            ControlMessage::BestTxMachines(p) => serde_cbor::to_vec(p)?,
            ControlMessage::SlaveState(p) => serde_cbor::to_vec(p)?,
        };
        Ok(bytes)
    }

    pub fn decode(tag: u16, payload: &[u8]) -> Result<Self> {
        let msg = match tag {
            TAG_REGISTER_SLAVE => ControlMessage::RegisterSlave(serde_cbor::from_slice(payload)?),
            TAG_REGISTER_CLIENT => ControlMessage::RegisterClient(serde_cbor::from_slice(payload)?),
            TAG_HEARTBEAT => ControlMessage::Heartbeat(serde_cbor::from_slice(payload)?),
            TAG_REGISTER_COFLOW => ControlMessage::RegisterCoflow(serde_cbor::from_slice(payload)?),
            TAG_UNREGISTER_COFLOW => ControlMessage::UnregisterCoflow(serde_cbor::from_slice(payload)?),
            TAG_ADD_FLOW => ControlMessage::AddFlow(serde_cbor::from_slice(payload)?),
            TAG_GET_FLOW => ControlMessage::GetFlow(serde_cbor::from_slice(payload)?),
            TAG_END_GET => ControlMessage::EndGet(serde_cbor::from_slice(payload)?),
            TAG_DELETE_FLOW => ControlMessage::DeleteFlow(serde_cbor::from_slice(payload)?),
            TAG_UPDATED_RATES => ControlMessage::UpdatedRates(serde_cbor::from_slice(payload)?),
            TAG_REQUEST_BEST_RX => ControlMessage::RequestBestRxMachines(serde_cbor::from_slice(payload)?),
            TAG_REQUEST_BEST_TX => ControlMessage::RequestBestTxMachines(serde_cbor::from_slice(payload)?),
            TAG_STOP_CLIENT => ControlMessage::StopClient(serde_cbor::from_slice(payload)?),
            TAG_REQUEST_SLAVE_STATE => ControlMessage::RequestSlaveState,
            TAG_REGISTERED_SLAVE => ControlMessage::RegisteredSlave(serde_cbor::from_slice(payload)?),
            TAG_REGISTER_SLAVE_FAILED => ControlMessage::RegisterSlaveFailed(serde_cbor::from_slice(payload)?),
            TAG_REGISTERED_CLIENT => ControlMessage::RegisteredClient(serde_cbor::from_slice(payload)?),
            TAG_REGISTERED_COFLOW => ControlMessage::RegisteredCoflow(serde_cbor::from_slice(payload)?),
            TAG_GOT_FLOW_DESC => ControlMessage::GotFlowDesc(serde_cbor::from_slice(payload)?),
            TAG_BEST_RX_MACHINES => ControlMessage::BestRxMachines(serde_cbor::from_slice(payload)?),
            TAG_BEST_TX_MACHINES => ControlMessage::BestTxMachines(serde_cbor::from_slice(payload)?),
            TAG_SLAVE_STATE => ControlMessage::SlaveState(serde_cbor::from_slice(payload)?),
            other => return Err(Error::Protocol(format!("unknown message tag 0x{other:02X}"))),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataIdentifier, FlowDescription};

    fn roundtrip(msg: ControlMessage) {
        let payload = msg.encode_payload().unwrap();
        let back = ControlMessage::decode(msg.tag(), &payload).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_tag_values_are_stable() {
        // Renumbering any of these breaks wire compatibility.
        let msg = ControlMessage::RegisterSlave(RegisterSlave {
            slave_id: "s1".into(),
            host: "h1".into(),
            port: 1607,
            web_ui_port: 16017,
            comm_port: 1608,
            public_host: "h1".into(),
        });
        assert_eq!(msg.tag(), 0x01);
        assert_eq!(ControlMessage::RequestSlaveState.tag(), 0x0D);
        assert_eq!(
            ControlMessage::EndGet(EndGet {
                flow_id: "f1".into(),
                coflow_id: "cf1".into(),
                client_id: "c1".into(),
            })
            .tag(),
            0x0E
        );
        assert_eq!(
            ControlMessage::GotFlowDesc(GotFlowDesc { desc: None }).tag(),
            0x17
        );
        assert_eq!(
            ControlMessage::BestTxMachines(BestMachines { hosts: vec![] }).tag(),
            0x1B
        );
    }

    #[test]
    fn test_payload_roundtrips() {
        let desc = FlowDescription::fake(DataIdentifier::new("cf1", "k2"), 1024, 2, "h2", 1608);

        roundtrip(ControlMessage::RegisterClient(RegisterClient {
            client_id: None,
            name: "reducer-3".into(),
            host: "h2".into(),
            comm_port: 40123,
        }));
        roundtrip(ControlMessage::Heartbeat(Heartbeat {
            slave_id: "s1".into(),
            rx_bps: 100.0,
            tx_bps: 50.5,
        }));
        roundtrip(ControlMessage::GetFlow(GetFlow {
            flow_id: "k2".into(),
            coflow_id: "cf1".into(),
            client_id: "CLIENT-000001".into(),
            slave_id: "s1".into(),
        }));
        roundtrip(ControlMessage::EndGet(EndGet {
            flow_id: "k2".into(),
            coflow_id: "cf1".into(),
            client_id: "CLIENT-000001".into(),
        }));
        roundtrip(ControlMessage::GotFlowDesc(GotFlowDesc {
            desc: Some(desc.clone()),
        }));
        roundtrip(ControlMessage::GotFlowDesc(GotFlowDesc { desc: None }));
        roundtrip(ControlMessage::UpdatedRates(UpdatedRates {
            rates: vec![(desc, 800.0)],
        }));
        roundtrip(ControlMessage::RequestSlaveState);
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        let err = ControlMessage::decode(0xFFFF, &[]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Protocol(_)));
    }

    #[test]
    fn test_malformed_payload_is_codec_error() {
        let err = ControlMessage::decode(TAG_HEARTBEAT, &[0x42, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Codec(_)));
    }
}
