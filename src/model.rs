//! Core data model: flows, coflows and the membership records kept by the
//! coordinator catalog.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Globally unique name of one flow: `(coflow id, flow id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataIdentifier {
    pub coflow_id: String,
    pub flow_id: String,
}

impl DataIdentifier {
    pub fn new(coflow_id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self {
            coflow_id: coflow_id.into(),
            flow_id: flow_id.into(),
        }
    }
}

impl std::fmt::Display for DataIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.coflow_id, self.flow_id)
    }
}

/// Where the bytes of a flow originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    InMemory,
    OnDisk,
    Fake,
}

/// The central record describing one flow.
///
/// `ObjectDescription` and `FileDescription` from the original design are the
/// [`FlowDescription::object`] and [`FlowDescription::file`] refinements; the
/// wire carries the explicit [`DataType`] discriminant, so no subtype
/// dispatch is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDescription {
    pub data_id: DataIdentifier,
    pub data_type: DataType,
    pub size_in_bytes: u64,
    /// Expected fan-out: the coflow finishes once every flow reached this
    /// many distinct receivers.
    pub num_receivers: u32,
    pub origin_host: String,
    pub origin_port: u16,
    /// Only for [`DataType::OnDisk`] flows.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path_to_file: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub length: u64,
    /// Carried opaquely for [`DataType::InMemory`] flows.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub class_name: Option<String>,
}

impl FlowDescription {
    /// An in-memory flow served from the publishing client's object table.
    pub fn object(
        data_id: DataIdentifier,
        size_in_bytes: u64,
        num_receivers: u32,
        origin_host: impl Into<String>,
        origin_port: u16,
        class_name: Option<String>,
    ) -> Self {
        Self {
            data_id,
            data_type: DataType::InMemory,
            size_in_bytes,
            num_receivers,
            origin_host: origin_host.into(),
            origin_port,
            path_to_file: None,
            offset: 0,
            length: size_in_bytes,
            class_name,
        }
    }

    /// An on-disk flow served by the host agent from a file window.
    pub fn file(
        data_id: DataIdentifier,
        path_to_file: impl Into<String>,
        offset: u64,
        length: u64,
        num_receivers: u32,
        origin_host: impl Into<String>,
        origin_port: u16,
    ) -> Self {
        Self {
            data_id,
            data_type: DataType::OnDisk,
            size_in_bytes: length,
            num_receivers,
            origin_host: origin_host.into(),
            origin_port,
            path_to_file: Some(path_to_file.into()),
            offset,
            length,
            class_name: None,
        }
    }

    /// A synthetic flow of deterministic bytes, for testing and benchmarks.
    pub fn fake(
        data_id: DataIdentifier,
        size_in_bytes: u64,
        num_receivers: u32,
        origin_host: impl Into<String>,
        origin_port: u16,
    ) -> Self {
        Self {
            data_id,
            data_type: DataType::Fake,
            size_in_bytes,
            num_receivers,
            origin_host: origin_host.into(),
            origin_port,
            path_to_file: None,
            offset: 0,
            length: size_in_bytes,
            class_name: None,
        }
    }
}

/// User-supplied coflow metadata, stored verbatim by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoflowDescription {
    pub name: String,
    /// Priority hint for the rate policy; larger means more urgent.
    #[serde(default)]
    pub priority: i32,
    /// Expected total size in bytes, if the application knows it.
    #[serde(default)]
    pub expected_size_bytes: u64,
    /// Soft deadline hint in milliseconds, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deadline_ms: Option<u64>,
}

impl CoflowDescription {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Lifecycle of a coflow in the coordinator catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoflowState {
    Registered,
    Running,
    Finished,
}

/// A registered client, as tracked by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub client_id: String,
    pub name: String,
    pub host: String,
    pub comm_port: u16,
    /// The local agent this client is bound to, by host match.
    pub slave_id: String,
}

/// A registered per-host agent, as tracked by the coordinator.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub slave_id: String,
    pub host: String,
    pub port: u16,
    pub web_ui_port: u16,
    pub comm_port: u16,
    pub public_host: String,
    /// Last measured ingress rate, bytes per second.
    pub last_rx_bps: f64,
    /// Last measured egress rate, bytes per second.
    pub last_tx_bps: f64,
    pub last_heartbeat_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_identifier_display() {
        let id = DataIdentifier::new("cf1", "f1");
        assert_eq!(id.to_string(), "cf1/f1");
    }

    #[test]
    fn test_flow_refinements() {
        let obj = FlowDescription::object(
            DataIdentifier::new("cf1", "k1"),
            4,
            1,
            "h1",
            9000,
            Some("Vec<u8>".to_string()),
        );
        assert_eq!(obj.data_type, DataType::InMemory);
        assert_eq!(obj.length, 4);

        let file = FlowDescription::file(DataIdentifier::new("cf1", "k2"), "/tmp/x", 16, 128, 2, "h1", 9000);
        assert_eq!(file.data_type, DataType::OnDisk);
        assert_eq!(file.size_in_bytes, 128);
        assert_eq!(file.offset, 16);
        assert_eq!(file.path_to_file.as_deref(), Some("/tmp/x"));

        let fake = FlowDescription::fake(DataIdentifier::new("cf1", "k3"), 1024, 2, "h1", 9000);
        assert_eq!(fake.data_type, DataType::Fake);
        assert!(fake.path_to_file.is_none());
    }

    #[test]
    fn test_flow_description_roundtrip() {
        let desc = FlowDescription::file(DataIdentifier::new("cf9", "f9"), "/data/blob", 0, 4096, 3, "h2", 7077);
        let bytes = serde_cbor::to_vec(&desc).unwrap();
        let back: FlowDescription = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_coflow_description_defaults() {
        let desc = CoflowDescription::named("shuffle-17");
        assert_eq!(desc.priority, 0);
        assert_eq!(desc.expected_size_bytes, 0);
        assert!(desc.deadline_ms.is_none());
    }
}
