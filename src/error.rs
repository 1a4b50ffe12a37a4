//! Error taxonomy shared by the coordinator, agents and the client library

use std::time::Duration;

use thiserror::Error;

use crate::model::DataType;

/// Errors surfaced by the fabric.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed URL, duplicate slave id, missing mandatory argument.
    /// Fatal at process start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Peer unreachable at registration or connection dropped mid-session.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Unknown tag or malformed payload on a control or data connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `GetFlow` for an unknown `(coflow, flow)` pair.
    #[error("flow {flow_id} in coflow {coflow_id} not found")]
    NotFound { coflow_id: String, flow_id: String },

    /// The flow exists but its data type does not match the requested one.
    #[error("data type mismatch: requested {requested:?}, flow is {actual:?}")]
    TypeMismatch { requested: DataType, actual: DataType },

    /// A synchronous ask exceeded its timeout.
    #[error("ask timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_cbor::Error),
}

impl Error {
    /// Whether this error should terminate the owning process
    /// (coordinator/agent policy; the client survives and reports).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::Connectivity(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(Error::Configuration("bad url".into()).is_fatal());
        assert!(Error::Connectivity("master gone".into()).is_fatal());
        assert!(
            !Error::NotFound {
                coflow_id: "cf1".into(),
                flow_id: "f1".into()
            }
            .is_fatal()
        );
        assert!(!Error::Timeout(Duration::from_secs(5)).is_fatal());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(Error::Timeout(Duration::from_millis(10)).is_timeout());
        assert!(!Error::Protocol("junk tag".into()).is_timeout());
    }
}
