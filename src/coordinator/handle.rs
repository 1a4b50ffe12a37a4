//! In-process handle to a running coordinator

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::coordinator::catalog::CatalogSummary;
use crate::coordinator::core::CoordEvent;
use crate::error::{Error, Result};

/// Cloneable handle for inspecting and stopping a coordinator from the same
/// process (the launcher, tests). Remote peers use the wire protocol.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordEvent>,
    ask_timeout: Duration,
}

impl CoordinatorHandle {
    pub(crate) fn new(tx: mpsc::Sender<CoordEvent>, ask_timeout: Duration) -> Self {
        Self { tx, ask_timeout }
    }

    /// Current catalog digest: agents with liveness, clients, coflows with
    /// per-flow receiver counts.
    pub async fn summary(&self) -> Result<CatalogSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordEvent::Inspect { reply_tx })
            .await
            .map_err(|_| Error::Connectivity("coordinator mailbox closed".into()))?;
        match tokio::time::timeout(self.ask_timeout, reply_rx).await {
            Err(_) => Err(Error::Timeout(self.ask_timeout)),
            Ok(Err(_)) => Err(Error::Connectivity("coordinator shut down".into())),
            Ok(Ok(summary)) => Ok(summary),
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoordEvent::Shutdown).await;
    }
}
