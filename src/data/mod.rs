//! Bulk data service: one framed request, one framed reply, close.
//!
//! The same server runs inside the host agent (fake and on-disk flows) and
//! inside every client (in-memory flows published by `put_object`). Unknown
//! or unservable flows answer with the empty reply rather than an error;
//! the requesting side surfaces that as not-found.

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{DataIdentifier, DataType, FlowDescription};
use crate::proto::wire;

/// Objects published by a client, keyed by flow identity. Entries are only
/// ever inserted and removed, never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    objects: Arc<Mutex<HashMap<DataIdentifier, Arc<Vec<u8>>>>>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, data_id: DataIdentifier, bytes: Vec<u8>) {
        self.objects
            .lock()
            .expect("object store lock")
            .insert(data_id, Arc::new(bytes));
    }

    pub fn remove(&self, data_id: &DataIdentifier) {
        self.objects.lock().expect("object store lock").remove(data_id);
    }

    /// Drop every object belonging to the given coflow.
    pub fn remove_coflow(&self, coflow_id: &str) {
        self.objects
            .lock()
            .expect("object store lock")
            .retain(|id, _| id.coflow_id != coflow_id);
    }

    pub fn get(&self, data_id: &DataIdentifier) -> Option<Arc<Vec<u8>>> {
        self.objects.lock().expect("object store lock").get(data_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("object store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The synthetic payload for fake flows: `b[i] = i mod 256`.
pub fn fake_pattern(size_in_bytes: u64) -> Vec<u8> {
    (0..size_in_bytes).map(|i| (i % 256) as u8).collect()
}

/// Read `[offset, offset + length)` of a file through a memory map.
/// Windows reaching outside the file are rejected, never truncated.
pub fn read_file_window(path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let end = offset
        .checked_add(length)
        .ok_or_else(|| Error::Protocol(format!("file window overflows: {offset}+{length}")))?;
    if end > file_len {
        return Err(Error::Protocol(format!(
            "file window [{offset}, {end}) outside {path} ({file_len} bytes)"
        )));
    }
    if length == 0 {
        return Ok(Vec::new());
    }
    // Safety: the mapping is dropped before this function returns and the
    // bytes are copied out; concurrent truncation is the publisher's bug.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap[offset as usize..end as usize].to_vec())
}

/// Serves the data-plane protocol on one listener.
#[derive(Debug, Clone)]
pub struct DataServer {
    /// Present only in clients; agents never serve in-memory flows.
    objects: Option<ObjectStore>,
}

impl DataServer {
    /// An agent-side server: fake and on-disk flows only.
    pub fn new() -> Self {
        Self { objects: None }
    }

    /// A client-side server additionally answering in-memory flows from the
    /// client's object table.
    pub fn with_objects(objects: ObjectStore) -> Self {
        Self {
            objects: Some(objects),
        }
    }

    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "data connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_one(stream).await {
                            warn!(%addr, error = %e, "data connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "data accept failed");
                    return;
                }
            }
        }
    }

    async fn serve_one(&self, mut stream: TcpStream) -> Result<()> {
        let Some(desc) = wire::read_get_request(&mut stream).await? else {
            return Ok(());
        };
        debug!(data_id = %desc.data_id, data_type = ?desc.data_type, "serving flow");

        match self.load(&desc) {
            Ok(Some(bytes)) => wire::write_data_response(&mut stream, Some(&bytes)).await,
            Ok(None) => wire::write_data_response(&mut stream, None).await,
            Err(e) => {
                warn!(data_id = %desc.data_id, error = %e, "flow not servable");
                wire::write_data_response(&mut stream, None).await
            }
        }
    }

    fn load(&self, desc: &FlowDescription) -> Result<Option<Arc<Vec<u8>>>> {
        if desc.size_in_bytes > wire::MAX_DATA_BYTES {
            return Err(Error::Protocol(format!("flow too large: {} bytes", desc.size_in_bytes)));
        }
        match desc.data_type {
            DataType::Fake => Ok(Some(Arc::new(fake_pattern(desc.size_in_bytes)))),
            DataType::OnDisk => {
                let path = desc
                    .path_to_file
                    .as_deref()
                    .ok_or_else(|| Error::Protocol("on-disk flow without a path".into()))?;
                Ok(Some(Arc::new(read_file_window(path, desc.offset, desc.length)?)))
            }
            DataType::InMemory => match &self.objects {
                Some(store) => Ok(store.get(&desc.data_id)),
                None => Ok(None),
            },
        }
    }
}

impl Default for DataServer {
    fn default() -> Self {
        Self::new()
    }
}
