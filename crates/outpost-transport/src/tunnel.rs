//! Tunnel multiplexing over a connection

use crate::connection::Connection;
use bytes::Bytes;
use outpost_proto::{Envelope, MessageKind, TunnelData, TunnelId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum number of concurrently open tunnels on one connection
pub const MAX_TUNNELS: usize = 4096;

/// Tunnel errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Tunnel {0} is closed")]
    Closed(TunnelId),

    #[error("Tunnel {0} not found")]
    NotFound(TunnelId),

    #[error("Tunnel {0} already exists")]
    AlreadyExists(TunnelId),

    #[error("No tunnel ids available")]
    Exhausted,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Tunnel data receiver
pub type TunnelReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Tunnel data sender
type TunnelSender = mpsc::UnboundedSender<Bytes>;

/// Routing table from tunnel id to the reader side of each tunnel
#[derive(Debug)]
pub struct TunnelTable {
    tunnels: HashMap<TunnelId, TunnelSender>,
    next_id: TunnelId,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self {
            tunnels: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate the next free id, skipping ids still in use
    pub fn allocate(&mut self) -> Result<(TunnelId, TunnelReceiver), TunnelError> {
        if self.tunnels.len() >= MAX_TUNNELS {
            return Err(TunnelError::Exhausted);
        }

        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);

            if !self.tunnels.contains_key(&id) {
                let (tx, rx) = mpsc::unbounded_channel();
                self.tunnels.insert(id, tx);
                return Ok((id, rx));
            }
        }
    }

    /// Register an id chosen by the peer
    pub fn register(&mut self, id: TunnelId) -> Result<TunnelReceiver, TunnelError> {
        if self.tunnels.contains_key(&id) {
            return Err(TunnelError::AlreadyExists(id));
        }
        if self.tunnels.len() >= MAX_TUNNELS {
            return Err(TunnelError::Exhausted);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.tunnels.insert(id, tx);
        Ok(rx)
    }

    /// Hand a chunk to its tunnel. A closing chunk removes the tunnel after
    /// its data is delivered.
    pub fn deliver(&mut self, chunk: TunnelData) -> Result<(), TunnelError> {
        let id = chunk.tunnel_id;
        let tx = self.tunnels.get(&id).ok_or(TunnelError::NotFound(id))?;

        if !chunk.data.is_empty() && tx.send(Bytes::from(chunk.data)).is_err() {
            // Reader is gone
            self.tunnels.remove(&id);
            return Err(TunnelError::Closed(id));
        }

        if chunk.closed {
            self.tunnels.remove(&id);
            debug!(tunnel_id = id, "Tunnel closed by peer");
        }

        Ok(())
    }

    pub fn remove(&mut self, id: TunnelId) -> bool {
        self.tunnels.remove(&id).is_some()
    }

    pub fn contains(&self, id: TunnelId) -> bool {
        self.tunnels.contains_key(&id)
    }

    /// Drop every tunnel so blocked readers see end-of-stream
    pub fn close_all(&mut self) -> usize {
        let count = self.tunnels.len();
        self.tunnels.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl Default for TunnelTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One logical byte stream carried by a connection
pub struct Tunnel {
    tunnel_id: TunnelId,
    connection: Arc<Connection>,
    rx: TunnelReceiver,
    sequence: u64,
}

impl Tunnel {
    pub(crate) fn new(tunnel_id: TunnelId, connection: Arc<Connection>, rx: TunnelReceiver) -> Self {
        Self {
            tunnel_id,
            connection,
            rx,
            sequence: 0,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.tunnel_id
    }

    /// Next chunk from the peer, or None once the tunnel or its connection closes
    pub async fn read(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub async fn write(&mut self, data: Bytes) -> Result<(), TunnelError> {
        if !self.connection.has_tunnel(self.tunnel_id) {
            return Err(TunnelError::Closed(self.tunnel_id));
        }

        trace!(tunnel_id = self.tunnel_id, bytes = data.len(), "Tunnel write");
        self.send_chunk(data.to_vec(), false).await
    }

    /// Close this tunnel and tell the peer. The connection stays open.
    pub async fn close(mut self) -> Result<(), TunnelError> {
        if !self.connection.release_tunnel(self.tunnel_id) {
            return Ok(());
        }

        debug!(tunnel_id = self.tunnel_id, "Closing tunnel");
        match self.send_chunk(Vec::new(), true).await {
            Err(TunnelError::Closed(_)) => Ok(()),
            other => other,
        }
    }

    async fn send_chunk(&mut self, data: Vec<u8>, closed: bool) -> Result<(), TunnelError> {
        let chunk = TunnelData {
            tunnel_id: self.tunnel_id,
            sequence: self.sequence,
            data,
            closed,
        };
        self.sequence += 1;

        let envelope = Envelope::request(MessageKind::TunnelData, &chunk)
            .map_err(|_| TunnelError::Closed(self.tunnel_id))?;

        self.connection
            .send(envelope)
            .await
            .map_err(|_| TunnelError::Closed(self.tunnel_id))
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.connection.release_tunnel(self.tunnel_id);
    }
}
