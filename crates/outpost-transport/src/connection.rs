//! Framed connection over a single byte stream

use crate::tunnel::{Tunnel, TunnelError, TunnelTable};
use futures::{SinkExt, StreamExt};
use outpost_proto::{CodecError, Envelope, EnvelopeCodec, TunnelData, TunnelId, MAX_ENVELOPE_SIZE};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, trace, warn};

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Send queue is full")]
    QueueFull,
}

/// Why a connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream at a frame boundary
    Eof,
    /// Read or write on the underlying stream failed
    Transport(String),
    /// Peer sent a malformed or truncated frame
    Decode(String),
    /// `close()` was called locally
    Local,
}

impl CloseReason {
    fn from_codec(err: &CodecError) -> Self {
        if err.is_transport() {
            CloseReason::Transport(err.to_string())
        } else {
            CloseReason::Decode(err.to_string())
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "end of stream"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Decode(e) => write!(f, "decode error: {}", e),
            CloseReason::Local => write!(f, "closed locally"),
        }
    }
}

/// Queue sizes and frame limits for one connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Envelopes waiting for the outbound loop
    pub send_queue_capacity: usize,
    /// Envelopes decoded but not yet consumed by `receive()`
    pub recv_queue_capacity: usize,
    pub max_envelope_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 64,
            recv_queue_capacity: 64,
            max_envelope_size: MAX_ENVELOPE_SIZE,
        }
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

struct ConnectionState {
    tunnels: TunnelTable,
    hooks: Vec<CloseHook>,
    close_reason: Option<CloseReason>,
}

/// One physical link to one agent
///
/// Two background tasks service the stream: the outbound loop writes queued
/// envelopes in FIFO order and the inbound loop publishes decoded envelopes to
/// the receive queue, routing tunnel traffic to its tunnel instead. Whichever
/// loop fails first triggers cleanup; cleanup runs exactly once.
pub struct Connection {
    remote_addr: String,
    send_tx: mpsc::Sender<Envelope>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Take ownership of `stream` and spawn its send and receive loops
    pub fn start<S>(stream: S, remote_addr: impl Into<String>, config: ConnectionConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let connection = Arc::new(Self {
            remote_addr: remote_addr.into(),
            send_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            shutdown_tx,
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                tunnels: TunnelTable::new(),
                hooks: Vec::new(),
                close_reason: None,
            }),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let codec = EnvelopeCodec::with_max_size(config.max_envelope_size);
        let reader = FramedRead::new(read_half, codec);
        let writer = FramedWrite::new(write_half, codec);

        tokio::spawn(outbound_loop(
            connection.clone(),
            writer,
            send_rx,
            connection.shutdown_tx.subscribe(),
        ));
        tokio::spawn(inbound_loop(
            connection.clone(),
            reader,
            recv_tx,
            connection.shutdown_tx.subscribe(),
        ));

        debug!(remote_addr = %connection.remote_addr, "Connection started");
        connection
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reason recorded by whichever side tore the connection down first
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state().close_reason.clone()
    }

    /// Queue an envelope, waiting for queue capacity
    pub async fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        trace!(kind = %envelope.kind, id = %envelope.id, "Queueing envelope");
        self.send_tx
            .send(envelope)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Queue an envelope without waiting
    pub fn try_send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        self.send_tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Next inbound non-tunnel envelope, or None once the connection is closed
    /// and the receive queue is drained
    pub async fn receive(&self) -> Option<Envelope> {
        self.recv_rx.lock().await.recv().await
    }

    /// Tear the connection down
    pub fn close(&self) -> bool {
        self.cleanup(CloseReason::Local)
    }

    /// Run teardown once. Returns whether this call performed it.
    pub fn cleanup(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let (hooks, tunnels) = {
            let mut state = self.state();
            state.close_reason.get_or_insert(reason.clone());
            let tunnels = state.tunnels.close_all();
            (std::mem::take(&mut state.hooks), tunnels)
        };

        let _ = self.shutdown_tx.send(true);

        debug!(
            remote_addr = %self.remote_addr,
            reason = %reason,
            tunnels,
            "Connection closed"
        );

        for hook in hooks {
            hook();
        }

        true
    }

    /// Register a hook to run during cleanup.
    ///
    /// If the connection is already closed the hook runs immediately.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state();
            if !self.is_closed() {
                state.hooks.push(Box::new(hook));
                return;
            }
        }

        hook();
    }

    /// Open a tunnel with a locally allocated id
    pub fn open_tunnel(self: &Arc<Self>) -> Result<Tunnel, TunnelError> {
        let mut state = self.state();
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }

        let (tunnel_id, rx) = state.tunnels.allocate()?;
        debug!(tunnel_id, "Opened tunnel");
        Ok(Tunnel::new(tunnel_id, self.clone(), rx))
    }

    /// Register a tunnel id chosen by the peer
    pub fn accept_tunnel(self: &Arc<Self>, tunnel_id: TunnelId) -> Result<Tunnel, TunnelError> {
        let mut state = self.state();
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }

        let rx = state.tunnels.register(tunnel_id)?;
        debug!(tunnel_id, "Accepted tunnel");
        Ok(Tunnel::new(tunnel_id, self.clone(), rx))
    }

    pub fn tunnel_count(&self) -> usize {
        self.state().tunnels.len()
    }

    pub(crate) fn has_tunnel(&self, tunnel_id: TunnelId) -> bool {
        self.state().tunnels.contains(tunnel_id)
    }

    pub(crate) fn release_tunnel(&self, tunnel_id: TunnelId) -> bool {
        self.state().tunnels.remove(tunnel_id)
    }

    fn route_tunnel(&self, envelope: Envelope) {
        let chunk: TunnelData = match envelope.decode_payload() {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(remote_addr = %self.remote_addr, "Dropping malformed tunnel data: {}", e);
                return;
            }
        };

        let tunnel_id = chunk.tunnel_id;
        let sequence = chunk.sequence;
        if let Err(e) = self.state().tunnels.deliver(chunk) {
            warn!(remote_addr = %self.remote_addr, tunnel_id, "Dropping tunnel data: {}", e);
            return;
        }

        trace!(tunnel_id, sequence, "Routed tunnel data");
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn outbound_loop<S>(
    connection: Arc<Connection>,
    mut writer: FramedWrite<WriteHalf<S>, EnvelopeCodec>,
    mut send_rx: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let reason = loop {
        tokio::select! {
            biased;

            envelope = send_rx.recv() => {
                let Some(envelope) = envelope else {
                    break CloseReason::Local;
                };

                if let Err(reason) = write_envelope(&mut writer, envelope).await {
                    break reason;
                }
            }
            _ = shutdown.changed() => {
                // Flush what was queued before the shutdown signal
                send_rx.close();
                while let Ok(envelope) = send_rx.try_recv() {
                    if write_envelope(&mut writer, envelope).await.is_err() {
                        break;
                    }
                }
                break CloseReason::Local;
            }
        }
    };

    if let Err(e) = writer.close().await {
        trace!("Error closing writer: {}", e);
    }

    connection.cleanup(reason);
}

async fn write_envelope<S>(
    writer: &mut FramedWrite<WriteHalf<S>, EnvelopeCodec>,
    envelope: Envelope,
) -> Result<(), CloseReason>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let kind = envelope.kind.clone();
    match writer.send(envelope).await {
        Ok(()) => {
            trace!(kind = %kind, "Wrote envelope");
            Ok(())
        }
        Err(e) if e.is_transport() => {
            error!("Write failed: {}", e);
            Err(CloseReason::from_codec(&e))
        }
        Err(e) => {
            // Nothing reached the wire, the stream is still aligned
            error!(kind = %kind, "Dropping unencodable envelope: {}", e);
            Ok(())
        }
    }
}

async fn inbound_loop<S>(
    connection: Arc<Connection>,
    mut reader: FramedRead<ReadHalf<S>, EnvelopeCodec>,
    recv_tx: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let reason = loop {
        let next = tokio::select! {
            next = reader.next() => next,
            _ = shutdown.changed() => break CloseReason::Local,
        };

        let envelope = match next {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                warn!(remote_addr = %connection.remote_addr, "Read failed: {}", e);
                break CloseReason::from_codec(&e);
            }
            None => break CloseReason::Eof,
        };

        if envelope.is_tunnel() {
            connection.route_tunnel(envelope);
            continue;
        }

        debug!(kind = %envelope.kind, id = %envelope.id, "Received envelope");

        tokio::select! {
            sent = recv_tx.send(envelope) => {
                if sent.is_err() {
                    break CloseReason::Local;
                }
            }
            _ = shutdown.changed() => break CloseReason::Local,
        }
    };

    connection.cleanup(reason);
}
