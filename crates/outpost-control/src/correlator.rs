//! Request/response correlation over a session's connection
//!
//! Each request gets a fresh correlation id and a one-shot slot in the
//! session's pending table. The slot is removed exactly once by a guard,
//! whether the call ends with a reply, a timeout, a send failure or the
//! caller being cancelled.

use crate::pending_requests::PendingRequests;
use crate::session::Session;
use outpost_proto::{CodecError, Envelope, MessageKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default time to wait for an agent's reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Please select an active session via `use`")]
    NoActiveSession,

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?} waiting for a reply")]
    Timeout(Duration),

    #[error("Session connection closed")]
    Closed,

    #[error("Agent error: {0}")]
    Remote(String),

    #[error("Failed to encode request: {0}")]
    Encode(CodecError),

    #[error("Failed to decode reply: {0}")]
    Decode(CodecError),

    #[error("Correlation id already pending: {0}")]
    DuplicateId(String),
}

/// Removes the pending slot when the request ends, however it ends
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(&self.id);
    }
}

/// Issues requests against sessions and waits for matching replies
#[derive(Debug, Clone)]
pub struct Correlator {
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `data` as a `kind` request and wait for the reply envelope.
    ///
    /// Without a session nothing is sent and `NoActiveSession` is returned.
    pub async fn request(
        &self,
        session: Option<&Arc<Session>>,
        kind: &str,
        data: Vec<u8>,
    ) -> Result<Envelope, RequestError> {
        let session = session.ok_or(RequestError::NoActiveSession)?;
        let connection = session.connection();
        if connection.is_closed() {
            return Err(RequestError::Closed);
        }

        let id = Uuid::new_v4().to_string();
        let rx = session
            .pending()
            .register(&id)
            .ok_or_else(|| RequestError::DuplicateId(id.clone()))?;
        let _guard = PendingGuard {
            pending: session.pending(),
            id: id.clone(),
        };

        debug!(session_id = session.id(), kind = %kind, id = %id, "Sending request");

        let envelope = Envelope::new(kind, data).with_id(id.clone());
        let exchange = async {
            connection
                .send(envelope)
                .await
                .map_err(|_| RequestError::Closed)?;
            rx.await.map_err(|_| RequestError::Closed)
        };

        let reply = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(session_id = session.id(), kind = %kind, id = %id, "Request timed out");
                return Err(RequestError::Timeout(self.timeout));
            }
        };

        if reply.kind != kind {
            warn!(
                session_id = session.id(),
                id = %id,
                expected = %kind,
                received = %reply.kind,
                "Reply kind does not match request"
            );
            return Err(RequestError::Decode(CodecError::UnexpectedKind {
                expected: kind.to_string(),
                received: reply.kind,
            }));
        }

        if let Some(error) = reply.error {
            return Err(RequestError::Remote(error));
        }

        Ok(reply)
    }

    /// Typed request: encode `payload`, decode the reply body as `Resp`
    pub async fn call<Req, Resp>(
        &self,
        session: Option<&Arc<Session>>,
        kind: MessageKind,
        payload: &Req,
    ) -> Result<Resp, RequestError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let request = Envelope::request(kind, payload).map_err(RequestError::Encode)?;
        let reply = self.request(session, &request.kind, request.data).await?;
        reply.decode_payload().map_err(RequestError::Decode)
    }

    /// Fire-and-forget: queue the envelope without waiting for a reply
    pub async fn notify<Req: Serialize>(
        &self,
        session: Option<&Arc<Session>>,
        kind: MessageKind,
        payload: &Req,
    ) -> Result<(), RequestError> {
        let session = session.ok_or(RequestError::NoActiveSession)?;
        let envelope = Envelope::request(kind, payload).map_err(RequestError::Encode)?;

        session
            .connection()
            .send(envelope)
            .await
            .map_err(|_| RequestError::Closed)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}
