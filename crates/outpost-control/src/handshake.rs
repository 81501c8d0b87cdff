//! Agent registration handshake

use outpost_proto::{CodecError, MessageKind, Register};
use outpost_transport::Connection;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("No registration received within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed before registration")]
    Closed,

    #[error("Expected a register envelope, got {0}")]
    UnexpectedKind(String),

    #[error("Invalid registration payload: {0}")]
    Decode(#[from] CodecError),
}

/// Wait for the agent's first envelope and decode it as a registration.
///
/// Anything other than `register` as the first envelope is rejected; the
/// caller is expected to close the connection on error.
pub async fn register_session(
    connection: &Arc<Connection>,
    timeout: Duration,
) -> Result<Register, HandshakeError> {
    let envelope = tokio::time::timeout(timeout, connection.receive())
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
        .ok_or(HandshakeError::Closed)?;

    if envelope.message_kind() != Some(MessageKind::Register) {
        return Err(HandshakeError::UnexpectedKind(envelope.kind));
    }

    let register: Register = envelope.decode_payload()?;
    debug!(
        remote_address = %connection.remote_addr(),
        name = %register.name,
        hostname = %register.hostname,
        "Agent registered"
    );

    Ok(register)
}
