//! Per-session inbound dispatch

use crate::session::Session;
use async_trait::async_trait;
use outpost_proto::Envelope;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives envelopes an agent sends without being asked
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UnsolicitedHandler: Send + Sync {
    async fn handle(&self, session: Arc<Session>, envelope: Envelope);
}

/// Drain a session's connection, completing pending requests by correlation id.
///
/// Envelopes without an id go to `handler` if one is installed. Replies whose
/// request already timed out are dropped. When the connection closes every
/// remaining waiter is failed.
pub fn spawn_dispatcher(
    session: Arc<Session>,
    handler: Option<Arc<dyn UnsolicitedHandler>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = session.connection().receive().await {
            if !envelope.id.is_empty() {
                let id = envelope.id.clone();
                if !session.pending().respond(&id, envelope) {
                    debug!(session_id = session.id(), id = %id, "Dropping late reply");
                }
                continue;
            }

            match &handler {
                Some(handler) => handler.handle(session.clone(), envelope).await,
                None => warn!(
                    session_id = session.id(),
                    kind = %envelope.kind,
                    "Dropping unsolicited envelope"
                ),
            }
        }

        let failed = session.pending().fail_all();
        debug!(session_id = session.id(), failed, "Dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{Correlator, RequestError};
    use crate::hive::Hive;
    use crate::session::NewSession;
    use futures::{SinkExt, StreamExt};
    use outpost_proto::EnvelopeCodec;
    use outpost_transport::{Connection, ConnectionConfig};
    use tokio_util::codec::Framed;

    fn session_pair() -> (Arc<Session>, Framed<tokio::io::DuplexStream, EnvelopeCodec>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let connection = Connection::start(local, "pipe", ConnectionConfig::default());
        let session = Hive::new().insert(NewSession::default(), connection);
        (session, Framed::new(remote, EnvelopeCodec::new()))
    }

    #[tokio::test]
    async fn test_unsolicited_goes_to_handler() {
        let (session, mut agent) = session_pair();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handler = MockUnsolicitedHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(move |_, envelope| {
                let _ = tx.send(envelope.kind);
            });

        let dispatcher = spawn_dispatcher(session.clone(), Some(Arc::new(handler)));

        agent.send(Envelope::new("beacon-checkin", vec![])).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "beacon-checkin");

        drop(agent);
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped() {
        let (session, mut agent) = session_pair();

        let mut handler = MockUnsolicitedHandler::new();
        handler.expect_handle().times(0);

        let dispatcher = spawn_dispatcher(session.clone(), Some(Arc::new(handler)));

        agent
            .send(Envelope::new("ping", vec![]).with_id("expired"))
            .await
            .unwrap();
        drop(agent);

        dispatcher.await.unwrap();
        assert_eq!(session.pending().count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiting_requests() {
        let (session, mut agent) = session_pair();
        let _dispatcher = spawn_dispatcher(session.clone(), None);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                Correlator::default()
                    .request(Some(&session), "ls", Vec::new())
                    .await
            })
        };

        // Wait until the request is on the wire, then hang up
        agent.next().await.unwrap().unwrap();
        drop(agent);

        assert!(matches!(waiter.await.unwrap(), Err(RequestError::Closed)));
        assert_eq!(session.pending().count(), 0);
    }
}
