//! Pending requests tracker
//!
//! Tracks requests sent to an agent and routes replies back to the callers
//! waiting on them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use outpost_proto::Envelope;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Tracks requests awaiting a reply, keyed by correlation id
#[derive(Clone)]
pub struct PendingRequests {
    /// Maps correlation id -> oneshot sender for the reply
    requests: Arc<DashMap<String, oneshot::Sender<Envelope>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request
    /// Returns a receiver for the reply, or None if the id is already waiting
    pub fn register(&self, id: &str) -> Option<oneshot::Receiver<Envelope>> {
        match self.requests.entry(id.to_string()) {
            Entry::Occupied(_) => {
                warn!("Correlation id {} is already pending", id);
                None
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                debug!("Registered pending request {}", id);
                Some(rx)
            }
        }
    }

    /// Send a reply for a pending request
    /// Returns true if the reply was delivered, false if the request wasn't found
    pub fn respond(&self, id: &str, reply: Envelope) -> bool {
        if let Some((_, tx)) = self.requests.remove(id) {
            debug!("Routing reply for request {}", id);
            if tx.send(reply).is_err() {
                warn!("Failed to deliver reply for request {} - caller gone", id);
                return false;
            }
            return true;
        }
        debug!("No pending request found for {}", id);
        false
    }

    /// Cancel a pending request (e.g., on timeout or error)
    pub fn cancel(&self, id: &str) {
        if self.requests.remove(id).is_some() {
            debug!("Cancelled pending request {}", id);
        }
    }

    /// Drop every waiter so callers wake with a closed slot
    pub fn fail_all(&self) -> usize {
        let count = self.requests.len();
        self.requests.clear();
        if count > 0 {
            debug!("Failed {} pending requests", count);
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.requests.contains_key(id)
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
