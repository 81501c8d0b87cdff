//! Live agent sessions

use crate::pending_requests::PendingRequests;
use chrono::{DateTime, Utc};
use outpost_proto::Register;
use outpost_transport::{Connection, Tunnel, TunnelError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identity an agent reports during registration, plus where it came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSession {
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub uid: String,
    pub gid: String,
    pub os: String,
    pub arch: String,
    pub pid: i32,
    pub filename: String,
    pub remote_address: String,
    /// Transport the agent connected over (e.g. "tcp", "tls")
    pub transport: String,
}

impl NewSession {
    pub fn from_register(
        register: Register,
        remote_address: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            name: register.name,
            hostname: register.hostname,
            username: register.username,
            uid: register.uid,
            gid: register.gid,
            os: register.os,
            arch: register.arch,
            pid: register.pid,
            filename: register.filename,
            remote_address: remote_address.into(),
            transport: transport.into(),
        }
    }
}

/// Snapshot of a session's identity, safe to hand out without the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: u32,
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub uid: String,
    pub gid: String,
    pub os: String,
    pub arch: String,
    pub pid: i32,
    pub filename: String,
    pub remote_address: String,
    pub transport: String,
    pub connected_at: DateTime<Utc>,
}

/// A registered agent and its live connection
pub struct Session {
    info: SessionInfo,
    connection: Arc<Connection>,
    pending: PendingRequests,
}

impl Session {
    pub(crate) fn new(id: u32, name: String, new: NewSession, connection: Arc<Connection>) -> Self {
        Self {
            info: SessionInfo {
                id,
                name,
                hostname: new.hostname,
                username: new.username,
                uid: new.uid,
                gid: new.gid,
                os: new.os,
                arch: new.arch,
                pid: new.pid,
                filename: new.filename,
                remote_address: new.remote_address,
                transport: new.transport,
                connected_at: Utc::now(),
            },
            connection,
            pending: PendingRequests::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Requests on this session still waiting for a reply
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn is_alive(&self) -> bool {
        !self.connection.is_closed()
    }

    /// Open a tunnel to this agent over its connection
    pub fn open_tunnel(&self) -> Result<Tunnel, TunnelError> {
        self.connection.open_tunnel()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("remote_address", &self.info.remote_address)
            .field("pending", &self.pending.count())
            .finish()
    }
}
